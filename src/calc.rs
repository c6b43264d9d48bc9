//! Turning a requested inode count or bytes-per-inode ratio into a
//! validated inodes-per-group value.

use ext4::badblocks::BadblocksList;
use ext4::bitmap::Bitmap;
use ext4::fs::Ext4Fs;
use ext4::io::IoChannel;
use ext4::Error;
use ext4::Result;
use std::fmt;

/// The requested target, from `-c` or `-r`.
#[derive(Clone, Copy, Debug)]
pub enum Target {
    /// An absolute inode count.
    Count(u64),
    /// A bytes-per-inode ratio.
    Ratio(u64),
}

/// Outcome of the pre-flight calculation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Outcome {
    /// The target rounds to the current geometry; nothing to do.
    NoChange,
    /// The validated new inodes-per-group value.
    Change(u32),
}

/// A byte amount printed in binary units, KiB and up.
struct Size(u64);

impl fmt::Display for Size {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kib = self.0 as f64 / 1024.0;
        if kib >= 1024.0 * 1024.0 {
            write!(fmt, "{:.2} GiB", kib / (1024.0 * 1024.0))
        } else if kib >= 1024.0 {
            write!(fmt, "{:.2} MiB", kib / 1024.0)
        } else {
            write!(fmt, "{kib:.2} KiB")
        }
    }
}

/// Computes and validates the new inodes-per-group for `target`, printing
/// the pre-flight report.
///
/// Mirrors the rounding the formatter applies at creation time: inodes per
/// group are a multiple of 8, inode tables fill their last block, and with
/// `bigalloc` a growing table fills its last cluster.
pub fn calculate_new_inodes_per_group(
    fs: &Ext4Fs,
    target: Target,
    force: bool,
) -> Result<Outcome> {
    let bs = fs.blocksize as u64;
    let inode_size = fs.sb.inode_size() as u64;
    let groups = fs.groups as u64;
    let blocks = fs.sb.blocks_count();
    let inodes_count = fs.sb.s_inodes_count as u64;
    let free_inodes = fs.sb.s_free_inodes_count as u64;
    let required_inodes = inodes_count - free_inodes;
    let first_ino = fs.sb.first_ino() as u64;
    let ratio_blocks = fs.cluster_ratio() as u64;
    // The inode bitmap is one block; it bounds the table size
    let max_ibpg = bs * 8 * inode_size / bs;

    let current_table_space = fs.inode_blocks_per_group as u64 * groups * bs;
    let free_space = fs.sb.free_blocks_count() * ratio_blocks * bs;
    println!("Current inode count: {inodes_count}");
    println!(
        "Current inode ratio: {} bytes-per-inode",
        blocks * bs / inodes_count
    );
    let cur_ipg = fs.sb.s_inodes_per_group;
    println!("Current inodes per group: {cur_ipg}");
    println!(
        "Current space used by inode tables: {}",
        Size(current_table_space)
    );
    println!("Inodes currently used by the filesystem: {required_inodes}");
    println!("Current free space: {}", Size(free_space));

    let mut new_ipg = match target {
        Target::Count(count) => {
            if count < first_ino + 1 {
                return Err(Error::Aborted(format!(
                    "the requested inode count is too low, minimum is {}",
                    first_ino + 1
                )));
            }
            if count > u32::MAX as u64 {
                return Err(Error::Aborted(format!(
                    "the requested inode count is too high, maximum is {}",
                    u32::MAX
                )));
            }
            println!("Inode count requested by the user: {count}");
            count.div_ceil(groups)
        }
        Target::Ratio(ratio) => {
            if ratio == 0 {
                return Err(Error::Aborted("the inode ratio cannot be zero".into()));
            }
            println!("Inode ratio requested by the user: {ratio} bytes-per-inode");
            (blocks * bs).div_ceil(ratio).div_ceil(groups)
        }
    };

    // Keep inodes per group a multiple of 8, so bitmap splicing stays
    // byte-aligned
    if new_ipg < 8 {
        new_ipg = 8;
    } else if new_ipg % 8 != 0 {
        new_ipg = (new_ipg & !7) + 8;
    }
    let mut ibpg = (new_ipg * inode_size).div_ceil(bs);

    if fs.sb.has_bigalloc()
        && ibpg > fs.inode_blocks_per_group as u64
        && ibpg % ratio_blocks != 0
    {
        // Growing tables get whole clusters; round up so no block of the
        // last cluster is wasted
        ibpg += ratio_blocks - ibpg % ratio_blocks;
    }

    if ibpg < ratio_blocks {
        if fs.sb.has_bigalloc() && ibpg > fs.inode_blocks_per_group as u64 {
            ibpg = ratio_blocks;
        } else if ibpg < 1 {
            ibpg = 1;
        }
    } else if ibpg > max_ibpg {
        println!(
            "Inode blocks per group clamped from {ibpg} to {max_ibpg}: the remaining \
             inodes would not be addressable in the inode bitmap"
        );
        ibpg = max_ibpg;
    }

    let new_count = groups * (ibpg * bs / inode_size);
    if new_count > u32::MAX as u64 {
        return Err(Error::Aborted(format!(
            "the new inode count ({new_count}) is above the maximum ({})",
            u32::MAX
        )));
    }
    if new_count < first_ino + 1 {
        return Err(Error::Aborted("the inode count is too low".into()));
    }
    new_ipg = ibpg * bs / inode_size;
    let max_ipg = bs * 8;
    if new_ipg > max_ipg {
        return Err(Error::Aborted(format!(
            "the new inodes per group ({new_ipg}) is above the maximum ({max_ipg})"
        )));
    }

    println!("New inode count: {new_count}");
    println!(
        "New inode ratio: {} bytes-per-inode",
        blocks * bs / new_count
    );
    println!("New inodes per group: {new_ipg}");
    let new_table_space = ibpg * groups * bs;
    println!("New space used by inode tables: {}", Size(new_table_space));

    if required_inodes > new_count {
        return Err(Error::NotEnoughInodes {
            in_use: required_inodes as u32,
            capacity: new_count as u32,
        });
    }
    if new_count == inodes_count {
        return Ok(Outcome::NoChange);
    }

    if new_count > inodes_count {
        // Growing: make sure the new tables fit comfortably
        let safe_margin = new_table_space / 2;
        if new_table_space + safe_margin > free_space {
            if new_table_space.saturating_sub(current_table_space) > free_space {
                return Err(Error::NoSpace(
                    "it will not be possible to allocate large enough inode tables \
                     for the chosen target"
                        .into(),
                ));
            }
            if !force {
                return Err(Error::NoSpace(
                    "the filesystem does not have enough free space to perform the \
                     change safely; re-run with the force flag to try anyway"
                        .into(),
                ));
            }
            println!("Low free space, continuing because the force flag is set");
        }
    }

    Ok(Outcome::Change(new_ipg as u32))
}

/// Checks that the last group holds enough movable blocks for one new inode
/// table; without `flex_bg` that group has nowhere else to put it.
pub fn check_space_last_group(
    io: &mut IoChannel,
    fs: &Ext4Fs,
    new_inode_blocks_per_group: u64,
) -> Result<()> {
    let mut meta_bmap = Bitmap::new(fs.block_map.start(), fs.block_map.end());
    fs.mark_table_blocks(&mut meta_bmap);
    let badblocks = BadblocksList::load(io, fs)?;

    let last = fs.groups - 1;
    let mut movable_blocks = 0u64;
    for b in fs.group_first_block(last)..fs.sb.blocks_count() {
        if !fs.test_block(&meta_bmap, b) && !badblocks.test(b) {
            movable_blocks += 1;
        }
    }

    if movable_blocks >= new_inode_blocks_per_group {
        return Ok(());
    }

    let mut msg = format!(
        "the last group only has {movable_blocks} movable blocks, not enough for a \
         new inode table of {new_inode_blocks_per_group} blocks.\nYou may try first:\n"
    );
    if !fs.sb.has_flex_bg() {
        msg.push_str(" - setting the flex_bg feature and a log_groups_per_flex value\n");
    } else {
        let log = fs.sb.s_log_groups_per_flex;
        if log == 0 {
            msg.push_str(" - setting a non-zero log_groups_per_flex value\n");
        }
    }
    msg.push_str(&format!(
        " - growing the filesystem by at least {} blocks\n",
        new_inode_blocks_per_group - movable_blocks
    ));
    if fs.groups > 1 {
        let bpg = fs.sb.s_blocks_per_group;
        msg.push_str(&format!(
            " - shrinking the filesystem to {} blocks to drop the last group\n",
            bpg as u64 * (fs.groups as u64 - 1)
        ));
    }
    Err(Error::NoSpace(msg))
}

#[cfg(test)]
mod test {
    use super::*;
    use ext4::imgfmt::Ext4Factory;
    use std::io::Cursor;

    fn test_fs() -> (IoChannel, Ext4Fs) {
        let dev = Cursor::new(vec![0u8; 32 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        let fs = Ext4Factory {
            blocks: 32768,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            inode_size: 256,
            ..Default::default()
        }
        .create(&mut io)
        .unwrap();
        (io, fs)
    }

    #[test]
    fn count_rounds_to_multiple_of_eight() {
        let (_io, fs) = test_fs();
        // 16385 inodes over 4 groups -> 4097 per group -> rounded to 4104,
        // then to a full table block (16 inodes per 1024-byte block with
        // 256-byte inodes)
        let outcome =
            calculate_new_inodes_per_group(&fs, Target::Count(16385), false).unwrap();
        let Outcome::Change(ipg) = outcome else {
            panic!("expected a change");
        };
        assert_eq!(ipg % 8, 0);
        assert!(ipg >= 4097);
        // Full table blocks: 256-byte inodes, 4 per block
        assert_eq!(ipg * 256 % 1024, 0);
    }

    #[test]
    fn noop_when_target_matches() {
        let (_io, fs) = test_fs();
        let outcome =
            calculate_new_inodes_per_group(&fs, Target::Count(8192), false).unwrap();
        assert_eq!(outcome, Outcome::NoChange);
    }

    #[test]
    fn rejects_too_low_count() {
        let (_io, fs) = test_fs();
        assert!(calculate_new_inodes_per_group(&fs, Target::Count(4), false).is_err());
    }

    #[test]
    fn rejects_count_below_usage() {
        let (mut io, mut fs) = test_fs();
        fs.read_bitmaps(&mut io).unwrap();
        // Fabricate heavy inode usage
        fs.sb.s_free_inodes_count = 100;
        let err =
            calculate_new_inodes_per_group(&fs, Target::Count(1024), false).unwrap_err();
        assert!(matches!(err, Error::NotEnoughInodes { .. }));
    }

    #[test]
    fn ratio_target() {
        let (_io, fs) = test_fs();
        // 32768 blocks of 1024 bytes at 1024 bytes-per-inode: 32768 inodes,
        // 8192 per group
        let outcome =
            calculate_new_inodes_per_group(&fs, Target::Ratio(1024), false).unwrap();
        assert_eq!(outcome, Outcome::Change(8192));
    }

    #[test]
    fn last_group_check_passes_on_empty_fs() {
        let (mut io, mut fs) = test_fs();
        fs.read_bitmaps(&mut io).unwrap();
        check_space_last_group(&mut io, &fs, 1024).unwrap();
    }

    #[test]
    fn last_group_check_rejects_tiny_tail_group() {
        // The partial last group is mostly metadata; a new table of 512
        // blocks cannot fit there
        let dev = Cursor::new(vec![0u8; 9 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        let mut fs = Ext4Factory {
            blocks: 8492,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 512,
            inode_size: 256,
            ..Default::default()
        }
        .create(&mut io)
        .unwrap();
        fs.read_bitmaps(&mut io).unwrap();

        let err = check_space_last_group(&mut io, &fs, 512).unwrap_err();
        assert!(matches!(err, Error::NoSpace(_)));
    }
}
