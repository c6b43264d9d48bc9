//! The inode-count decrease transaction.
//!
//! Shrinking reuses the existing inode tables in place: with fewer inodes
//! per group, an inode's new slot is always at a lower byte offset than its
//! old one, so a single backward migration sweep never overwrites an inode
//! before reading it. No free blocks are required; the operation works even
//! on a completely full filesystem.

use crate::cluster::free_itable_range;
use crate::resize::now;
use crate::resize::Pass;
use crate::resize::ProgressFn;
use crate::resize::Resize;
use crate::resize::DEBUG_INODEMAP;
use crate::resize::DEBUG_ITABLEMOVE;
use crate::rewrite::fix_ea_inode_refs;
use crate::rewrite::inode_in_use;
use crate::rewrite::inode_ref_fix;
use crate::extmap::ExtentMap;
use ext4::dir::DbList;
use ext4::extent::block_iterate;
use ext4::extent::fix_extents_checksums;
use ext4::extent::BlockKind;
use ext4::extent::IterAction;
use ext4::fs::Ext4Fs;
use ext4::inode::EA_INODE_FL;
use ext4::inode::EXTENTS_FL;
use ext4::inode::INLINE_DATA_FL;
use ext4::io::IoChannel;
use ext4::sb::STATE_ERROR;
use ext4::Blk;
use ext4::Error;
use ext4::Ino;
use ext4::Result;

/// Lowers the filesystem's inodes-per-group to `new_ipg`.
pub fn reduce_inode_count(
    io: &mut IoChannel,
    mut fs: Ext4Fs,
    flags: u32,
    progress: Option<&mut ProgressFn<'_>>,
    new_ipg: u32,
) -> Result<u32> {
    if fs.sb.has_stable_inodes() {
        // Renumbering is exactly what this feature forbids
        return Err(Error::FeatureForbidden("stable_inodes"));
    }
    fs.read_bitmaps(io)?;

    fs.sb.s_state |= STATE_ERROR;
    fs.mark_super_dirty();
    fs.write_super(io)?;
    io.flush()?;

    let mut rfs = Resize::new(io, fs, flags);
    if let Some(progress) = progress {
        rfs.set_progress(progress);
    }

    // Publish the new geometry in the new view
    let inode_size = rfs.new.sb.inode_size() as u64;
    let bs = rfs.new.blocksize as u64;
    rfs.new.sb.s_inodes_per_group = new_ipg;
    rfs.new.inode_blocks_per_group = (new_ipg as u64 * inode_size).div_ceil(bs) as u32;
    rfs.new.sb.s_inodes_count = rfs.new.groups * new_ipg;

    let dblist = renumber_high_inodes(&mut rfs)?;
    inode_ref_fix(&mut rfs, &dblist)?;
    rfs.io.flush()?;

    // Reset the per-group inode statistics; the backward migration rebuilds
    // them
    let groups = rfs.new.groups;
    for g in 0..groups {
        rfs.new.bg_used_dirs_count_set(g, 0);
        rfs.new.bg_free_inodes_count_set(g, new_ipg);
        rfs.new.bg_itable_unused_set(g, new_ipg);
    }
    let new_count = rfs.new.sb.s_inodes_count;
    rfs.new.sb.s_free_inodes_count = new_count;
    rfs.new.resize_inode_map(new_count);

    migrate_inodes_backwards(&mut rfs)?;
    repack_and_free_itables(&mut rfs)?;

    rfs.new.set_gdt_csum();
    rfs.new.sb.s_state &= !STATE_ERROR;
    rfs.new.mark_super_dirty();
    rfs.new.flush(rfs.io)?;

    Ok(new_count)
}

/// Moves every in-use inode above the new capacity down to a free number
/// below it, recording the translation, and collects every directory's data
/// blocks for the reference-fix pass.
fn renumber_high_inodes(rfs: &mut Resize<'_>) -> Result<DbList> {
    let old_count = rfs.old.sb.s_inodes_count;
    let free_count = rfs.old.sb.s_free_inodes_count;
    let start_to_move: Ino = rfs.new.groups * rfs.new.sb.s_inodes_per_group;

    let in_use = old_count - free_count;
    if in_use > start_to_move {
        return Err(Error::NotEnoughInodes {
            in_use,
            capacity: start_to_move,
        });
    }

    rfs.progress(Pass::InodeScan, 0, old_count as u64)?;
    let metadata_csum = rfs.old.sb.has_metadata_csum();
    let stamp = now();
    let mut dblist = DbList::new();
    let mut imap = ExtentMap::new();
    let mut ea_inode_moved = false;
    rfs.old.ignore_csum_errors = true;

    let res = (|| -> Result<()> {
        for ino in 1..=old_count {
            let mut ibuf = rfs.old.read_inode_full(rfs.io, ino)?;
            let (links, is_dir, flags) = {
                let inode = ibuf.inode();
                let links = inode.i_links_count;
                let flags = inode.i_flags;
                (links, inode.is_dir(), flags)
            };
            if !inode_in_use(links, ino) {
                continue;
            }

            let new_ino = if ino <= start_to_move {
                ino
            } else {
                // Renumbering must happen before any block is rewritten:
                // extent and directory checksums are keyed by the number
                let new_ino = rfs.old.new_inode()?;
                if new_ino > start_to_move {
                    return Err(Error::RenumberOutOfRange {
                        ino,
                        ceiling: start_to_move,
                    });
                }
                rfs.old.inode_alloc_stats(new_ino, 1, is_dir);
                if flags & EA_INODE_FL != 0 {
                    // The ctime of an extended-attribute inode carries part
                    // of its reference count; leave it alone
                    ea_inode_moved = true;
                } else {
                    let inode = ibuf.inode_mut();
                    inode.i_ctime = stamp;
                }
                rfs.old.write_inode_full(rfs.io, new_ino, &mut ibuf)?;
                imap.add(ino as u64, new_ino as u64);
                rfs.debug(
                    DEBUG_INODEMAP,
                    format_args!("inode moved {ino}->{new_ino}"),
                );
                if metadata_csum && flags & EXTENTS_FL != 0 {
                    fix_extents_checksums(rfs.io, &rfs.old, new_ino, &ibuf)?;
                }
                new_ino
            };

            if is_dir {
                if flags & INLINE_DATA_FL != 0 {
                    dblist.add(new_ino, 0, 0);
                } else if ibuf.inode().has_valid_blocks() {
                    let mut alloc = || -> Result<Blk> { unreachable!() };
                    let mut feed = |blk: Blk, kind: BlockKind| {
                        if let BlockKind::Data(blockcnt) = kind {
                            dblist.add(new_ino, blk, blockcnt);
                        }
                        IterAction::Keep
                    };
                    block_iterate(rfs.io, &rfs.old, new_ino, &mut ibuf, &mut alloc, &mut feed)?;
                }
            }
        }
        Ok(())
    })();
    rfs.old.ignore_csum_errors = false;
    res?;

    if !imap.is_empty() {
        rfs.imap = Some(imap);
    }
    if ea_inode_moved && rfs.old.sb.has_ea_inode() {
        fix_ea_inode_refs(rfs, start_to_move)?;
    }
    rfs.io.flush()?;
    Ok(dblist)
}

/// Copies every inode from the old geometry to the new one, from the
/// highest number down to 1.
///
/// For an inode at group `g`, position `p`, the old number `g·ipg_old + p`
/// always exceeds the new number `g·ipg_new + p`, so each slot is written
/// only after its source has been read. Unused slots are written too,
/// clearing whatever bytes the old layout left there.
fn migrate_inodes_backwards(rfs: &mut Resize<'_>) -> Result<()> {
    let new_count = rfs.new.sb.s_inodes_count;
    let first_ino = rfs.new.sb.first_ino();
    rfs.old.ignore_csum_errors = true;
    rfs.progress(Pass::MoveItable, 0, new_count as u64)?;

    let res = (|| -> Result<()> {
        for ino in (1..=new_count).rev() {
            let mut ibuf = rfs.old.read_inode_full(rfs.io, ino)?;
            let (links, is_dir) = {
                let inode = ibuf.inode();
                let links = inode.i_links_count;
                (links, inode.is_dir())
            };
            if inode_in_use(links, ino) || ino < first_ino {
                rfs.new.inode_alloc_stats(ino, 1, is_dir);
            }
            rfs.new.write_inode_full(rfs.io, ino, &mut ibuf)?;
        }
        Ok(())
    })();

    rfs.old.ignore_csum_errors = false;
    rfs.progress(Pass::MoveItable, new_count as u64, new_count as u64)?;
    res
}

/// Releases the table blocks the shrunken tables no longer need.
///
/// Without `flex_bg`, each group frees the tail of its own table. With
/// `flex_bg`, tables that were physically contiguous in the old layout are
/// packed back-to-back, and the gaps behind them are released.
fn repack_and_free_itables(rfs: &mut Resize<'_>) -> Result<()> {
    let old_ipb = rfs.old.inode_blocks_per_group as u64;
    let new_ipb = rfs.new.inode_blocks_per_group as u64;
    let groups = rfs.new.groups;

    if !rfs.new.sb.has_flex_bg() {
        for g in 0..groups {
            let after = rfs.new.inode_table_loc(g) + new_ipb;
            free_itable_range(&mut rfs.new, after, old_ipb - new_ipb);
        }
        return Ok(());
    }

    let flex_size = 1u32 << rfs.new.sb.s_log_groups_per_flex;
    rfs.ensure_itable_buf(new_ipb as u32);

    let mut flex_start = 0u32;
    while flex_start < groups {
        let mut after_prev = rfs.old.inode_table_loc(flex_start) + new_ipb;
        let mut g = flex_start + 1;
        let flex_end = (flex_start + flex_size).min(groups);
        while g < flex_end {
            let prev_old = rfs.old.inode_table_loc(g - 1);
            let cur_old = rfs.old.inode_table_loc(g);
            if prev_old + old_ipb == cur_old {
                // Contiguous in the old layout: pack this table right after
                // the previous one
                rfs.debug(
                    DEBUG_ITABLEMOVE,
                    format_args!("packing table of group {g} at block {after_prev}"),
                );
                rfs.new.set_inode_table_loc(g, after_prev);
                let buf = &mut rfs.itable_buf;
                rfs.io.read_blocks(cur_old, new_ipb as u32, buf)?;
                rfs.io.write_blocks(after_prev, new_ipb as u32, buf)?;
                rfs.new.desc_csum_set(g);
                after_prev += new_ipb;
            } else {
                // A gap: free what is left of the previous chain
                let free_len = prev_old + old_ipb - after_prev;
                free_itable_range(&mut rfs.new, after_prev, free_len);
                rfs.debug(
                    DEBUG_ITABLEMOVE,
                    format_args!("freeing {free_len} table blocks at {after_prev}"),
                );
                after_prev = cur_old + new_ipb;
            }
            g += 1;
        }
        let prev_old = rfs.old.inode_table_loc(g - 1);
        let free_len = prev_old + old_ipb - after_prev;
        free_itable_range(&mut rfs.new, after_prev, free_len);
        flex_start += flex_size;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::testfs::assert_pattern;
    use crate::testfs::check_bitmap_sums;
    use crate::testfs::dir_entries;
    use crate::testfs::fill_pattern;
    use crate::testfs::image;
    use ext4::imgfmt::add_dir;
    use ext4::imgfmt::add_file;
    use ext4::imgfmt::alloc_block;
    use ext4::imgfmt::Ext4Factory;

    #[test]
    fn shrink_renumbers_high_inodes_and_fixes_directories() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 32768,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 4096,
            inode_size: 256,
            metadata_csum: true,
            ..Default::default()
        });
        for i in 0..20u32 {
            let blk = alloc_block(&mut fs).unwrap();
            add_file(&mut io, &mut fs, 11 + i, &[(0, 1, blk)]).unwrap();
            fill_pattern(&mut io, 1024, blk, 11 + i as u64);
        }
        // Two directories above the future ceiling, pointing at each other
        add_dir(&mut io, &mut fs, 14000, 2, &[("beta", 15000)]).unwrap();
        add_dir(&mut io, &mut fs, 15000, 2, &[("alpha", 14000)]).unwrap();
        fs.flush(&mut io).unwrap();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = reduce_inode_count(&mut io, fs, 0, None, 2048).unwrap();
        assert_eq!(count, 8192);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        let inodes_count = after.sb.s_inodes_count;
        assert_eq!(inodes_count, 8192);
        check_bitmap_sums(&after);

        // No inode above the new ceiling is in use
        for ino in 1..=8192u64 {
            if after.inode_map.test(ino) {
                assert!(ino <= 8192);
            }
        }

        // The two directories were renumbered below the ceiling and their
        // entries follow each other's new numbers
        let mut dirs = Vec::new();
        for ino in 11..=8192u32 {
            if !after.inode_map.test(ino as u64) {
                continue;
            }
            let ibuf = after.read_inode_full(&mut io, ino).unwrap();
            if ibuf.inode().is_dir() {
                dirs.push(ino);
            }
        }
        assert_eq!(dirs.len(), 2);
        let (x, y) = (dirs[0], dirs[1]);
        let x_entries = dir_entries(&mut io, &after, x);
        assert!(x_entries.contains(&(".".to_owned(), x)));
        assert!(x_entries.contains(&("..".to_owned(), 2)));
        assert!(x_entries.contains(&("beta".to_owned(), y)));
        let y_entries = dir_entries(&mut io, &after, y);
        assert!(y_entries.contains(&(".".to_owned(), y)));
        assert!(y_entries.contains(&("alpha".to_owned(), x)));
        assert_eq!(after.bg_used_dirs_count(0), 3);

        // Low-numbered files kept their numbers and data
        for i in 0..20u32 {
            let ibuf = after.read_inode_full(&mut io, 11 + i).unwrap();
            assert!(ibuf.inode().is_regular());
            let blocks = crate::testfs::data_blocks(&mut io, &after, 11 + i);
            assert_eq!(blocks.len(), 1);
            assert_pattern(&mut io, 1024, blocks[0].1, 11 + i as u64);
        }
    }

    #[test]
    fn shrink_rejected_when_not_enough_inodes() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 512,
            inode_size: 256,
            ..Default::default()
        });
        // Occupy 600 inodes; only the counters matter, the capacity check
        // runs before any inode is read
        for ino in 11..=610u32 {
            fs.inode_alloc_stats(ino, 1, false);
        }
        fs.flush(&mut io).unwrap();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let err = reduce_inode_count(&mut io, fs, 0, None, 256).unwrap_err();
        assert!(matches!(err, ext4::Error::NotEnoughInodes { .. }));

        // The geometry is untouched
        let after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let ipg = after.sb.s_inodes_per_group;
        assert_eq!(ipg, 512);
    }

    #[test]
    fn shrink_flex_packs_tables_together() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 4096,
            inodes_per_group: 1024,
            inode_size: 256,
            log_groups_per_flex: 2,
            ..Default::default()
        });
        for i in 0..10u32 {
            let blk = alloc_block(&mut fs).unwrap();
            add_file(&mut io, &mut fs, 11 + i, &[(0, 1, blk)]).unwrap();
        }
        fs.flush(&mut io).unwrap();
        // The formatter lays the four tables of the flex group back to back
        for g in 1..4 {
            assert_eq!(
                fs.inode_table_loc(g),
                fs.inode_table_loc(g - 1) + fs.inode_blocks_per_group as u64
            );
        }
        let free_before = fs.sb.free_blocks_count();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = reduce_inode_count(&mut io, fs, 0, None, 512).unwrap();
        assert_eq!(count, 2048);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&after);

        // Tables are packed back to back again, and the tail was released
        for g in 1..4 {
            assert_eq!(
                after.inode_table_loc(g),
                after.inode_table_loc(g - 1) + after.inode_blocks_per_group as u64
            );
        }
        // 4 groups shrank from 256 to 128 table blocks
        assert_eq!(after.sb.free_blocks_count(), free_before + 4 * 128);

        for ino in 11..=20 {
            let ibuf = after.read_inode_full(&mut io, ino).unwrap();
            assert!(ibuf.inode().is_regular());
        }
    }

    #[test]
    fn shrink_without_renumbering() {
        // All inodes already fit below the new ceiling; only the tables
        // shrink
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            inode_size: 256,
            ..Default::default()
        });
        let blk = alloc_block(&mut fs).unwrap();
        add_file(&mut io, &mut fs, 11, &[(0, 1, blk)]).unwrap();
        fill_pattern(&mut io, 1024, blk, 7);
        fs.flush(&mut io).unwrap();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = reduce_inode_count(&mut io, fs, 0, None, 512).unwrap();
        assert_eq!(count, 1024);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&after);
        let free_inodes = after.sb.s_free_inodes_count;
        assert_eq!(free_inodes, 1024 - 11);
        let blocks = crate::testfs::data_blocks(&mut io, &after, 11);
        assert_pattern(&mut io, 1024, blocks[0].1, 7);
    }
}
