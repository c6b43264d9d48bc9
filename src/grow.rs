//! The inode-count increase transaction.
//!
//! Raising inodes-per-group means every group needs a bigger inode table at
//! a fresh location. Tables are allocated where room exists; inodes are
//! migrated group by group; fully evacuated old tables are released in both
//! views, freeing space for the next round; when no room is left, the
//! block-relocation engine evacuates data blocks. The loop runs until every
//! group is filled or an iteration makes no progress.

use crate::cluster::free_itable_range;
use crate::relocate::make_room_for_new_itables;
use crate::resize::Pass;
use crate::resize::ProgressFn;
use crate::resize::Resize;
use crate::resize::TableStatus;
use crate::resize::DEBUG_ITABLEMOVE;
use crate::rewrite::inode_in_use;
use ext4::extent::fix_extents_checksums;
use ext4::fs::Ext4Fs;
use ext4::io::IoChannel;
use ext4::sb::STATE_ERROR;
use ext4::Error;
use ext4::Group;
use ext4::Ino;
use ext4::Result;

/// Raises the filesystem's inodes-per-group to `new_ipg`.
///
/// On success the new view's superblock is written out with the error-state
/// bit cleared; on failure the bit stays set, directing the user to run a
/// checker.
pub fn increase_inode_count(
    io: &mut IoChannel,
    mut fs: Ext4Fs,
    flags: u32,
    progress: Option<&mut ProgressFn<'_>>,
    new_ipg: u32,
) -> Result<u32> {
    fs.read_bitmaps(io)?;

    // A crash from here on leaves a filesystem that demands a check
    fs.sb.s_state |= STATE_ERROR;
    fs.mark_super_dirty();
    fs.write_super(io)?;
    io.flush()?;

    fs.fix_uninit_block_bitmaps();

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

    grow_tables(&mut rfs)?;

    rfs.new.fix_sb_journal_backup(rfs.io)?;
    rfs.new.set_gdt_csum();
    rfs.new.sb.s_state &= !STATE_ERROR;
    rfs.new.mark_super_dirty();
    rfs.new.flush(rfs.io)?;

    let count = rfs.new.sb.s_inodes_count;
    Ok(count)
}

/// The allocate/migrate/free/relocate loop.
fn grow_tables(rfs: &mut Resize<'_>) -> Result<()> {
    let groups = rfs.new.groups;

    let mut status = vec![TableStatus::NotAllocated; groups as usize];
    let mut old_table_freed = vec![false; groups as usize];
    let mut dir_count = vec![0u32; groups as usize];
    let mut free_inode_count = vec![0u32; groups as usize];
    let mut migrated = vec![false; groups as usize];

    let mut prev_allocated = 0usize;
    let mut iteration = 0u32;
    loop {
        iteration += 1;
        if iteration > groups + 1 {
            return Err(Error::NoProgress);
        }
        rfs.progress(Pass::ExtendItable, iteration as u64, groups as u64)?;

        // Try to place a table for every group still lacking one
        for g in 0..groups {
            if status[g as usize] != TableStatus::NotAllocated {
                continue;
            }
            rfs.new.set_inode_table_loc(g, 0);
            let old_map = &mut rfs.old.block_map;
            match rfs.new.allocate_group_table(g, old_map) {
                Ok(()) => {
                    let start = rfs.new.inode_table_loc(g);
                    let len = rfs.new.inode_blocks_per_group as u64;
                    let first = rfs.new.b2c(start);
                    let last = rfs.new.b2c(start + len - 1);
                    rfs.new.block_map.mark_range(first, last - first + 1);
                    if !rfs.new.sb.has_flex_bg() {
                        // The flex placer updates statistics itself; do it
                        // here otherwise
                        rfs.new.block_alloc_stats_range(start, len, 1);
                    }
                    rfs.new.zero_blocks(rfs.io, start, len)?;
                    status[g as usize] = TableStatus::Allocated;
                    rfs.debug(
                        DEBUG_ITABLEMOVE,
                        format_args!("group {g}: new inode table at block {start}"),
                    );
                }
                Err(Error::NoSpace(_)) => {
                    rfs.debug(
                        DEBUG_ITABLEMOVE,
                        format_args!("group {g}: no room for its inode table yet"),
                    );
                }
                Err(e) => return Err(e),
            }
        }

        migrate_inodes(
            rfs,
            &mut status,
            &mut migrated,
            &mut dir_count,
            &mut free_inode_count,
        )?;
        free_evacuated_tables(rfs, &mut old_table_freed, &migrated)?;
        rfs.io.flush()?;

        let allocated = status
            .iter()
            .filter(|s| **s != TableStatus::NotAllocated)
            .count();
        if allocated == groups as usize {
            break;
        }
        if allocated == prev_allocated && iteration > 1 {
            return Err(Error::NoProgress);
        }
        prev_allocated = allocated;

        make_room_for_new_itables(rfs, &status, &migrated)?;
    }

    // Fix the group statistics, enlarge the inode bitmap and recompute the
    // superblock's free inode count
    let mut total_free = 0u64;
    for g in 0..groups {
        total_free += free_inode_count[g as usize] as u64;
        if rfs.new.bg_used_dirs_count(g) != dir_count[g as usize] {
            rfs.new.bg_used_dirs_count_set(g, dir_count[g as usize]);
            rfs.new.desc_csum_set(g);
        }
        if rfs.new.bg_free_inodes_count(g) != free_inode_count[g as usize] {
            rfs.new
                .bg_free_inodes_count_set(g, free_inode_count[g as usize]);
            rfs.new.desc_csum_set(g);
        }
    }
    let new_count = rfs.new.sb.s_inodes_count;
    rfs.new.resize_inode_map(new_count);
    rfs.new.sb.s_free_inodes_count = total_free as u32;
    rfs.new.mark_super_dirty();
    Ok(())
}

/// Migrates the inodes of every freshly allocated group into its new table,
/// in ascending inode order.
fn migrate_inodes(
    rfs: &mut Resize<'_>,
    status: &mut [TableStatus],
    migrated: &mut [bool],
    dir_count: &mut [u32],
    free_inode_count: &mut [u32],
) -> Result<()> {
    let groups = rfs.new.groups;
    let old_count = rfs.old.sb.s_inodes_count;
    let new_ipg = rfs.new.sb.s_inodes_per_group;
    let metadata_csum = rfs.new.sb.has_metadata_csum();
    rfs.old.ignore_csum_errors = true;

    let res = (|| -> Result<()> {
        for g in 0..groups {
            if status[g as usize] != TableStatus::Allocated {
                continue;
            }
            let mut dirs = 0u32;
            let mut free = 0u32;
            for pos in 0..new_ipg {
                let ino: Ino = g * new_ipg + pos + 1;
                if ino > old_count {
                    // The rest of the group's slots never existed before;
                    // the table was zeroed at allocation
                    free += new_ipg - pos;
                    break;
                }
                let mut ibuf = rfs.old.read_inode_full(rfs.io, ino)?;
                let (links, is_dir, has_extents) = {
                    let inode = ibuf.inode();
                    let links = inode.i_links_count;
                    let flags = inode.i_flags;
                    (
                        links,
                        inode.is_dir(),
                        flags & ext4::inode::EXTENTS_FL != 0,
                    )
                };
                let first_ino = rfs.new.sb.first_ino();
                if !inode_in_use(links, ino) && ino >= first_ino {
                    free += 1;
                } else {
                    if is_dir {
                        dirs += 1;
                    }
                    rfs.new.inode_map.mark(ino as u64);
                }
                rfs.new.write_inode_full(rfs.io, ino, &mut ibuf)?;
                if metadata_csum && has_extents && inode_in_use(links, ino) {
                    fix_extents_checksums(rfs.io, &rfs.new, ino, &ibuf)?;
                }
            }
            dir_count[g as usize] = dirs;
            free_inode_count[g as usize] = free;
            status[g as usize] = TableStatus::Filled;
            migrated[g as usize] = true;
            rfs.progress(Pass::InodeScan, g as u64 + 1, groups as u64)?;
        }
        Ok(())
    })();

    rfs.old.ignore_csum_errors = false;
    res
}

/// Releases the old inode table of every group whose inodes have all been
/// migrated, in both views.
fn free_evacuated_tables(
    rfs: &mut Resize<'_>,
    old_table_freed: &mut [bool],
    migrated: &[bool],
) -> Result<()> {
    let groups = rfs.old.groups;
    let old_ipg = rfs.old.sb.s_inodes_per_group;
    let old_count = rfs.old.sb.s_inodes_count;
    let new_ipg = rfs.new.sb.s_inodes_per_group;
    let old_len = rfs.old.inode_blocks_per_group as u64;

    for h in 0..groups {
        if old_table_freed[h as usize] {
            continue;
        }
        // The old table of group `h` holds old inodes
        // `h * old_ipg + 1 ..= (h + 1) * old_ipg`; it is evacuated once
        // every new-geometry group covering that range is migrated
        let first_ino = (h as u64 * old_ipg as u64 + 1).min(old_count as u64);
        let last_ino = ((h as u64 + 1) * old_ipg as u64).min(old_count as u64);
        let first_target: Group = ((first_ino - 1) / new_ipg as u64) as Group;
        let last_target: Group = ((last_ino - 1) / new_ipg as u64) as Group;
        let evacuated = (first_target..=last_target).all(|t| migrated[t as usize]);
        if !evacuated {
            continue;
        }

        let old_loc = rfs.old.inode_table_loc(h);
        let new_loc = rfs.new.inode_table_loc(h);
        if old_loc == 0 || old_loc == new_loc {
            old_table_freed[h as usize] = true;
            continue;
        }
        rfs.debug(
            DEBUG_ITABLEMOVE,
            format_args!("group {h}: releasing old inode table at block {old_loc}"),
        );
        free_itable_range(&mut rfs.new, old_loc, old_len);
        free_itable_range(&mut rfs.old, old_loc, old_len);
        rfs.old.set_inode_table_loc(h, 0);
        old_table_freed[h as usize] = true;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::shrink::reduce_inode_count;
    use crate::testfs::assert_pattern;
    use crate::testfs::check_bitmap_sums;
    use crate::testfs::data_blocks;
    use crate::testfs::fill_pattern;
    use crate::testfs::image;
    use ext4::imgfmt::add_dir;
    use ext4::imgfmt::add_file;
    use ext4::imgfmt::alloc_block;
    use ext4::imgfmt::Ext4Factory;
    use ext4::sb::STATE_ERROR;
    use ext4::Blk;

    #[test]
    fn grow_without_relocation() {
        // 4 sparse groups; every new table fits in its group's free space
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 32768,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 2048,
            inode_size: 256,
            ..Default::default()
        });
        for i in 0..88u32 {
            let blk = alloc_block(&mut fs).unwrap();
            add_file(&mut io, &mut fs, 11 + i, &[(0, 1, blk)]).unwrap();
        }
        add_dir(&mut io, &mut fs, 99, 2, &[]).unwrap();
        add_dir(&mut io, &mut fs, 100, 2, &[]).unwrap();
        fs.flush(&mut io).unwrap();

        let mut old_bytes = Vec::new();
        for ino in 1..=100 {
            old_bytes.push(fs.read_inode_full(&mut io, ino).unwrap().raw().to_vec());
        }
        let old_tables: Vec<Blk> = (0..4).map(|g| fs.inode_table_loc(g)).collect();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = increase_inode_count(&mut io, fs, 0, None, 4096).unwrap();
        assert_eq!(count, 16384);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        let ipg = after.sb.s_inodes_per_group;
        let inodes_count = after.sb.s_inodes_count;
        let free_inodes = after.sb.s_free_inodes_count;
        assert_eq!(ipg, 4096);
        assert_eq!(inodes_count, 16384);
        assert_eq!(free_inodes, 16384 - 100);
        check_bitmap_sums(&after);

        // Every inode survived byte-identical
        for (i, bytes) in old_bytes.iter().enumerate() {
            let ibuf = after.read_inode_full(&mut io, i as u32 + 1).unwrap();
            assert_eq!(ibuf.raw(), &bytes[..], "inode {}", i + 1);
        }
        // Every table moved, every old table was released
        for g in 0..4 {
            let loc = after.inode_table_loc(g);
            assert_ne!(loc, old_tables[g as usize]);
            for b in loc..loc + after.inode_blocks_per_group as u64 {
                assert!(after.test_block(&after.block_map, b));
            }
            assert!(!after.test_block(&after.block_map, old_tables[g as usize]));
        }
    }

    #[test]
    fn grow_with_relocation() {
        // Every free gap is smaller than the new table, so data blocks must
        // be evacuated
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
            inode_size: 256,
            ..Default::default()
        });

        let mut runs: Vec<(u32, u16, Blk)> = Vec::new();
        let mut logical = 0u32;
        for g in 0..2u32 {
            let start = fs.inode_table_loc(g) + fs.inode_blocks_per_group as u64 + 50;
            let last = fs.group_last_block(g);
            let mut blk = start;
            // Leave no free gap of 512 blocks anywhere, so the new tables
            // cannot be placed without evacuating data
            while blk + 360 <= last {
                runs.push((logical, 360, blk));
                logical += 360;
                blk += 500;
            }
        }
        add_file(&mut io, &mut fs, 11, &runs).unwrap();
        for (logical, len, start) in &runs {
            for j in 0..*len as u64 {
                fill_pattern(&mut io, 1024, start + j, *logical as u64 + j);
            }
        }
        fs.flush(&mut io).unwrap();
        let before: Vec<(u64, Blk)> = data_blocks(&mut io, &fs, 11);

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = increase_inode_count(&mut io, fs, 0, None, 2048).unwrap();
        assert_eq!(count, 4096);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&after);

        // The new tables are in place and every file block still carries
        // its data, wherever it ended up
        let blocks = data_blocks(&mut io, &after, 11);
        assert_eq!(blocks.len(), before.len());
        assert_ne!(blocks, before, "relocation should have moved something");
        for (logical, blk) in &blocks {
            assert_pattern(&mut io, 1024, *blk, *logical);
            for g in 0..2 {
                let loc = after.inode_table_loc(g);
                let len = after.inode_blocks_per_group as u64;
                assert!(
                    *blk < loc || *blk >= loc + len,
                    "block {blk} lies inside the new table of group {g}"
                );
            }
        }
    }

    #[test]
    fn grow_flex_with_metadata_csum() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 4096,
            inodes_per_group: 256,
            inode_size: 256,
            log_groups_per_flex: 2,
            metadata_csum: true,
            ..Default::default()
        });
        for i in 0..20u32 {
            let blk = alloc_block(&mut fs).unwrap();
            add_file(&mut io, &mut fs, 11 + i, &[(0, 1, blk)]).unwrap();
        }
        add_dir(&mut io, &mut fs, 40, 2, &[]).unwrap();
        fs.flush(&mut io).unwrap();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let count = increase_inode_count(&mut io, fs, 0, None, 512).unwrap();
        assert_eq!(count, 2048);

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&after);

        // Checksums are verified on every read here
        for ino in 1..=40 {
            let ibuf = after.read_inode_full(&mut io, ino).unwrap();
            if ino == 40 {
                assert!(ibuf.inode().is_dir());
            }
        }
        assert_eq!(after.bg_used_dirs_count(0), 2);
    }

    #[test]
    fn grow_fails_when_no_room_can_be_made() {
        // One group, almost fully occupied: relocation has nowhere to move
        // the victims
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 2048,
            block_size: 1024,
            blocks_per_group: 2048,
            inodes_per_group: 16,
            inode_size: 256,
            ..Default::default()
        });
        // Fill all but a handful of blocks
        let start = fs.inode_table_loc(0) + fs.inode_blocks_per_group as u64 + 2;
        let len = (fs.group_last_block(0) - start - 10) as u16;
        add_file(&mut io, &mut fs, 11, &[(0, len, start)]).unwrap();
        fs.flush(&mut io).unwrap();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let err = increase_inode_count(&mut io, fs, 0, None, 512).unwrap_err();
        assert!(matches!(
            err,
            ext4::Error::NoSpace(_) | ext4::Error::NoProgress
        ));

        // The error-state bit stays set, directing the user to a checker
        let after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        let state = after.sb.s_state;
        assert!(state & STATE_ERROR != 0);
    }

    #[test]
    fn grow_then_shrink_restores_capacity() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 1024,
            inode_size: 256,
            gdt_csum: true,
            ..Default::default()
        });
        for i in 0..30u32 {
            let blk = alloc_block(&mut fs).unwrap();
            add_file(&mut io, &mut fs, 11 + i, &[(0, 1, blk)]).unwrap();
        }
        add_dir(&mut io, &mut fs, 41, 2, &[]).unwrap();
        fs.flush(&mut io).unwrap();

        let inodes_count = fs.sb.s_inodes_count;
        let free_inodes = fs.sb.s_free_inodes_count;
        let used_dirs: Vec<u32> = (0..2).map(|g| fs.bg_used_dirs_count(g)).collect();

        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        increase_inode_count(&mut io, fs, 0, None, 2048).unwrap();
        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        reduce_inode_count(&mut io, fs, 0, None, 1024).unwrap();

        let mut after = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        after.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&after);
        let after_count = after.sb.s_inodes_count;
        let after_free = after.sb.s_free_inodes_count;
        assert_eq!(after_count, inodes_count);
        assert_eq!(after_free, free_inodes);
        let after_dirs: Vec<u32> = (0..2).map(|g| after.bg_used_dirs_count(g)).collect();
        assert_eq!(after_dirs, used_dirs);
    }

    #[test]
    fn grow_reports_progress() {
        let (mut io, mut fs) = image(Ext4Factory {
            blocks: 8192,
            block_size: 1024,
            blocks_per_group: 8192,
            inodes_per_group: 512,
            inode_size: 256,
            ..Default::default()
        });
        let blk = alloc_block(&mut fs).unwrap();
        add_file(&mut io, &mut fs, 11, &[(0, 1, blk)]).unwrap();
        fs.flush(&mut io).unwrap();

        let mut calls = Vec::new();
        let mut cb = |pass: Pass, cur: u64, max: u64| -> Result<()> {
            calls.push((pass, cur, max));
            Ok(())
        };
        let fs = ext4::fs::Ext4Fs::open(&mut io).unwrap();
        increase_inode_count(&mut io, fs, 0, Some(&mut cb), 1024).unwrap();
        assert!(calls.iter().any(|(p, _, _)| *p == Pass::ExtendItable));
        assert!(calls.iter().any(|(p, _, _)| *p == Pass::InodeScan));
    }
}
