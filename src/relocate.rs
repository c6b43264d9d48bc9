//! The block-relocation engine.
//!
//! When the group-table placer cannot find contiguous room for a group's new
//! inode table, this engine picks a run of occupied blocks, evacuates their
//! contents into scattered free space, and drives the reference rewriter so
//! every inode points at the moved copies. The vacated run is reserved for
//! the upcoming table.

use crate::extmap::ExtentMap;
use crate::resize::Pass;
use crate::resize::Resize;
use crate::resize::TableStatus;
use crate::resize::DEBUG_BMOVE;
use crate::rewrite::update_block_refs;
use ext4::badblocks::BadblocksList;
use ext4::desc::BG_BLOCK_UNINIT;
use ext4::Blk;
use ext4::Error;
use ext4::Result;

/// Makes room for the new inode table of every group still lacking one.
///
/// `status` is the per-group table state; only `NotAllocated` groups are
/// treated. `migrated` is forwarded to the reference rewriter.
pub fn make_room_for_new_itables(
    rfs: &mut Resize<'_>,
    status: &[TableStatus],
    migrated: &[bool],
) -> Result<()> {
    rfs.move_blocks.clear();
    rfs.reserve_blocks.clear();
    let meta_bmap = rfs.build_meta_bitmap();
    let badblocks = BadblocksList::load(rfs.io, &rfs.old)?;

    let need = rfs.new.inode_blocks_per_group as u64;
    let ratio = rfs.old.cluster_ratio() as u64;
    let needed_clusters = need.div_ceil(ratio);
    // Reserved-but-not-yet-evacuated space; never pledge more than the
    // filesystem can absorb
    let mut pledged = 0u64;
    let free_clusters = rfs.old.sb.free_blocks_count();

    let flex = rfs.old.sb.has_flex_bg();
    let flex_size = 1u32 << rfs.old.sb.s_log_groups_per_flex;
    let group_desc_csum = rfs.old.sb.has_group_desc_csum();

    let mut first_blk = 0 as Blk;
    let mut last_blk = 0 as Blk;
    let mut retried_from_beginning = false;

    for g in 0..rfs.old.groups {
        if flex {
            if g % flex_size == 0 {
                let flex_start = g & !(flex_size - 1);
                first_blk = rfs.old.group_first_block(flex_start);
                last_blk = if flex_start + flex_size >= rfs.old.groups {
                    rfs.old.sb.blocks_count() - 1
                } else {
                    rfs.old.group_first_block(flex_start + flex_size) - 1
                };
                retried_from_beginning = false;
            }
        } else {
            first_blk = rfs.old.group_first_block(g);
            last_blk = rfs.old.group_last_block(g);
        }
        if status[g as usize] != TableStatus::NotAllocated {
            continue;
        }
        if pledged + needed_clusters > free_clusters {
            rfs.debug(
                DEBUG_BMOVE,
                format_args!("group {g}: not enough headroom left to pledge a reservation"),
            );
            break;
        }

        loop {
            rfs.debug(
                DEBUG_BMOVE,
                format_args!("making room in group {g}, searching blocks {first_blk}-{last_blk}"),
            );
            let mut found = None;
            let mut blk = first_blk.next_multiple_of(ratio);
            'scan: while blk + need - 1 <= last_blk {
                // Uninitialized block bitmaps were materialized up front;
                // skip such groups anyway, their contents cannot be trusted
                if group_desc_csum
                    && rfs
                        .old
                        .bg_flags_test(rfs.old.group_of_blk(blk), BG_BLOCK_UNINIT)
                {
                    let next_group = rfs.old.group_of_blk(blk) + 1;
                    blk = rfs.old.group_first_block(next_group).next_multiple_of(ratio);
                    continue 'scan;
                }
                for j in 0..need {
                    let b = blk + j;
                    if rfs.old.test_block(&meta_bmap, b)
                        || rfs.old.test_block(&rfs.reserve_blocks, b)
                        || badblocks.test(b)
                    {
                        blk = (b + 1).next_multiple_of(ratio).max(blk + ratio);
                        continue 'scan;
                    }
                }
                found = Some(blk);
                break;
            }

            match found {
                Some(run) => {
                    rfs.debug(
                        DEBUG_BMOVE,
                        format_args!("group {g}: will vacate blocks {run}-{}", run + need - 1),
                    );
                    let move_blocks = &mut rfs.move_blocks;
                    rfs.old.mark_block_range(move_blocks, run, need);
                    let reserve_blocks = &mut rfs.reserve_blocks;
                    rfs.old.mark_block_range(reserve_blocks, run, need);
                    pledged += needed_clusters;
                    // The next group of this flex window searches onwards
                    first_blk = run + need;
                    break;
                }
                None if flex && !retried_from_beginning => {
                    // The placer's own fallback searches from the start of
                    // the filesystem; mirror its window
                    retried_from_beginning = true;
                    first_blk = rfs.old.sb.s_first_data_block as Blk;
                }
                None => {
                    return Err(Error::NoSpace(format!(
                        "unable to locate a suitable area to make room for the \
                         inode table of group {g}"
                    )));
                }
            }
        }
    }

    block_mover(rfs)?;
    if rfs.bmap.is_some() {
        update_block_refs(rfs, migrated)?;
    }

    rfs.reserve_blocks.clear();
    rfs.move_blocks.clear();
    Ok(())
}

/// Moves every block marked for evacuation to freshly allocated space,
/// recording the translation in the transaction's `bmap`.
fn block_mover(rfs: &mut Resize<'_>) -> Result<()> {
    let mut badblocks = BadblocksList::load(rfs.io, &rfs.old)?;
    let chunk = rfs.new.inode_blocks_per_group;
    rfs.ensure_itable_buf(chunk);

    let ratio = rfs.old.cluster_ratio() as u64;
    let mut bmap = ExtentMap::new();
    let mut to_move = 0u64;
    rfs.init_block_alloc();

    let mut blk = rfs.old.c2b(rfs.old.b2c(rfs.old.sb.s_first_data_block as u64));
    while blk < rfs.old.sb.blocks_count() {
        let cluster = rfs.old.b2c(blk);
        if !rfs.old.block_map.test(cluster) || !rfs.move_blocks.test(cluster) {
            blk += ratio;
            continue;
        }
        if badblocks.test(blk) {
            // A bad block sitting where a table will go simply stops being
            // tracked; nothing to copy
            badblocks.del(blk);
            blk += ratio;
            continue;
        }
        let new_blk = rfs.allocate_block()?;
        bmap.add(cluster, rfs.old.b2c(new_blk));
        to_move += 1;
        blk += ratio;
    }

    if to_move == 0 {
        if badblocks.modified() {
            badblocks.store(rfs.io, &rfs.old)?;
        }
        return Ok(());
    }

    rfs.progress(Pass::BlockReloc, 0, to_move)?;
    let mut moved = 0u64;
    for run in bmap.iter() {
        let mut old_blk = rfs.old.c2b(run.old);
        let mut new_blk = rfs.old.c2b(run.new);
        let mut size = run.len * ratio;
        rfs.debug(
            DEBUG_BMOVE,
            format_args!("moving {size} blocks {old_blk}->{new_blk}"),
        );
        while size > 0 {
            let c = size.min(chunk as u64) as u32;
            let buf = &mut rfs.itable_buf;
            rfs.io.read_blocks(old_blk, c, buf)?;
            rfs.io.write_blocks(new_blk, c, buf)?;
            rfs.new.block_alloc_stats_range(old_blk, c as u64, -1);
            rfs.old.block_alloc_stats_range(old_blk, c as u64, -1);
            size -= c as u64;
            old_blk += c as u64;
            new_blk += c as u64;
            moved += c as u64 / ratio;
        }
        rfs.progress(Pass::BlockReloc, moved, to_move)?;
    }
    rfs.io.flush()?;

    if badblocks.modified() {
        badblocks.store(rfs.io, &rfs.old)?;
    }
    rfs.bmap = Some(bmap);
    Ok(())
}
