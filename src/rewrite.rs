//! The reference rewriter.
//!
//! Two duties: substituting relocated block numbers inside inode block maps
//! and extent trees (growth), and substituting renumbered inode numbers
//! inside directory entries and extended-attribute entries (shrink).

use crate::extmap::ExtentMap;
use crate::resize::now;
use crate::resize::Pass;
use crate::resize::Resize;
use crate::resize::DEBUG_BMOVE;
use crate::resize::DEBUG_INODEMAP;
use ext4::bitmap::Bitmap;
use ext4::dir::DbList;
use ext4::dir::DirentAction;
use ext4::extent::block_iterate;
use ext4::extent::IterAction;
use ext4::xattr;
use ext4::Blk;
use ext4::Error;
use ext4::Ino;
use ext4::Result;
use ext4::RESIZE_INO;
use std::cell::RefCell;

/// Tells whether an inode record is in use.
///
/// The resize inode has no links but is live.
pub fn inode_in_use(links_count: u16, ino: Ino) -> bool {
    links_count != 0 || ino == RESIZE_INO
}

/// Scratch state shared between the translation callback and the block
/// allocator while one inode's references are being rewritten.
struct AllocScratch {
    /// Next candidate block.
    cursor: Blk,
    /// The scan already wrapped around once.
    wrapped: bool,
    /// Clusters handed out during this pass.
    fresh: Bitmap,
    /// Blocks handed out, pending statistics update in both views.
    allocated: Vec<Blk>,
}

/// Rewrites every inode's block references through the block translation
/// table, after the block mover ran.
///
/// `migrated` tells, per new-geometry group, whether its inodes already live
/// in the new view's table; such inodes are read from and written to the new
/// view.
///
/// Consumes the transaction's `bmap`: once every reference is rewritten, the
/// translation has been fully applied.
pub fn update_block_refs(rfs: &mut Resize<'_>, migrated: &[bool]) -> Result<()> {
    let Some(bmap) = rfs.bmap.take() else {
        return Ok(());
    };

    let old_count = rfs.old.sb.s_inodes_count;
    let groups = rfs.old.groups as u64;
    rfs.progress(Pass::InodeScan, 0, groups)?;
    rfs.fresh_blocks.clear();
    rfs.old.ignore_csum_errors = true;
    rfs.new.ignore_csum_errors = true;

    let res = update_block_refs_inner(rfs, &bmap, migrated, old_count);

    rfs.old.ignore_csum_errors = false;
    rfs.new.ignore_csum_errors = false;
    rfs.io.flush()?;
    res
}

fn update_block_refs_inner(
    rfs: &mut Resize<'_>,
    bmap: &ExtentMap,
    migrated: &[bool],
    old_count: u32,
) -> Result<()> {
    let new_ipg = rfs.new.sb.s_inodes_per_group;
    let cluster_log = rfs.old.cluster_log;
    let ratio = 1u64 << cluster_log;
    let first_data_block = rfs.old.sb.s_first_data_block as u64;
    let blocks_count = rfs.old.sb.blocks_count();

    let scratch = RefCell::new(AllocScratch {
        cursor: first_data_block,
        wrapped: false,
        fresh: Bitmap::new(rfs.old.block_map.start(), rfs.old.block_map.end()),
        allocated: Vec::new(),
    });

    for ino in 1..=old_count {
        let target_group = ((ino - 1) / new_ipg) as usize;
        let use_new = migrated.get(target_group).copied().unwrap_or(false);

        let view = if use_new { &rfs.new } else { &rfs.old };
        let mut ibuf = view.read_inode_full(rfs.io, ino)?;
        {
            let inode = ibuf.inode();
            let links = inode.i_links_count;
            if !inode_in_use(links, ino) {
                continue;
            }
        }

        let mut changed = false;

        // Remap the extended attribute block. Its checksum is keyed by the
        // block number, so the copied contents are refreshed at the new
        // location.
        let acl = ibuf.inode().file_acl();
        if acl != 0 {
            let fresh = scratch.borrow().fresh.test(acl >> cluster_log);
            if !fresh && !rfs.fresh_blocks.test(acl >> cluster_log) {
                if let Some(new_cluster) = bmap.translate(acl >> cluster_log) {
                    let new_acl = (new_cluster << cluster_log) + acl % ratio;
                    let view = if use_new { &rfs.new } else { &rfs.old };
                    let mut buf = xattr::read_block(rfs.io, view, new_acl)
                        .or_else(|_| xattr::read_block(rfs.io, view, acl))?;
                    xattr::write_block(rfs.io, view, new_acl, &mut buf)?;
                    ibuf.inode_mut().set_file_acl(new_acl);
                    changed = true;
                    rfs.debug(
                        DEBUG_BMOVE,
                        format_args!("ino={ino}, acl block {acl}->{new_acl}"),
                    );
                }
            }
        }

        let has_blocks = ibuf.inode().has_valid_blocks();
        if has_blocks {
            let view = if use_new { &rfs.new } else { &rfs.old };
            let old_map = &rfs.old.block_map;
            let reserve = &rfs.reserve_blocks;
            let debug = rfs.flags & DEBUG_BMOVE != 0;

            let mut alloc = || -> Result<Blk> {
                let mut s = scratch.borrow_mut();
                loop {
                    if s.cursor >= blocks_count {
                        if s.wrapped {
                            return Err(Error::NoSpace(
                                "block allocator exhausted while growing an extent tree".into(),
                            ));
                        }
                        s.wrapped = true;
                        s.cursor = first_data_block;
                        continue;
                    }
                    let blk = s.cursor;
                    let cluster = blk >> cluster_log;
                    if old_map.test(cluster) || reserve.test(cluster) || s.fresh.test(cluster) {
                        s.cursor += 1;
                        continue;
                    }
                    s.cursor = blk + 1;
                    s.fresh.mark(cluster);
                    s.allocated.push(blk);
                    return Ok(blk);
                }
            };
            let mut cb = |blk: Blk, _| {
                let cluster = blk >> cluster_log;
                if scratch.borrow().fresh.test(cluster) {
                    // Freshly allocated this pass: already at its final
                    // location
                    return IterAction::Keep;
                }
                match bmap.translate(cluster) {
                    Some(new_cluster) => {
                        let new_blk = (new_cluster << cluster_log) + blk % ratio;
                        if debug {
                            println!("ino={ino}, block {blk}->{new_blk}");
                        }
                        IterAction::Repl(new_blk)
                    }
                    None => IterAction::Keep,
                }
            };

            let status = block_iterate(rfs.io, view, ino, &mut ibuf, &mut alloc, &mut cb)?;
            if status.aborted {
                return Err(Error::Aborted(format!(
                    "block reference rewrite aborted on inode {ino}"
                )));
            }
            changed |= status.changed;
        }

        if changed {
            if use_new {
                rfs.new.write_inode_full(rfs.io, ino, &mut ibuf)?;
            } else {
                rfs.old.write_inode_full(rfs.io, ino, &mut ibuf)?;
            }
        }
    }

    // Account the blocks the allocator handed out while growing extent
    // trees, in both views
    let scratch = scratch.into_inner();
    for blk in scratch.allocated {
        rfs.old.block_alloc_stats(blk, 1);
        rfs.new.block_alloc_stats(blk, 1);
        rfs.fresh_blocks.mark(blk >> cluster_log);
    }
    Ok(())
}

/// Rewrites renumbered inode references inside every collected directory
/// block, refreshing directory timestamps, and drops the inode translation
/// table once applied.
pub fn inode_ref_fix(rfs: &mut Resize<'_>, dblist: &DbList) -> Result<()> {
    let Some(imap) = rfs.imap.take() else {
        return Ok(());
    };

    rfs.progress(Pass::InodeRefUpd, 0, dblist.len() as u64)?;
    let metadata_csum = rfs.new.sb.has_metadata_csum();
    let debug = rfs.flags & DEBUG_INODEMAP != 0;
    rfs.old.ignore_csum_errors = true;

    let mut changed_dirs: Vec<Ino> = Vec::new();
    {
        let old = &rfs.old;
        let new = &rfs.new;
        let io = &mut *rfs.io;

        // Directories absent from the new view's inode bitmap were
        // renumbered; their blocks must be rewritten in full so checksums
        // are rekeyed.
        let mut force_rewrite =
            |dir: Ino| metadata_csum && !new.inode_map.test(dir as u64);
        let mut cb = |dir: Ino, ent: &mut ext4::dir::DirEntry<'_>| {
            let mut action = DirentAction::default();
            let ino = ent.ino();
            if ino == 0 {
                return action;
            }
            if let Some(new_ino) = imap.translate(ino as u64) {
                if debug {
                    println!("dir {dir}: entry {ino}->{new_ino}");
                }
                ent.set_ino(new_ino as Ino);
                action.changed = true;
                changed_dirs.push(dir);
            }
            action
        };
        ext4::dir::dir_iterate(io, old, dblist, &mut force_rewrite, &mut cb)?;
    }
    rfs.old.ignore_csum_errors = false;

    // Refresh the timestamps of every modified directory
    changed_dirs.sort_unstable();
    changed_dirs.dedup();
    let stamp = now();
    for dir in changed_dirs {
        let mut ibuf = rfs.old.read_inode_full(rfs.io, dir)?;
        {
            let inode = ibuf.inode_mut();
            inode.i_mtime = stamp;
            inode.i_ctime = stamp;
        }
        rfs.old.write_inode_full(rfs.io, dir, &mut ibuf)?;
    }
    Ok(())
}

/// Rewrites `e_value_inum` references above `last_ino` in every inode's
/// extended attributes, both in-inode and in shared attribute blocks.
///
/// A four-entry cache avoids rewriting a shared block once per referencing
/// inode.
pub fn fix_ea_inode_refs(rfs: &mut Resize<'_>, last_ino: Ino) -> Result<()> {
    let Some(imap) = &rfs.imap else {
        return Ok(());
    };
    let old_count = rfs.old.sb.s_inodes_count;
    rfs.old.ignore_csum_errors = true;

    let mut blk_cache = [0 as Blk; 4];
    let mut cache_cursor = 0;

    let res = (|| -> Result<()> {
        for ino in 1..=old_count {
            let mut ibuf = rfs.old.read_inode_full(rfs.io, ino)?;
            {
                let inode = ibuf.inode();
                let links = inode.i_links_count;
                if !inode_in_use(links, ino) {
                    continue;
                }
            }

            let mut fix = |inum: u32| -> Option<u32> {
                if inum <= last_ino {
                    return None;
                }
                Some(imap.translate(inum as u64).unwrap_or(0) as u32)
            };

            if rfs.old.sb.inode_size() > 128 && xattr::fix_ibody_entries(&mut ibuf, &mut fix) {
                rfs.old.write_inode_full(rfs.io, ino, &mut ibuf)?;
            }

            let blk = ibuf.inode().file_acl();
            if blk != 0 && !blk_cache.contains(&blk) {
                let mut buf = xattr::read_block(rfs.io, &rfs.old, blk)?;
                if xattr::fix_block_entries(&mut buf, &mut fix) {
                    xattr::write_block(rfs.io, &rfs.old, blk, &mut buf)?;
                    // A shared block may be reached again through other
                    // inodes
                    if xattr::block_refcount(&buf) > 1 {
                        blk_cache[cache_cursor] = blk;
                        cache_cursor = (cache_cursor + 1) % blk_cache.len();
                    }
                }
            }
        }
        Ok(())
    })();

    rfs.old.ignore_csum_errors = false;
    res
}
