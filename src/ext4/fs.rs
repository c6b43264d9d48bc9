//! The filesystem view handle.
//!
//! An [`Ext4Fs`] bundles the superblock, the group descriptors and the
//! in-memory allocation bitmaps of one *view* of a filesystem. A transaction
//! holds two views over the same I/O channel: the old one, read as-is, and
//! the new one, being constructed. The channel itself is not owned by the
//! view; every operation touching the disk takes it as a parameter.

use crate::bitmap::Bitmap;
use crate::crc16;
use crate::crc32c;
use crate::desc::GroupDesc;
use crate::desc::BG_BLOCK_UNINIT;
use crate::desc::BG_INODE_UNINIT;
use crate::inode::InodeBuf;
use crate::io::IoChannel;
use crate::reinterpret;
use crate::sb::Superblock;
use crate::sb::COMPAT_HAS_JOURNAL;
use crate::Blk;
use crate::Error;
use crate::Group;
use crate::Ino;
use crate::Result;
use std::mem;

/// Offset of `bg_checksum` inside a group descriptor.
const DESC_CSUM_OFFSET: usize = 0x1e;

/// One view of an ext4 filesystem.
#[derive(Clone)]
pub struct Ext4Fs {
    /// The superblock.
    pub sb: Superblock,
    /// The group descriptors.
    pub descs: Vec<GroupDesc>,
    /// The block allocation bitmap, in cluster units.
    pub block_map: Bitmap,
    /// The inode allocation bitmap.
    pub inode_map: Bitmap,
    /// The number of block groups.
    pub groups: Group,
    /// The block size in bytes.
    pub blocksize: u32,
    /// The number of blocks used by one group's inode table.
    pub inode_blocks_per_group: u32,
    /// log2(blocks per cluster)
    pub cluster_log: u32,
    /// When set, inode and extended-attribute checksum mismatches are
    /// tolerated on read.
    pub ignore_csum_errors: bool,
    /// The superblock (or group descriptors) have pending changes.
    pub sb_dirty: bool,
}

impl Ext4Fs {
    /// Opens the filesystem found on the channel.
    pub fn open(io: &mut IoChannel) -> Result<Self> {
        let sb = Superblock::read(io)?;
        io.set_block_size(sb.block_size());

        let blocks_per_group = sb.s_blocks_per_group;
        let first_data_block = sb.s_first_data_block;
        if blocks_per_group == 0 {
            return Err(Error::Corrupt("no blocks per group".into()));
        }
        let groups = (sb.blocks_count() - first_data_block as u64)
            .div_ceil(blocks_per_group as u64) as Group;

        let mut fs = Self {
            sb,
            descs: Vec::new(),
            block_map: Bitmap::new(0, 0),
            inode_map: Bitmap::new(0, 0),
            groups,
            blocksize: sb.block_size(),
            inode_blocks_per_group: (sb.s_inodes_per_group as u64 * sb.inode_size() as u64)
                .div_ceil(sb.block_size() as u64) as u32,
            cluster_log: {
                let log_c = sb.s_log_cluster_size;
                let log_b = sb.s_log_block_size;
                log_c - log_b
            },
            ignore_csum_errors: false,
            sb_dirty: false,
        };
        fs.block_map = Bitmap::new(fs.b2c(first_data_block as u64), fs.clusters_count());
        let inodes_count = sb.s_inodes_count;
        fs.inode_map = Bitmap::new(1, inodes_count as u64 + 1);
        fs.read_descs(io)?;
        Ok(fs)
    }

    /// Returns the number of blocks the group descriptor table occupies.
    pub fn gdt_blocks(&self) -> u32 {
        (self.groups as u64 * self.sb.desc_size() as u64).div_ceil(self.blocksize as u64) as u32
    }

    fn read_descs(&mut self, io: &mut IoChannel) -> Result<()> {
        let desc_size = self.sb.desc_size() as usize;
        let first = self.sb.s_first_data_block as u64;
        let count = self.gdt_blocks();
        let mut buf = vec![0u8; count as usize * self.blocksize as usize];
        io.read_blocks(first + 1, count, &mut buf)?;

        self.descs = Vec::with_capacity(self.groups as usize);
        for g in 0..self.groups as usize {
            let mut desc: GroupDesc = unsafe { mem::zeroed() };
            let src = &buf[g * desc_size..g * desc_size + desc_size];
            unsafe {
                std::ptr::copy_nonoverlapping(
                    src.as_ptr(),
                    &mut desc as *mut _ as *mut u8,
                    desc_size,
                );
            }
            self.descs.push(desc);
        }
        Ok(())
    }

    /// Writes the group descriptor table.
    pub fn write_descs(&self, io: &mut IoChannel) -> Result<()> {
        let desc_size = self.sb.desc_size() as usize;
        let first = self.sb.s_first_data_block as u64;
        let count = self.gdt_blocks();
        let mut buf = vec![0u8; count as usize * self.blocksize as usize];
        for (g, desc) in self.descs.iter().enumerate() {
            let bytes = reinterpret(desc);
            buf[g * desc_size..g * desc_size + desc_size].copy_from_slice(&bytes[..desc_size]);
        }
        io.write_blocks(first + 1, count, &buf)?;
        Ok(())
    }

    // Geometry

    /// Converts a block number to its cluster number.
    pub fn b2c(&self, blk: Blk) -> u64 {
        blk >> self.cluster_log
    }

    /// Converts a cluster number to its first block number.
    pub fn c2b(&self, cluster: u64) -> Blk {
        cluster << self.cluster_log
    }

    /// Returns the number of blocks per cluster.
    pub fn cluster_ratio(&self) -> u32 {
        1 << self.cluster_log
    }

    /// Returns the total number of clusters.
    pub fn clusters_count(&self) -> u64 {
        self.b2c(self.sb.blocks_count() - 1) + 1
    }

    /// Returns the group containing block `blk`.
    pub fn group_of_blk(&self, blk: Blk) -> Group {
        let first = self.sb.s_first_data_block as u64;
        let bpg = self.sb.s_blocks_per_group as u64;
        ((blk.saturating_sub(first)) / bpg) as Group
    }

    /// Returns the first block of group `group`.
    pub fn group_first_block(&self, group: Group) -> Blk {
        let first = self.sb.s_first_data_block as u64;
        let bpg = self.sb.s_blocks_per_group as u64;
        first + group as u64 * bpg
    }

    /// Returns the last block of group `group`.
    pub fn group_last_block(&self, group: Group) -> Blk {
        let next = self.group_first_block(group + 1);
        next.min(self.sb.blocks_count()) - 1
    }

    /// Returns the group containing inode `ino`.
    pub fn group_of_ino(&self, ino: Ino) -> Group {
        let ipg = self.sb.s_inodes_per_group;
        (ino - 1) / ipg
    }

    /// Marks the block range `start..start + len` in `map`, converting to
    /// cluster units.
    pub fn mark_block_range(&self, map: &mut Bitmap, start: Blk, len: u64) {
        if len == 0 {
            return;
        }
        let first = self.b2c(start);
        let last = self.b2c(start + len - 1);
        map.mark_range(first, last - first + 1);
    }

    /// Tests block `blk` in `map`, converting to cluster units.
    pub fn test_block(&self, map: &Bitmap, blk: Blk) -> bool {
        map.test(self.b2c(blk))
    }

    // Group descriptor accessors

    /// Returns the inode table location of group `group`, `0` if unset.
    pub fn inode_table_loc(&self, group: Group) -> Blk {
        self.descs[group as usize].inode_table_loc(self.sb.has_64bit())
    }

    /// Sets the inode table location of group `group`.
    pub fn set_inode_table_loc(&mut self, group: Group, blk: Blk) {
        let has64 = self.sb.has_64bit();
        self.descs[group as usize].set_inode_table_loc(has64, blk);
        self.sb_dirty = true;
    }

    /// Returns the block bitmap location of group `group`.
    pub fn block_bitmap_loc(&self, group: Group) -> Blk {
        self.descs[group as usize].block_bitmap_loc(self.sb.has_64bit())
    }

    /// Returns the inode bitmap location of group `group`.
    pub fn inode_bitmap_loc(&self, group: Group) -> Blk {
        self.descs[group as usize].inode_bitmap_loc(self.sb.has_64bit())
    }

    /// Returns the free blocks count of group `group` (clusters, with
    /// `bigalloc`).
    pub fn bg_free_blocks_count(&self, group: Group) -> u32 {
        self.descs[group as usize].free_blocks_count(self.sb.has_64bit())
    }

    /// Returns the free inodes count of group `group`.
    pub fn bg_free_inodes_count(&self, group: Group) -> u32 {
        self.descs[group as usize].free_inodes_count(self.sb.has_64bit())
    }

    /// Sets the free inodes count of group `group`.
    pub fn bg_free_inodes_count_set(&mut self, group: Group, count: u32) {
        let has64 = self.sb.has_64bit();
        self.descs[group as usize].set_free_inodes_count(has64, count);
        self.sb_dirty = true;
    }

    /// Returns the used directories count of group `group`.
    pub fn bg_used_dirs_count(&self, group: Group) -> u32 {
        self.descs[group as usize].used_dirs_count(self.sb.has_64bit())
    }

    /// Sets the used directories count of group `group`.
    pub fn bg_used_dirs_count_set(&mut self, group: Group, count: u32) {
        let has64 = self.sb.has_64bit();
        self.descs[group as usize].set_used_dirs_count(has64, count);
        self.sb_dirty = true;
    }

    /// Sets the unused-inodes count of group `group`.
    pub fn bg_itable_unused_set(&mut self, group: Group, count: u32) {
        let has64 = self.sb.has_64bit();
        self.descs[group as usize].set_itable_unused(has64, count);
        self.sb_dirty = true;
    }

    /// Tests group flags on group `group`.
    pub fn bg_flags_test(&self, group: Group, flags: u16) -> bool {
        self.descs[group as usize].flags_test(flags)
    }

    /// Clears the block-bitmap-uninitialized flag of group `group`.
    pub fn clear_block_uninit(&mut self, group: Group) {
        if self.bg_flags_test(group, BG_BLOCK_UNINIT) {
            self.descs[group as usize].flags_clear(BG_BLOCK_UNINIT);
            self.sb_dirty = true;
        }
    }

    // Allocation statistics

    /// Records the allocation (`delta > 0`) or release (`delta < 0`) of the
    /// cluster containing `blk`, updating the bitmap and the free counts.
    pub fn block_alloc_stats(&mut self, blk: Blk, delta: i32) {
        let cluster = self.b2c(blk);
        let group = self.group_of_blk(blk);
        let has64 = self.sb.has_64bit();
        if delta > 0 {
            self.block_map.mark(cluster);
            self.clear_block_uninit(group);
        } else {
            self.block_map.unmark(cluster);
        }
        let free = self.descs[group as usize].free_blocks_count(has64) as i64 - delta as i64;
        self.descs[group as usize].set_free_blocks_count(has64, free.max(0) as u32);
        let sb_free = self.sb.free_blocks_count() as i64 - delta as i64;
        self.sb.set_free_blocks_count(sb_free.max(0) as u64);
        self.sb_dirty = true;
    }

    /// Records the allocation or release of the clusters covering the block
    /// range `start..start + count`.
    pub fn block_alloc_stats_range(&mut self, start: Blk, count: u64, delta: i32) {
        if count == 0 {
            return;
        }
        let first = self.b2c(start);
        let last = self.b2c(start + count - 1);
        for cluster in first..=last {
            self.block_alloc_stats(self.c2b(cluster), delta);
        }
    }

    /// Records the allocation or release of inode `ino`.
    pub fn inode_alloc_stats(&mut self, ino: Ino, delta: i32, is_dir: bool) {
        let group = self.group_of_ino(ino);
        let has64 = self.sb.has_64bit();
        if delta > 0 {
            self.inode_map.mark(ino as u64);
            if self.bg_flags_test(group, BG_INODE_UNINIT) {
                self.descs[group as usize].flags_clear(BG_INODE_UNINIT);
            }
        } else {
            self.inode_map.unmark(ino as u64);
        }
        let free = self.descs[group as usize].free_inodes_count(has64) as i64 - delta as i64;
        self.descs[group as usize].set_free_inodes_count(has64, free.max(0) as u32);
        if is_dir {
            let dirs = self.descs[group as usize].used_dirs_count(has64) as i64 + delta as i64;
            self.descs[group as usize].set_used_dirs_count(has64, dirs.max(0) as u32);
        }
        let sb_free = self.sb.s_free_inodes_count as i64 - delta as i64;
        self.sb.s_free_inodes_count = sb_free.max(0) as u32;
        self.sb_dirty = true;
    }

    // Superblock backups

    /// Tells whether group `group` holds a superblock backup.
    pub fn bg_has_super(&self, group: Group) -> bool {
        if group == 0 {
            return true;
        }
        if !self.sb.has_sparse_super() {
            return true;
        }
        if group == 1 {
            return true;
        }
        for base in [3u32, 5, 7] {
            let mut n = base;
            while n < group {
                n = n.saturating_mul(base);
            }
            if n == group {
                return true;
            }
        }
        false
    }

    /// Marks the superblock, group descriptor table and reserved descriptor
    /// blocks of group `group` in `map`.
    pub fn reserve_super_and_bgd(&self, group: Group, map: &mut Bitmap) {
        if !self.bg_has_super(group) {
            return;
        }
        let start = self.group_first_block(group);
        let reserved = self.sb.s_reserved_gdt_blocks;
        let meta = 1 + self.gdt_blocks() as u64 + reserved as u64;
        self.mark_block_range(map, start, meta);
    }

    /// Builds a bitmap of every metadata block: superblocks, descriptor
    /// tables, bitmaps, inode tables and the MMP block.
    pub fn mark_table_blocks(&self, map: &mut Bitmap) {
        for g in 0..self.groups {
            self.reserve_super_and_bgd(g, map);
            let blk = self.inode_table_loc(g);
            if blk != 0 {
                self.mark_block_range(map, blk, self.inode_blocks_per_group as u64);
            }
            let blk = self.block_bitmap_loc(g);
            if blk != 0 {
                self.mark_block_range(map, blk, 1);
            }
            let blk = self.inode_bitmap_loc(g);
            if blk != 0 {
                self.mark_block_range(map, blk, 1);
            }
        }
        // Reserve the MMP block
        let mmp = self.sb.s_mmp_block;
        if self.sb.has_mmp()
            && mmp > self.sb.s_first_data_block as u64
            && mmp < self.sb.blocks_count()
        {
            self.mark_block_range(map, mmp, 1);
        }
    }

    /// For every group whose block bitmap is uninitialized, marks the
    /// group's metadata blocks in the in-memory block bitmap, so scans do
    /// not treat them as movable data.
    pub fn fix_uninit_block_bitmaps(&mut self) {
        if !self.sb.has_group_desc_csum() {
            return;
        }
        let mut marks = Bitmap::new(self.block_map.start(), self.block_map.end());
        for g in 0..self.groups {
            if !self.bg_flags_test(g, BG_BLOCK_UNINIT) {
                continue;
            }
            self.reserve_super_and_bgd(g, &mut marks);
            let blk = self.inode_table_loc(g);
            if blk != 0 {
                self.mark_block_range(&mut marks, blk, self.inode_blocks_per_group as u64);
            }
            for blk in [self.block_bitmap_loc(g), self.inode_bitmap_loc(g)] {
                if blk != 0 {
                    self.mark_block_range(&mut marks, blk, 1);
                }
            }
        }
        for cluster in self.block_map.start()..self.block_map.end() {
            if marks.test(cluster) {
                self.block_map.mark(cluster);
            }
        }
    }

    // Bitmap I/O

    /// Returns, for group `group`, the number of meaningful cluster bits.
    fn group_cluster_bits(&self, group: Group) -> u64 {
        let cpg = self.clusters_per_group() as u64;
        let base = self.b2c(self.group_first_block(group));
        cpg.min(self.clusters_count() - base)
    }

    /// Returns the number of clusters per group.
    pub fn clusters_per_group(&self) -> u32 {
        if self.sb.has_bigalloc() {
            self.sb.s_clusters_per_group
        } else {
            self.sb.s_blocks_per_group
        }
    }

    /// Loads both allocation bitmaps from disk.
    pub fn read_bitmaps(&mut self, io: &mut IoChannel) -> Result<()> {
        let bs = self.blocksize as usize;
        let ipg = self.sb.s_inodes_per_group as u64;
        let mut buf = vec![0u8; bs];

        for g in 0..self.groups {
            io.read_blocks(self.block_bitmap_loc(g), 1, &mut buf)?;
            let base = self.b2c(self.group_first_block(g));
            let bits = self.group_cluster_bits(g);
            self.block_map.load(base, &buf, bits);

            io.read_blocks(self.inode_bitmap_loc(g), 1, &mut buf)?;
            self.inode_map.load(g as u64 * ipg + 1, &buf, ipg);
        }
        Ok(())
    }

    /// Writes both allocation bitmaps to disk, refreshing the bitmap
    /// checksums stored in the group descriptors.
    pub fn write_bitmaps(&mut self, io: &mut IoChannel) -> Result<()> {
        let bs = self.blocksize as usize;
        let ipg = self.sb.s_inodes_per_group as u64;
        let seed = self.sb.csum_seed();
        let metadata_csum = self.sb.has_metadata_csum();

        for g in 0..self.groups {
            // Padding bits past the end of the group read as allocated
            let mut buf = vec![0xffu8; bs];
            let base = self.b2c(self.group_first_block(g));
            let bits = self.group_cluster_bits(g);
            self.block_map.store(base, &mut buf, bits);
            if metadata_csum {
                let size = (self.clusters_per_group() as usize).div_ceil(8);
                let csum = crc32c::compute(seed, &buf[..size]);
                self.descs[g as usize].bg_block_bitmap_csum_lo = csum as u16;
                if self.sb.desc_size() >= 64 {
                    self.descs[g as usize].bg_block_bitmap_csum_hi = (csum >> 16) as u16;
                }
            }
            io.write_blocks(self.block_bitmap_loc(g), 1, &buf)?;

            let mut buf = vec![0xffu8; bs];
            self.inode_map.store(g as u64 * ipg + 1, &mut buf, ipg);
            if metadata_csum {
                let size = (ipg as usize).div_ceil(8);
                let csum = crc32c::compute(seed, &buf[..size]);
                self.descs[g as usize].bg_inode_bitmap_csum_lo = csum as u16;
                if self.sb.desc_size() >= 64 {
                    self.descs[g as usize].bg_inode_bitmap_csum_hi = (csum >> 16) as u16;
                }
            }
            io.write_blocks(self.inode_bitmap_loc(g), 1, &buf)?;
        }
        Ok(())
    }

    /// Resizes the inode bitmap to a new total inode count.
    pub fn resize_inode_map(&mut self, inodes_count: u32) {
        self.inode_map.resize(inodes_count as u64 + 1);
    }

    // Inode I/O

    /// Returns the byte offset of inode `ino`.
    fn inode_offset(&self, ino: Ino) -> Result<u64> {
        let ipg = self.sb.s_inodes_per_group;
        if ino == 0 {
            return Err(Error::Corrupt("inode number 0".into()));
        }
        let group = (ino - 1) / ipg;
        let index = (ino - 1) % ipg;
        if group >= self.groups {
            return Err(Error::Corrupt(format!("inode {ino} out of range")));
        }
        let loc = self.inode_table_loc(group);
        if loc == 0 {
            return Err(Error::Corrupt(format!(
                "group {group} has no inode table"
            )));
        }
        Ok(loc * self.blocksize as u64 + index as u64 * self.sb.inode_size() as u64)
    }

    /// Reads the full inode `ino`.
    pub fn read_inode_full(&self, io: &mut IoChannel, ino: Ino) -> Result<InodeBuf> {
        let off = self.inode_offset(ino)?;
        let mut raw = vec![0u8; self.sb.inode_size() as usize];
        io.read_bytes(off, &mut raw)?;
        let ibuf = InodeBuf::from_raw(raw);

        if self.sb.has_metadata_csum()
            && !self.ignore_csum_errors
            && !ibuf.verify_csum(self.sb.csum_seed(), ino)
        {
            return Err(Error::Corrupt(format!("inode {ino}: bad checksum")));
        }
        Ok(ibuf)
    }

    /// Writes the full inode `ino`, refreshing its checksum.
    pub fn write_inode_full(&self, io: &mut IoChannel, ino: Ino, ibuf: &mut InodeBuf) -> Result<()> {
        if self.sb.has_metadata_csum() {
            ibuf.set_csum(self.sb.csum_seed(), ino);
        }
        let off = self.inode_offset(ino)?;
        io.write_bytes(off, ibuf.raw())?;
        Ok(())
    }

    /// Returns the lowest free non-reserved inode number.
    pub fn new_inode(&self) -> Result<Ino> {
        let count = self.sb.s_inodes_count;
        for ino in self.sb.first_ino()..=count {
            if !self.inode_map.test(ino as u64) {
                return Ok(ino);
            }
        }
        Err(Error::NoSpace("no free inode available".into()))
    }

    // Group table placement

    /// Finds contiguous space for the inode table of `group` and records its
    /// location.
    ///
    /// `search` is the bitmap of in-use blocks to search (typically the old
    /// view's block bitmap); the found range is marked in it. With `flex_bg`
    /// the whole flex group is searched, then the whole filesystem as a
    /// fallback; the group's own range otherwise.
    ///
    /// With `flex_bg`, allocation statistics of this view are updated; for
    /// other filesystems the caller is responsible for them.
    pub fn allocate_group_table(&mut self, group: Group, search: &mut Bitmap) -> Result<()> {
        let len = self.inode_blocks_per_group as u64;
        let flex = self.sb.has_flex_bg();
        let (mut first, last) = if flex {
            let log = self.sb.s_log_groups_per_flex;
            let flex_size = 1u32 << log;
            let flex_start = group & !(flex_size - 1);
            let first = self.group_first_block(flex_start);
            let last = if flex_start + flex_size >= self.groups {
                self.sb.blocks_count() - 1
            } else {
                self.group_first_block(flex_start + flex_size) - 1
            };
            (first, last)
        } else {
            (self.group_first_block(group), self.group_last_block(group))
        };

        let mut retried = false;
        let start = loop {
            match self.find_free_run(search, first, last, len) {
                Some(start) => break start,
                None if flex && !retried => {
                    // Fall back to searching the whole filesystem, the way
                    // the flex_bg placer widens its window
                    retried = true;
                    first = self.sb.s_first_data_block as u64;
                }
                None => {
                    return Err(Error::NoSpace(format!(
                        "no room for the inode table of group {group}"
                    )))
                }
            }
        };

        self.mark_block_range(search, start, len);
        self.set_inode_table_loc(group, start);
        if flex {
            self.block_alloc_stats_range(start, len, 1);
        }
        Ok(())
    }

    /// Finds `len` consecutive blocks in `first..=last` that are free in
    /// `search`, scanning lowest-first. Candidates are aligned to cluster
    /// boundaries.
    fn find_free_run(&self, search: &Bitmap, first: Blk, last: Blk, len: u64) -> Option<Blk> {
        let ratio = self.cluster_ratio() as u64;
        let mut blk = first.next_multiple_of(ratio);
        while blk + len - 1 <= last {
            let mut j = 0;
            while j < len {
                if self.test_block(search, blk + j) {
                    break;
                }
                j += 1;
            }
            if j == len {
                return Some(blk);
            }
            blk = (blk + j + 1).next_multiple_of(ratio).max(blk + ratio);
        }
        None
    }

    /// Writes zeroes over `count` blocks starting at `start`.
    pub fn zero_blocks(&self, io: &mut IoChannel, start: Blk, count: u64) -> Result<()> {
        let chunk = 16u64;
        let buf = vec![0u8; self.blocksize as usize * chunk as usize];
        let mut blk = start;
        let mut left = count;
        while left > 0 {
            let n = left.min(chunk);
            io.write_blocks(blk, n as u32, &buf)?;
            blk += n;
            left -= n;
        }
        Ok(())
    }

    // Checksums

    /// Computes the checksum of the descriptor of group `group`.
    pub fn desc_csum(&self, group: Group) -> u16 {
        let desc = &self.descs[group as usize];
        let bytes = reinterpret(desc);
        let desc_size = self.sb.desc_size() as usize;
        let le_group = group.to_le_bytes();

        if self.sb.has_metadata_csum() {
            let mut crc = crc32c::compute(self.sb.csum_seed(), &le_group);
            crc = crc32c::compute(crc, &bytes[..DESC_CSUM_OFFSET]);
            crc = crc32c::compute(crc, &[0, 0]);
            if desc_size > DESC_CSUM_OFFSET + 2 {
                crc = crc32c::compute(crc, &bytes[DESC_CSUM_OFFSET + 2..desc_size]);
            }
            crc as u16
        } else {
            let uuid = self.sb.s_uuid;
            let mut crc = crc16::compute(!0, &uuid);
            crc = crc16::compute(crc, &le_group);
            crc = crc16::compute(crc, &bytes[..DESC_CSUM_OFFSET]);
            if desc_size > DESC_CSUM_OFFSET + 2 {
                crc = crc16::compute(crc, &bytes[DESC_CSUM_OFFSET + 2..desc_size]);
            }
            crc
        }
    }

    /// Recomputes and stores the checksum of the descriptor of group
    /// `group`.
    pub fn desc_csum_set(&mut self, group: Group) {
        if !self.sb.has_group_desc_csum() {
            return;
        }
        let csum = self.desc_csum(group);
        self.descs[group as usize].bg_checksum = csum;
        self.sb_dirty = true;
    }

    /// Recomputes the unused-inode counts and the checksums of every group
    /// descriptor.
    pub fn set_gdt_csum(&mut self) {
        if !self.sb.has_group_desc_csum() {
            return;
        }
        let ipg = self.sb.s_inodes_per_group;
        for g in 0..self.groups {
            // Find the last inode in use within the group
            let base = g as u64 * ipg as u64;
            let mut last_used = 0;
            for i in (0..ipg).rev() {
                if self.inode_map.test(base + i as u64 + 1) {
                    last_used = i + 1;
                    break;
                }
            }
            let has64 = self.sb.has_64bit();
            self.descs[g as usize].set_itable_unused(has64, ipg - last_used);
            self.desc_csum_set(g);
        }
        self.sb_dirty = true;
    }

    /// Refreshes the journal inode backup kept in the superblock.
    pub fn fix_sb_journal_backup(&mut self, io: &mut IoChannel) -> Result<()> {
        let compat = self.sb.s_feature_compat;
        let journal_inum = self.sb.s_journal_inum;
        if compat & COMPAT_HAS_JOURNAL == 0 || journal_inum == 0 {
            return Ok(());
        }
        let ibuf = self.read_inode_full(io, journal_inum)?;
        let inode = ibuf.inode();
        let i_block = inode.i_block;
        let size_high = inode.i_size_high;
        let size_lo = inode.i_size_lo;
        for (i, b) in i_block.iter().enumerate() {
            self.sb.s_jnl_blocks[i] = *b;
        }
        self.sb.s_jnl_blocks[15] = size_high;
        self.sb.s_jnl_blocks[16] = size_lo;
        self.sb.s_jnl_backup_type = 1;
        self.sb_dirty = true;
        Ok(())
    }

    /// Marks the superblock dirty, so the next flush writes it out.
    pub fn mark_super_dirty(&mut self) {
        self.sb_dirty = true;
    }

    /// Writes the superblock alone.
    pub fn write_super(&mut self, io: &mut IoChannel) -> Result<()> {
        self.sb.s_block_group_nr = 0;
        self.sb.write(io)?;
        Ok(())
    }

    /// Writes superblock backups and descriptor table copies into every
    /// group holding one.
    fn write_backups(&self, io: &mut IoChannel) -> Result<()> {
        let desc_size = self.sb.desc_size() as usize;
        let count = self.gdt_blocks();
        let mut gdt = vec![0u8; count as usize * self.blocksize as usize];
        for (g, desc) in self.descs.iter().enumerate() {
            let bytes = reinterpret(desc);
            gdt[g * desc_size..g * desc_size + desc_size].copy_from_slice(&bytes[..desc_size]);
        }

        for g in 1..self.groups {
            if !self.bg_has_super(g) {
                continue;
            }
            let start = self.group_first_block(g);
            let mut sb_copy = self.sb;
            sb_copy.s_block_group_nr = g as u16;
            if self.sb.has_metadata_csum() {
                sb_copy.s_checksum = sb_copy.csum();
            }
            let bytes = reinterpret(&sb_copy);
            io.write_bytes(start * self.blocksize as u64, bytes)?;
            io.write_blocks(start + 1, count, &gdt)?;
        }
        Ok(())
    }

    /// Writes the whole view back: bitmaps, descriptors, backups and the
    /// superblock, then flushes the channel.
    pub fn flush(&mut self, io: &mut IoChannel) -> Result<()> {
        self.write_bitmaps(io)?;
        self.write_descs(io)?;
        self.write_backups(io)?;
        self.write_super(io)?;
        self.sb_dirty = false;
        io.flush()?;
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sparse_super_groups() {
        let mut sb: Superblock = unsafe { mem::zeroed() };
        sb.s_rev_level = 1;
        sb.s_magic = crate::sb::EXT4_SIGNATURE;
        sb.s_feature_ro_compat = crate::sb::RO_COMPAT_SPARSE_SUPER;
        sb.s_blocks_per_group = 8192;
        sb.s_log_block_size = 0;
        sb.s_inodes_per_group = 16;
        sb.s_inode_size = 256;

        let fs = Ext4Fs {
            sb,
            descs: Vec::new(),
            block_map: Bitmap::new(0, 0),
            inode_map: Bitmap::new(0, 0),
            groups: 100,
            blocksize: 1024,
            inode_blocks_per_group: 4,
            cluster_log: 0,
            ignore_csum_errors: false,
            sb_dirty: false,
        };

        let with_super: Vec<Group> = (0..100).filter(|g| fs.bg_has_super(*g)).collect();
        assert_eq!(with_super, vec![0, 1, 3, 5, 7, 9, 25, 27, 49, 81]);
    }

    #[test]
    fn find_free_run_skips_used() {
        let mut sb: Superblock = unsafe { mem::zeroed() };
        sb.s_blocks_per_group = 64;
        sb.s_inodes_per_group = 8;
        sb.s_inode_size = 128;
        sb.s_rev_level = 1;

        let fs = Ext4Fs {
            sb,
            descs: Vec::new(),
            block_map: Bitmap::new(0, 128),
            inode_map: Bitmap::new(1, 9),
            groups: 2,
            blocksize: 1024,
            inode_blocks_per_group: 4,
            cluster_log: 0,
            ignore_csum_errors: false,
            sb_dirty: false,
        };

        let mut search = Bitmap::new(0, 128);
        search.mark_range(0, 10);
        search.mark_range(12, 3);
        assert_eq!(fs.find_free_run(&search, 0, 63, 4), Some(15));
        search.mark_range(15, 49);
        assert_eq!(fs.find_free_run(&search, 0, 63, 4), None);
    }
}
