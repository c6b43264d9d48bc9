//! Creation of fresh ext4 images.
//!
//! This is a deliberately small formatter: no journal, no resize inode, no
//! lost+found. It produces images with a chosen geometry and feature set,
//! which is what the tool's test suites need to fabricate filesystems to
//! operate on.

use crate::bitmap::Bitmap;
use crate::desc::GroupDesc;
use crate::dir::dirent_tail_init;
use crate::extent;
use crate::fs::Ext4Fs;
use crate::inode::InodeBuf;
use crate::inode::S_IFDIR;
use crate::inode::S_IFREG;
use crate::io::IoChannel;
use crate::sb::Superblock;
use crate::sb::EXT4_SIGNATURE;
use crate::sb::INCOMPAT_64BIT;
use crate::sb::INCOMPAT_EA_INODE;
use crate::sb::INCOMPAT_EXTENTS;
use crate::sb::INCOMPAT_FILETYPE;
use crate::sb::INCOMPAT_FLEX_BG;
use crate::sb::RO_COMPAT_BIGALLOC;
use crate::sb::RO_COMPAT_GDT_CSUM;
use crate::sb::RO_COMPAT_METADATA_CSUM;
use crate::sb::RO_COMPAT_SPARSE_SUPER;
use crate::sb::STATE_VALID;
use crate::write_u16;
use crate::write_u32;
use crate::Blk;
use crate::Error;
use crate::Ino;
use crate::Result;
use crate::ROOT_INO;
use std::mem;

/// The number of reserved inodes.
const RESERVED_INODES: u32 = 10;

/// A factory to create an ext4 filesystem image.
pub struct Ext4Factory {
    /// Total number of blocks.
    pub blocks: u64,
    /// Block size in bytes.
    pub block_size: u32,
    /// Inodes per group.
    pub inodes_per_group: u32,
    /// Blocks per group.
    pub blocks_per_group: u32,
    /// Inode size in bytes.
    pub inode_size: u32,
    /// log2(groups per flex group); `0` disables `flex_bg`.
    pub log_groups_per_flex: u8,
    /// log2(blocks per cluster); non-zero enables `bigalloc`.
    pub cluster_log: u32,
    /// Enable metadata checksums.
    pub metadata_csum: bool,
    /// Enable crc16 descriptor checksums (implied by `metadata_csum`).
    pub gdt_csum: bool,
    /// Enable 64-bit block numbers and 64-byte descriptors.
    pub has_64bit: bool,
    /// Enable the `ea_inode` feature.
    pub ea_inode: bool,
}

impl Default for Ext4Factory {
    fn default() -> Self {
        Self {
            blocks: 8192,
            block_size: 1024,
            inodes_per_group: 512,
            blocks_per_group: 8192,
            inode_size: 256,
            log_groups_per_flex: 0,
            cluster_log: 0,
            metadata_csum: false,
            gdt_csum: false,
            has_64bit: false,
            ea_inode: false,
        }
    }
}

impl Ext4Factory {
    /// Creates the filesystem on the channel and returns the opened view.
    pub fn create(&self, io: &mut IoChannel) -> Result<Ext4Fs> {
        let bs = self.block_size;
        let first_data_block: u32 = if bs == 1024 { 1 } else { 0 };
        let groups = (self.blocks - first_data_block as u64)
            .div_ceil(self.blocks_per_group as u64) as u32;
        let total_inodes = groups * self.inodes_per_group;
        let ratio = 1u64 << self.cluster_log;
        let ibpg = (self.inodes_per_group as u64 * self.inode_size as u64)
            .div_ceil(bs as u64) as u32;

        let mut sb: Superblock = unsafe { mem::zeroed() };
        sb.s_magic = EXT4_SIGNATURE;
        sb.s_state = STATE_VALID;
        sb.s_rev_level = 1;
        sb.s_minor_rev_level = 0;
        sb.s_inodes_count = total_inodes;
        sb.s_blocks_count_lo = self.blocks as u32;
        if self.has_64bit {
            sb.s_blocks_count_hi = (self.blocks >> 32) as u32;
            sb.s_desc_size = 64;
        }
        sb.s_first_data_block = first_data_block;
        sb.s_log_block_size = bs.trailing_zeros() - 10;
        sb.s_log_cluster_size = sb.s_log_block_size + self.cluster_log;
        sb.s_blocks_per_group = self.blocks_per_group;
        sb.s_clusters_per_group = (self.blocks_per_group as u64 / ratio) as u32;
        sb.s_inodes_per_group = self.inodes_per_group;
        sb.s_inode_size = self.inode_size as u16;
        sb.s_first_ino = RESERVED_INODES + 1;
        sb.s_max_mnt_count = 0xffff;
        sb.s_errors = 1;
        sb.s_log_groups_per_flex = self.log_groups_per_flex;
        sb.s_feature_incompat = INCOMPAT_FILETYPE | INCOMPAT_EXTENTS;
        if self.log_groups_per_flex > 0 {
            sb.s_feature_incompat |= INCOMPAT_FLEX_BG;
        }
        if self.has_64bit {
            sb.s_feature_incompat |= INCOMPAT_64BIT;
        }
        if self.ea_inode {
            sb.s_feature_incompat |= INCOMPAT_EA_INODE;
        }
        sb.s_feature_ro_compat = RO_COMPAT_SPARSE_SUPER;
        if self.metadata_csum {
            sb.s_feature_ro_compat |= RO_COMPAT_METADATA_CSUM;
            sb.s_checksum_type = 1;
        } else if self.gdt_csum {
            sb.s_feature_ro_compat |= RO_COMPAT_GDT_CSUM;
        }
        if self.cluster_log > 0 {
            sb.s_feature_ro_compat |= RO_COMPAT_BIGALLOC;
        }
        let mut uuid = [0u8; 16];
        for (i, b) in uuid.iter_mut().enumerate() {
            *b = 0x40 | i as u8;
        }
        sb.s_uuid = uuid;
        if self.inode_size > 128 {
            sb.s_min_extra_isize = 32;
            sb.s_want_extra_isize = 32;
        }

        io.set_block_size(bs);

        let mut fs = Ext4Fs {
            sb,
            descs: vec![unsafe { mem::zeroed::<GroupDesc>() }; groups as usize],
            block_map: Bitmap::new(0, 0),
            inode_map: Bitmap::new(1, total_inodes as u64 + 1),
            groups,
            blocksize: bs,
            inode_blocks_per_group: ibpg,
            cluster_log: self.cluster_log,
            ignore_csum_errors: false,
            sb_dirty: true,
        };
        fs.block_map = Bitmap::new(fs.b2c(first_data_block as u64), fs.clusters_count());

        self.place_metadata(&mut fs)?;

        // Zero the inode tables
        for g in 0..groups {
            fs.zero_blocks(io, fs.inode_table_loc(g), ibpg as u64)?;
        }

        // Reserved inodes are in use; write them out so they carry valid
        // checksums
        for ino in 1..=RESERVED_INODES {
            fs.inode_alloc_stats(ino, 1, ino == ROOT_INO);
            let mut ibuf = InodeBuf::new(self.inode_size);
            if ino == ROOT_INO {
                self.fill_root_dir(io, &mut fs, &mut ibuf)?;
            }
            fs.write_inode_full(io, ino, &mut ibuf)?;
        }

        // Account free space
        let mut free_clusters = 0u64;
        for g in 0..groups {
            let base = fs.b2c(fs.group_first_block(g));
            let cpg = fs.clusters_per_group() as u64;
            let bits = cpg.min(fs.clusters_count() - base);
            let used = fs.block_map.count_range(base, bits);
            let free = bits - used;
            let has64 = self.has_64bit;
            fs.descs[g as usize].set_free_blocks_count(has64, free as u32);
            free_clusters += free;

            let used_inodes = if g == 0 { RESERVED_INODES } else { 0 };
            fs.descs[g as usize]
                .set_free_inodes_count(has64, self.inodes_per_group - used_inodes);
            fs.descs[g as usize].set_used_dirs_count(has64, u32::from(g == 0));
        }
        fs.sb.set_free_blocks_count(free_clusters);
        fs.sb.s_free_inodes_count = total_inodes - RESERVED_INODES;

        fs.set_gdt_csum();
        fs.flush(io)?;
        Ok(fs)
    }

    /// Chooses the location of every group's bitmaps and inode table and
    /// marks all metadata in the block bitmap.
    fn place_metadata(&self, fs: &mut Ext4Fs) -> Result<()> {
        let groups = fs.groups;
        let has64 = self.has_64bit;

        // Superblock and descriptor copies
        let mut reserved = Bitmap::new(fs.block_map.start(), fs.block_map.end());
        for g in 0..groups {
            fs.reserve_super_and_bgd(g, &mut reserved);
        }
        for cluster in fs.block_map.start()..fs.block_map.end() {
            if reserved.test(cluster) {
                fs.block_map.mark(cluster);
            }
        }

        let flex_size = if self.log_groups_per_flex > 0 {
            1u32 << self.log_groups_per_flex
        } else {
            1
        };

        let mut f = 0;
        while f < groups {
            let in_flex = flex_size.min(groups - f);
            // Lay the flex chunk's bitmaps and tables after the first
            // group's superblock area
            let mut cursor = self.first_free_after_super(fs, f);

            // Block bitmaps
            for i in 0..in_flex {
                let blk = self.place_run(fs, &mut cursor, 1)?;
                fs.descs[(f + i) as usize].set_block_bitmap_loc(has64, blk);
            }
            // Inode bitmaps
            for i in 0..in_flex {
                let blk = self.place_run(fs, &mut cursor, 1)?;
                fs.descs[(f + i) as usize].set_inode_bitmap_loc(has64, blk);
            }
            // Inode tables
            for i in 0..in_flex {
                cursor = cursor.next_multiple_of(1 << self.cluster_log);
                let blk = self.place_run(fs, &mut cursor, fs.inode_blocks_per_group as u64)?;
                fs.descs[(f + i) as usize].set_inode_table_loc(has64, blk);
            }
            f += in_flex;
        }
        Ok(())
    }

    /// Returns the first block after the superblock area of group `g`.
    fn first_free_after_super(&self, fs: &Ext4Fs, g: u32) -> Blk {
        let base = fs.group_first_block(g);
        if fs.bg_has_super(g) {
            base + 1 + fs.gdt_blocks() as u64
        } else {
            base
        }
    }

    /// Marks a run of `len` blocks at the cursor and advances it.
    fn place_run(&self, fs: &mut Ext4Fs, cursor: &mut Blk, len: u64) -> Result<Blk> {
        while fs.test_block(&fs.block_map, *cursor) {
            *cursor += 1;
        }
        let blk = *cursor;
        if blk + len > fs.sb.blocks_count() {
            return Err(Error::NoSpace("image too small for its metadata".into()));
        }
        let first = fs.b2c(blk);
        let last = fs.b2c(blk + len - 1);
        fs.block_map.mark_range(first, last - first + 1);
        *cursor += len;
        Ok(blk)
    }

    /// Builds the root directory: a single legacy-mapped block holding `.`
    /// and `..`.
    fn fill_root_dir(&self, io: &mut IoChannel, fs: &mut Ext4Fs, ibuf: &mut InodeBuf) -> Result<()> {
        let bs = fs.blocksize as usize;
        let mut cursor = self.first_free_after_super(fs, 0);
        let blk = self.place_run(fs, &mut cursor, 1)?;

        let mut buf = vec![0u8; bs];
        let usable = if self.metadata_csum { bs - 12 } else { bs };
        // "."
        write_u32(&mut buf, 0, ROOT_INO);
        write_u16(&mut buf, 4, 12);
        buf[6] = 1;
        buf[7] = 2;
        buf[8] = b'.';
        // ".."
        write_u32(&mut buf, 12, ROOT_INO);
        write_u16(&mut buf, 16, (usable - 12) as u16);
        buf[18] = 2;
        buf[19] = 2;
        buf[20] = b'.';
        buf[21] = b'.';
        if self.metadata_csum {
            dirent_tail_init(&mut buf);
            crate::dir::dirent_csum_set(fs, ROOT_INO, 0, &mut buf);
        }
        io.write_blocks(blk, 1, &buf)?;

        let inode = ibuf.inode_mut();
        inode.i_mode = S_IFDIR | 0o755;
        inode.i_links_count = 2;
        inode.i_size_lo = fs.blocksize;
        inode.i_blocks_lo = fs.blocksize / 512;
        inode.i_block[0] = blk as u32;
        if self.inode_size > 128 {
            inode.i_extra_isize = 32;
        }
        fs.block_alloc_stats(blk, 1);
        Ok(())
    }
}

/// Finds one free block in the view, marking it used with statistics.
pub fn alloc_block(fs: &mut Ext4Fs) -> Result<Blk> {
    let first = fs.sb.s_first_data_block as u64;
    let end = fs.sb.blocks_count();
    let ratio = fs.cluster_ratio() as u64;
    let mut blk = first.next_multiple_of(ratio);
    while blk < end {
        if !fs.test_block(&fs.block_map, blk) {
            fs.block_alloc_stats(blk, 1);
            return Ok(blk);
        }
        blk += ratio;
    }
    Err(Error::NoSpace("image is full".into()))
}

/// Creates a regular file `ino` whose data is the given list of extents
/// `(logical, len, start)`, using an extent tree.
///
/// Block contents are not written; callers fill them as needed.
pub fn add_file(
    io: &mut IoChannel,
    fs: &mut Ext4Fs,
    ino: Ino,
    runs: &[(u32, u16, Blk)],
) -> Result<()> {
    let mut ibuf = InodeBuf::new(fs.sb.inode_size());
    let mut total = 0u64;
    for (_, len, start) in runs {
        fs.block_alloc_stats_range(*start, *len as u64, 1);
        total += *len as u64;
    }
    {
        let bs = fs.blocksize;
        let inode = ibuf.inode_mut();
        inode.i_mode = S_IFREG | 0o644;
        inode.i_links_count = 1;
        inode.i_size_lo = (total * bs as u64) as u32;
        inode.i_size_high = ((total * bs as u64) >> 32) as u32;
        inode.i_blocks_lo = (total * (bs as u64 / 512)) as u32;
        if fs.sb.inode_size() > 128 {
            inode.i_extra_isize = 32;
        }
    }

    if runs.len() <= 4 {
        extent::init_root(&mut ibuf, runs);
    } else {
        // Push the extents into a separate leaf block
        let leaf = alloc_block(fs)?;
        let mut buf = vec![0u8; fs.blocksize as usize];
        extent::fill_leaf_block(fs, &mut buf, runs);
        extent::leaf_block_csum_set(fs, ino, 0, &mut buf);
        io.write_blocks(leaf, 1, &buf)?;
        extent::init_root_idx(&mut ibuf, runs[0].0, leaf);
        let bs = fs.blocksize as u64 / 512;
        let blocks = ibuf.inode().i_blocks_lo;
        ibuf.inode_mut().i_blocks_lo = blocks + bs as u32;
    }

    fs.inode_alloc_stats(ino, 1, false);
    fs.write_inode_full(io, ino, &mut ibuf)?;
    Ok(())
}

/// Creates a directory `ino` with one data block holding `.`, `..` and the
/// given `(name, ino)` entries.
pub fn add_dir(
    io: &mut IoChannel,
    fs: &mut Ext4Fs,
    ino: Ino,
    parent: Ino,
    entries: &[(&str, Ino)],
) -> Result<()> {
    let bs = fs.blocksize as usize;
    let blk = alloc_block(fs)?;
    let metadata_csum = fs.sb.has_metadata_csum();
    let usable = if metadata_csum { bs - 12 } else { bs };

    let mut buf = vec![0u8; bs];
    let mut off = 0;
    let mut add = |buf: &mut [u8], off: &mut usize, name: &str, ino: Ino, last: bool| {
        let name = name.as_bytes();
        let rec_len = if last {
            usable - *off
        } else {
            (8 + name.len() + 3) & !3
        };
        write_u32(buf, *off, ino);
        write_u16(buf, *off + 4, rec_len as u16);
        buf[*off + 6] = name.len() as u8;
        buf[*off + 7] = 2;
        buf[*off + 8..*off + 8 + name.len()].copy_from_slice(name);
        *off += rec_len;
    };
    add(&mut buf, &mut off, ".", ino, false);
    add(&mut buf, &mut off, "..", parent, entries.is_empty());
    for (i, (name, target)) in entries.iter().enumerate() {
        add(&mut buf, &mut off, name, *target, i + 1 == entries.len());
    }
    if metadata_csum {
        dirent_tail_init(&mut buf);
        crate::dir::dirent_csum_set(fs, ino, 0, &mut buf);
    }
    io.write_blocks(blk, 1, &buf)?;

    let mut ibuf = InodeBuf::new(fs.sb.inode_size());
    {
        let inode = ibuf.inode_mut();
        inode.i_mode = S_IFDIR | 0o755;
        inode.i_links_count = 2;
        inode.i_size_lo = fs.blocksize;
        inode.i_blocks_lo = fs.blocksize / 512;
        if fs.sb.inode_size() > 128 {
            inode.i_extra_isize = 32;
        }
    }
    extent::init_root(&mut ibuf, &[(0, 1, blk)]);
    fs.inode_alloc_stats(ino, 1, true);
    fs.write_inode_full(io, ino, &mut ibuf)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    /// Asserts per-group free counts agree with the bitmaps.
    pub fn check_bitmap_sums(fs: &Ext4Fs) {
        let mut free_clusters = 0u64;
        let mut free_inodes = 0u64;
        for g in 0..fs.groups {
            let base = fs.b2c(fs.group_first_block(g));
            let cpg = fs.clusters_per_group() as u64;
            let bits = cpg.min(fs.clusters_count() - base);
            let used = fs.block_map.count_range(base, bits);
            assert_eq!(
                bits - used,
                fs.bg_free_blocks_count(g) as u64,
                "free block count of group {g}"
            );
            free_clusters += bits - used;

            let ipg = fs.sb.s_inodes_per_group as u64;
            let used = fs.inode_map.count_range(g as u64 * ipg + 1, ipg);
            assert_eq!(
                ipg - used,
                fs.bg_free_inodes_count(g) as u64,
                "free inode count of group {g}"
            );
            free_inodes += ipg - used;
        }
        assert_eq!(free_clusters, fs.sb.free_blocks_count());
        let sb_free_inodes = fs.sb.s_free_inodes_count;
        assert_eq!(free_inodes, sb_free_inodes as u64);
    }

    #[test]
    fn create_and_reopen() {
        let dev = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        let factory = Ext4Factory {
            blocks: 8192,
            block_size: 1024,
            inodes_per_group: 512,
            blocks_per_group: 8192,
            ..Default::default()
        };
        let fs = factory.create(&mut io).unwrap();
        check_bitmap_sums(&fs);

        let mut back = Ext4Fs::open(&mut io).unwrap();
        assert_eq!(back.groups, 1);
        let ipg = back.sb.s_inodes_per_group;
        assert_eq!(ipg, 512);
        back.read_bitmaps(&mut io).unwrap();
        check_bitmap_sums(&back);

        // Root directory must be readable
        let ibuf = back.read_inode_full(&mut io, ROOT_INO).unwrap();
        assert!(ibuf.inode().is_dir());
    }

    #[test]
    fn create_with_metadata_csum() {
        let dev = Cursor::new(vec![0u8; 16 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        let factory = Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            inodes_per_group: 256,
            blocks_per_group: 4096,
            log_groups_per_flex: 1,
            metadata_csum: true,
            ..Default::default()
        };
        let fs = factory.create(&mut io).unwrap();
        assert_eq!(fs.groups, 4);
        check_bitmap_sums(&fs);

        let mut back = Ext4Fs::open(&mut io).unwrap();
        back.read_bitmaps(&mut io).unwrap();
        // Checksummed root inode must verify
        let ibuf = back.read_inode_full(&mut io, ROOT_INO).unwrap();
        assert!(ibuf.inode().is_dir());
    }
}
