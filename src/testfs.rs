//! Shared fixtures for the transaction test suites: in-memory images and
//! consistency assertions.

use ext4::extent::block_iterate;
use ext4::extent::BlockKind;
use ext4::extent::IterAction;
use ext4::fs::Ext4Fs;
use ext4::imgfmt::Ext4Factory;
use ext4::io::IoChannel;
use ext4::Blk;
use ext4::Ino;
use std::io::Cursor;

/// Creates an image with the given factory settings and opens it.
pub fn image(factory: Ext4Factory) -> (IoChannel, Ext4Fs) {
    let len = factory.blocks as usize * factory.block_size as usize;
    let dev = Cursor::new(vec![0u8; len]);
    let mut io = IoChannel::new(Box::new(dev), factory.block_size);
    let fs = factory.create(&mut io).unwrap();
    (io, fs)
}

/// Asserts that every group's free counts agree with the bitmaps, and that
/// the superblock totals agree with the groups.
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
    assert_eq!(free_clusters, fs.sb.free_blocks_count(), "free block total");
    let sb_free_inodes = fs.sb.s_free_inodes_count;
    assert_eq!(free_inodes, sb_free_inodes as u64, "free inode total");
}

/// Fills one block with a pattern derived from `seed`.
pub fn fill_pattern(io: &mut IoChannel, bs: u32, blk: Blk, seed: u64) {
    let buf: Vec<u8> = (0..bs as usize)
        .map(|i| (seed as u8) ^ (i as u8).wrapping_mul(31))
        .collect();
    io.write_blocks(blk, 1, &buf).unwrap();
}

/// Asserts one block carries the pattern for `seed`.
pub fn assert_pattern(io: &mut IoChannel, bs: u32, blk: Blk, seed: u64) {
    let mut buf = vec![0u8; bs as usize];
    io.read_blocks(blk, 1, &mut buf).unwrap();
    for (i, b) in buf.iter().enumerate() {
        assert_eq!(
            *b,
            (seed as u8) ^ (i as u8).wrapping_mul(31),
            "block {blk}, byte {i}"
        );
    }
}

/// Returns the `(logical, physical)` data blocks of an inode.
pub fn data_blocks(io: &mut IoChannel, fs: &Ext4Fs, ino: Ino) -> Vec<(u64, Blk)> {
    let mut ibuf = fs.read_inode_full(io, ino).unwrap();
    let mut out = Vec::new();
    let mut alloc = || -> ext4::Result<Blk> { unreachable!() };
    block_iterate(io, fs, ino, &mut ibuf, &mut alloc, &mut |blk, kind| {
        if let BlockKind::Data(logical) = kind {
            out.push((logical, blk));
        }
        IterAction::Keep
    })
    .unwrap();
    out
}

/// Reads the entries of a single-block directory as `(name, ino)` pairs.
pub fn dir_entries(io: &mut IoChannel, fs: &Ext4Fs, dir: Ino) -> Vec<(String, Ino)> {
    let blocks = data_blocks(io, fs, dir);
    assert_eq!(blocks.len(), 1, "directory {dir} should have one block");
    let mut buf = vec![0u8; fs.blocksize as usize];
    io.read_blocks(blocks[0].1, 1, &mut buf).unwrap();

    let mut out = Vec::new();
    let mut off = 0;
    while off < buf.len() {
        let ino = ext4::read_u32(&buf, off);
        let rec_len = ext4::read_u16(&buf, off + 4) as usize;
        let name_len = buf[off + 6] as usize;
        if rec_len < 8 {
            break;
        }
        if ino != 0 && name_len > 0 {
            let name = String::from_utf8_lossy(&buf[off + 8..off + 8 + name_len]).into_owned();
            out.push((name, ino));
        }
        off += rec_len;
    }
    out
}
