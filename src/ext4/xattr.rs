//! Extended attribute blocks and in-inode extended attribute areas.

use crate::crc32c;
use crate::fs::Ext4Fs;
use crate::inode::InodeBuf;
use crate::inode::GOOD_OLD_INODE_SIZE;
use crate::io::IoChannel;
use crate::read_u32;
use crate::write_u32;
use crate::Blk;
use crate::Error;
use crate::Result;

/// Magic number of an extended attribute block and of the in-inode area.
pub const EA_MAGIC: u32 = 0xea020000;
/// Size of the extended attribute block header.
pub const HEADER_SIZE: usize = 32;
/// Fixed size of one entry, before the name.
const ENTRY_SIZE: usize = 16;

/// Byte offset of `h_refcount` in the block header.
const REFCOUNT_OFFSET: usize = 4;
/// Byte offset of `h_checksum` in the block header.
const CSUM_OFFSET: usize = 12;

/// Returns the reference count of an extended attribute block.
pub fn block_refcount(buf: &[u8]) -> u32 {
    read_u32(buf, REFCOUNT_OFFSET)
}

/// Computes the checksum of an extended attribute block, keyed by its block
/// number.
fn block_csum(fs: &Ext4Fs, blk: Blk, buf: &[u8]) -> u32 {
    let mut bytes = buf.to_vec();
    write_u32(&mut bytes, CSUM_OFFSET, 0);
    let seed = crc32c::compute(fs.sb.csum_seed(), &blk.to_le_bytes());
    crc32c::compute(seed, &bytes)
}

/// Reads the extended attribute block `blk`, verifying its signature and
/// checksum.
pub fn read_block(io: &mut IoChannel, fs: &Ext4Fs, blk: Blk) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; fs.blocksize as usize];
    io.read_blocks(blk, 1, &mut buf)?;

    let magic = read_u32(&buf, 0);
    if magic != EA_MAGIC {
        return Err(Error::Corrupt(format!(
            "bad extended attribute block magic in block {blk}: {magic:#x}"
        )));
    }
    if fs.sb.has_metadata_csum() && !fs.ignore_csum_errors {
        let stored = read_u32(&buf, CSUM_OFFSET);
        if stored != block_csum(fs, blk, &buf) {
            return Err(Error::Corrupt(format!(
                "bad extended attribute block checksum in block {blk}"
            )));
        }
    }
    Ok(buf)
}

/// Writes the extended attribute block `blk`, refreshing its checksum.
pub fn write_block(io: &mut IoChannel, fs: &Ext4Fs, blk: Blk, buf: &mut [u8]) -> Result<()> {
    if fs.sb.has_metadata_csum() {
        let csum = block_csum(fs, blk, buf);
        write_u32(buf, CSUM_OFFSET, csum);
    }
    io.write_blocks(blk, 1, buf)?;
    Ok(())
}

/// Walks the entries of the region `buf`, applying `fix` to each entry's
/// `e_value_inum` field. `fix` returns the replacement number, or `None` to
/// leave the entry untouched.
///
/// Returns whether any entry was modified.
pub fn fix_entries(buf: &mut [u8], fix: &mut dyn FnMut(u32) -> Option<u32>) -> bool {
    let mut modified = false;
    let mut off = 0;

    while off + ENTRY_SIZE <= buf.len() {
        // The entry list ends on four zero bytes
        if read_u32(buf, off) == 0 {
            break;
        }
        let name_len = buf[off] as usize;
        let value_inum = read_u32(buf, off + 4);
        if let Some(new_inum) = fix(value_inum) {
            write_u32(buf, off + 4, new_inum);
            modified = true;
        }
        // Entries are padded to a 4-byte boundary
        off += ENTRY_SIZE + (name_len + 3) / 4 * 4;
    }
    modified
}

/// Applies `fix` to the in-inode extended attribute entries, if the inode
/// carries any.
///
/// Returns whether any entry was modified.
pub fn fix_ibody_entries(ibuf: &mut InodeBuf, fix: &mut dyn FnMut(u32) -> Option<u32>) -> bool {
    let inode_size = ibuf.raw().len();
    if inode_size <= GOOD_OLD_INODE_SIZE {
        return false;
    }
    let extra = {
        let inode = ibuf.inode();
        let extra = inode.i_extra_isize;
        extra as usize
    };
    if extra == 0 {
        return false;
    }
    let start = GOOD_OLD_INODE_SIZE + extra;
    if start + 4 > inode_size {
        return false;
    }
    if read_u32(ibuf.raw(), start) != EA_MAGIC {
        return false;
    }
    fix_entries(&mut ibuf.raw_mut()[start + 4..], fix)
}

/// Applies `fix` to the entries of an extended attribute block buffer.
///
/// Returns whether any entry was modified.
pub fn fix_block_entries(buf: &mut [u8], fix: &mut dyn FnMut(u32) -> Option<u32>) -> bool {
    fix_entries(&mut buf[HEADER_SIZE..], fix)
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds an entry region with the given `(name, value_inum)` entries.
    fn build_region(entries: &[(&str, u32)]) -> Vec<u8> {
        let mut buf = vec![0u8; 256];
        let mut off = 0;
        for (name, inum) in entries {
            let name = name.as_bytes();
            buf[off] = name.len() as u8;
            buf[off + 1] = 1; // name index: "user."
            write_u32(&mut buf, off + 4, *inum);
            write_u32(&mut buf, off + 8, 16); // value size
            buf[off + ENTRY_SIZE..off + ENTRY_SIZE + name.len()].copy_from_slice(name);
            off += ENTRY_SIZE + (name.len() + 3) / 4 * 4;
        }
        buf
    }

    #[test]
    fn fix_value_inums() {
        let mut buf = build_region(&[("alpha", 5000), ("beta", 30), ("gamma", 6000)]);
        let modified = fix_entries(&mut buf, &mut |inum| {
            (inum > 4096).then(|| inum - 4000)
        });
        assert!(modified);

        let mut seen = Vec::new();
        fix_entries(&mut buf, &mut |inum| {
            seen.push(inum);
            None
        });
        assert_eq!(seen, vec![1000, 30, 2000]);
    }

    #[test]
    fn untouched_region_not_modified() {
        let mut buf = build_region(&[("alpha", 10)]);
        let before = buf.clone();
        let modified = fix_entries(&mut buf, &mut |_| None);
        assert!(!modified);
        assert_eq!(before, buf);
    }
}
