//! Directory blocks.
//!
//! Directories are iterated through a directory-block list fed by the block
//! iterator. Entries are patched in place inside the block buffer; when the
//! filesystem carries metadata checksums, a patched block gets its checksum
//! tail recomputed before being written back.

use crate::crc32c;
use crate::fs::Ext4Fs;
use crate::inode::INLINE_DATA_FL;
use crate::io::IoChannel;
use crate::read_u16;
use crate::read_u32;
use crate::write_u32;
use crate::Blk;
use crate::Error;
use crate::Ino;
use crate::Result;

/// Size of the checksum tail entry at the end of a directory block.
const TAIL_SIZE: usize = 12;
/// File type byte marking the checksum tail pseudo-entry.
const TAIL_FILETYPE: u8 = 0xde;
/// Byte offset of `i_block` inside the inode.
const I_BLOCK_OFFSET: usize = 0x28;

/// Decision returned by the directory-entry callback.
#[derive(Default, Clone, Copy)]
pub struct DirentAction {
    /// The entry was modified and the block must be written back.
    pub changed: bool,
    /// Stop the iteration.
    pub abort: bool,
}

/// One directory data block.
#[derive(Clone, Copy)]
pub struct DbEntry {
    /// The owning directory.
    pub ino: Ino,
    /// The block, or `0` for an inline directory.
    pub blk: Blk,
    /// The logical block index within the directory.
    pub blockcnt: u64,
}

/// The list of all directory blocks collected during an inode scan.
#[derive(Default)]
pub struct DbList {
    entries: Vec<DbEntry>,
}

impl DbList {
    /// Creates an empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends one directory block.
    pub fn add(&mut self, ino: Ino, blk: Blk, blockcnt: u64) {
        self.entries.push(DbEntry { ino, blk, blockcnt });
    }

    /// Returns the number of collected blocks.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Tells whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns the collected blocks.
    pub fn entries(&self) -> &[DbEntry] {
        &self.entries
    }
}

/// A view over one directory entry inside a block buffer.
pub struct DirEntry<'a> {
    buf: &'a mut [u8],
    off: usize,
}

impl DirEntry<'_> {
    /// Returns the referenced inode, `0` for an unused entry.
    pub fn ino(&self) -> Ino {
        read_u32(self.buf, self.off)
    }

    /// Points the entry at another inode.
    pub fn set_ino(&mut self, ino: Ino) {
        write_u32(self.buf, self.off, ino);
    }

    /// Returns the length of the entry record.
    pub fn rec_len(&self) -> usize {
        read_u16(self.buf, self.off + 4) as usize
    }

    /// Returns the length of the entry name.
    pub fn name_len(&self) -> usize {
        self.buf[self.off + 6] as usize
    }

    /// Returns the entry name.
    pub fn name(&self) -> &[u8] {
        &self.buf[self.off + 8..self.off + 8 + self.name_len()]
    }
}

/// Computes the checksum of a directory block, keyed by the owning directory.
fn dirent_csum(fs: &Ext4Fs, dir: Ino, generation: u32, buf: &[u8]) -> u32 {
    let mut key = crc32c::compute(fs.sb.csum_seed(), &dir.to_le_bytes());
    key = crc32c::compute(key, &generation.to_le_bytes());
    crc32c::compute(key, &buf[..buf.len() - TAIL_SIZE])
}

/// Tells whether the block ends with a checksum tail entry.
fn has_tail(buf: &[u8]) -> bool {
    let off = buf.len() - TAIL_SIZE;
    read_u32(buf, off) == 0
        && read_u16(buf, off + 4) as usize == TAIL_SIZE
        && buf[off + 6] == 0
        && buf[off + 7] == TAIL_FILETYPE
}

/// Recomputes the checksum tail of a directory block, if present.
pub fn dirent_csum_set(fs: &Ext4Fs, dir: Ino, generation: u32, buf: &mut [u8]) {
    if !fs.sb.has_metadata_csum() || !has_tail(buf) {
        return;
    }
    let csum = dirent_csum(fs, dir, generation, buf);
    let off = buf.len() - TAIL_SIZE;
    write_u32(buf, off + 8, csum);
}

/// Initializes the checksum tail entry of a fresh directory block.
pub fn dirent_tail_init(buf: &mut [u8]) {
    let off = buf.len() - TAIL_SIZE;
    write_u32(buf, off, 0);
    buf[off + 4..off + 6].copy_from_slice(&(TAIL_SIZE as u16).to_le_bytes());
    buf[off + 6] = 0;
    buf[off + 7] = TAIL_FILETYPE;
}

/// Walks the entries of one directory block buffer, invoking `cb` on each,
/// including unused entries. Returns the combined action.
fn iterate_block(
    dir: Ino,
    buf: &mut [u8],
    cb: &mut dyn FnMut(Ino, &mut DirEntry<'_>) -> DirentAction,
) -> Result<DirentAction> {
    let mut res = DirentAction::default();
    let len = buf.len();
    let mut off = 0;

    while off < len {
        let rec_len = read_u16(buf, off + 4) as usize;
        if rec_len < 8 || off + rec_len > len || rec_len % 4 != 0 {
            return Err(Error::Corrupt(format!(
                "directory {dir}: bad record length {rec_len}"
            )));
        }
        let mut ent = DirEntry {
            buf: &mut *buf,
            off,
        };
        let action = cb(dir, &mut ent);
        res.changed |= action.changed;
        if action.abort {
            res.abort = true;
            break;
        }
        off += rec_len;
    }
    Ok(res)
}

/// Iterates over every entry of every directory block in `dblist`.
///
/// `cb` may patch the entry; modified blocks are written back with a fresh
/// checksum tail. `force_rewrite` makes a block be rewritten even when no
/// entry changed, so its checksum is recomputed with the current keying.
pub fn dir_iterate(
    io: &mut IoChannel,
    fs: &Ext4Fs,
    dblist: &DbList,
    force_rewrite: &mut dyn FnMut(Ino) -> bool,
    cb: &mut dyn FnMut(Ino, &mut DirEntry<'_>) -> DirentAction,
) -> Result<()> {
    let bs = fs.blocksize as usize;

    for ent in dblist.entries() {
        let dir = ent.ino;
        if ent.blk == 0 {
            iterate_inline(io, fs, dir, cb)?;
            continue;
        }
        let mut buf = vec![0u8; bs];
        io.read_blocks(ent.blk, 1, &mut buf)?;

        let action = iterate_block(dir, &mut buf, cb)?;
        let rewrite = action.changed || force_rewrite(dir);
        if rewrite {
            let generation = {
                let ibuf = fs.read_inode_full(io, dir)?;
                let inode = ibuf.inode();
                inode.i_generation
            };
            dirent_csum_set(fs, dir, generation, &mut buf);
            io.write_blocks(ent.blk, 1, &buf)?;
        }
        if action.abort {
            return Err(Error::Aborted(format!(
                "directory iteration aborted in directory {dir}"
            )));
        }
    }
    Ok(())
}

/// Iterates over the entries of an inline-data directory, stored in the
/// inode's `i_block` area: the parent inode number followed by packed
/// entries.
fn iterate_inline(
    io: &mut IoChannel,
    fs: &Ext4Fs,
    dir: Ino,
    cb: &mut dyn FnMut(Ino, &mut DirEntry<'_>) -> DirentAction,
) -> Result<()> {
    let mut ibuf = fs.read_inode_full(io, dir)?;
    {
        let inode = ibuf.inode();
        let flags = inode.i_flags;
        if flags & INLINE_DATA_FL == 0 {
            return Err(Error::Corrupt(format!(
                "directory {dir}: expected inline data"
            )));
        }
    }
    let mut changed = false;

    // The first 4 bytes hold the parent directory ("..")
    let area = &mut ibuf.raw_mut()[I_BLOCK_OFFSET..I_BLOCK_OFFSET + 60];
    let parent = read_u32(area, 0);
    {
        let mut ent = DirEntry {
            buf: &mut *area,
            off: 0,
        };
        // Present the parent reference as a pseudo-entry; only the inode
        // field is meaningful.
        let action = cb(dir, &mut ent);
        changed |= action.changed;
        let _ = parent;
    }

    let mut off = 4;
    while off + 8 <= 60 {
        let rec_len = read_u16(area, off + 4) as usize;
        if rec_len < 8 || off + rec_len > 60 {
            break;
        }
        let mut ent = DirEntry {
            buf: &mut *area,
            off,
        };
        let action = cb(dir, &mut ent);
        changed |= action.changed;
        if action.abort {
            break;
        }
        off += rec_len;
    }

    if changed {
        fs.write_inode_full(io, dir, &mut ibuf)?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    /// Builds a directory block with the given `(name, ino)` entries.
    fn build_block(bs: usize, entries: &[(&str, Ino)], tail: bool) -> Vec<u8> {
        let mut buf = vec![0u8; bs];
        let usable = if tail { bs - TAIL_SIZE } else { bs };
        let mut off = 0;
        for (i, (name, ino)) in entries.iter().enumerate() {
            let name = name.as_bytes();
            let rec_len = if i + 1 == entries.len() {
                usable - off
            } else {
                (8 + name.len() + 3) & !3
            };
            write_u32(&mut buf, off, *ino);
            buf[off + 4..off + 6].copy_from_slice(&(rec_len as u16).to_le_bytes());
            buf[off + 6] = name.len() as u8;
            buf[off + 7] = 2; // directory
            buf[off + 8..off + 8 + name.len()].copy_from_slice(name);
            off += rec_len;
        }
        if tail {
            dirent_tail_init(&mut buf);
        }
        buf
    }

    #[test]
    fn iterate_and_patch() {
        let mut buf = build_block(1024, &[(".", 20), ("..", 2), ("sub", 4000)], false);
        let mut seen = Vec::new();
        let action = iterate_block(20, &mut buf, &mut |_, ent| {
            seen.push(ent.ino());
            let mut action = DirentAction::default();
            if ent.ino() == 4000 {
                ent.set_ino(123);
                action.changed = true;
            }
            action
        })
        .unwrap();
        assert!(action.changed);
        assert_eq!(seen, vec![20, 2, 4000]);

        let mut back = Vec::new();
        iterate_block(20, &mut buf, &mut |_, ent| {
            back.push(ent.ino());
            DirentAction::default()
        })
        .unwrap();
        assert_eq!(back, vec![20, 2, 123]);
    }

    #[test]
    fn tail_detection() {
        let buf = build_block(1024, &[(".", 2)], true);
        assert!(has_tail(&buf));
        let buf = build_block(1024, &[(".", 2)], false);
        assert!(!has_tail(&buf));
    }
}
