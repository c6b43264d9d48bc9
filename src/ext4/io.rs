//! The blocking block I/O channel.
//!
//! Both filesystem views of a running transaction share a single channel.
//! The channel optionally records the original contents of every block it is
//! about to overwrite into an undo file, so a botched operation can be rolled
//! back with an external tool.

use crate::Blk;
use std::collections::HashSet;
use std::fs::File;
use std::io;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;

/// Magic bytes at the beginning of an undo file.
const UNDO_MAGIC: &[u8; 8] = b"ICTLUNDO";

/// Trait for a backing device: anything seekable and readable/writable.
pub trait Device: Read + Write + Seek {}

impl<T: Read + Write + Seek> Device for T {}

/// An undo log capturing the pre-write contents of blocks.
struct Undo {
    /// The undo file.
    file: File,
    /// Blocks already captured.
    seen: HashSet<Blk>,
}

/// A blocking I/O channel over a device, addressed in filesystem blocks.
pub struct IoChannel {
    /// The backing device.
    dev: Box<dyn Device>,
    /// The filesystem block size in bytes.
    block_size: u32,
    /// The optional undo log.
    undo: Option<Undo>,
}

impl IoChannel {
    /// Creates a channel over `dev`.
    ///
    /// `block_size` may be adjusted later, once the superblock has been read.
    pub fn new(dev: Box<dyn Device>, block_size: u32) -> Self {
        Self {
            dev,
            block_size,
            undo: None,
        }
    }

    /// Returns the block size in bytes.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Sets the block size in bytes.
    pub fn set_block_size(&mut self, block_size: u32) {
        self.block_size = block_size;
    }

    /// Enables undo logging into `file`.
    ///
    /// Must be called before the first write.
    pub fn enable_undo(&mut self, mut file: File) -> io::Result<()> {
        file.write_all(UNDO_MAGIC)?;
        file.write_all(&self.block_size.to_le_bytes())?;
        self.undo = Some(Undo {
            file,
            seen: HashSet::new(),
        });
        Ok(())
    }

    /// Captures the current contents of blocks `blk..blk + count` into the
    /// undo file, for blocks not captured yet.
    fn capture(&mut self, blk: Blk, count: u64) -> io::Result<()> {
        let Some(undo) = &mut self.undo else {
            return Ok(());
        };
        let bs = self.block_size as u64;
        let mut buf = vec![0; bs as usize];

        for b in blk..blk + count {
            if !undo.seen.insert(b) {
                continue;
            }
            self.dev.seek(SeekFrom::Start(b * bs))?;
            // A short device read here means the write below would fail
            // anyway; capture zeroes in that case.
            match self.dev.read_exact(&mut buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => buf.fill(0),
                Err(e) => return Err(e),
            }
            undo.file.write_all(&b.to_le_bytes())?;
            undo.file.write_all(&buf)?;
        }

        Ok(())
    }

    /// Reads `count` blocks starting at block `blk` into `buf`.
    pub fn read_blocks(&mut self, blk: Blk, count: u32, buf: &mut [u8]) -> io::Result<()> {
        let bs = self.block_size as u64;
        let len = count as usize * bs as usize;
        self.dev.seek(SeekFrom::Start(blk * bs))?;
        self.dev.read_exact(&mut buf[..len])
    }

    /// Writes `count` blocks starting at block `blk` from `buf`.
    pub fn write_blocks(&mut self, blk: Blk, count: u32, buf: &[u8]) -> io::Result<()> {
        self.capture(blk, count as u64)?;
        let bs = self.block_size as u64;
        let len = count as usize * bs as usize;
        self.dev.seek(SeekFrom::Start(blk * bs))?;
        self.dev.write_all(&buf[..len])
    }

    /// Reads `buf.len()` bytes at the absolute byte offset `off`.
    pub fn read_bytes(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
        self.dev.seek(SeekFrom::Start(off))?;
        self.dev.read_exact(buf)
    }

    /// Writes `buf` at the absolute byte offset `off`.
    pub fn write_bytes(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
        let bs = self.block_size as u64;
        let first = off / bs;
        let last = (off + buf.len() as u64 + bs - 1) / bs;
        self.capture(first, last - first)?;
        self.dev.seek(SeekFrom::Start(off))?;
        self.dev.write_all(buf)
    }

    /// Flushes pending writes to the device.
    pub fn flush(&mut self) -> io::Result<()> {
        if let Some(undo) = &mut self.undo {
            undo.file.flush()?;
        }
        self.dev.flush()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn blocks_roundtrip() {
        let dev = Cursor::new(vec![0u8; 1024 * 8]);
        let mut io = IoChannel::new(Box::new(dev), 1024);

        let data = vec![0xabu8; 2048];
        io.write_blocks(3, 2, &data).unwrap();

        let mut back = vec![0u8; 2048];
        io.read_blocks(3, 2, &mut back).unwrap();
        assert_eq!(data, back);

        let mut one = vec![0u8; 1024];
        io.read_blocks(2, 1, &mut one).unwrap();
        assert!(one.iter().all(|b| *b == 0));
    }

    #[test]
    fn bytes_roundtrip() {
        let dev = Cursor::new(vec![0u8; 4096]);
        let mut io = IoChannel::new(Box::new(dev), 1024);

        io.write_bytes(1500, b"hello").unwrap();
        let mut back = [0u8; 5];
        io.read_bytes(1500, &mut back).unwrap();
        assert_eq!(&back, b"hello");
    }
}
