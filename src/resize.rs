//! The transaction state shared by the grow and shrink operations.
//!
//! A [`Resize`] owns the two filesystem views (old and new), the I/O channel
//! they share, the scratch bitmaps and translation tables, and the block
//! allocator used while making room for new inode tables. Every mutation
//! that touches globally shared blocks goes through methods here, so both
//! views stay in agreement.

use crate::extmap::ExtentMap;
use ext4::bitmap::Bitmap;
use ext4::fs::Ext4Fs;
use ext4::io::IoChannel;
use ext4::Blk;
use ext4::Result;

/// Debug flag: trace I/O.
pub const DEBUG_IO: u32 = 0x0001;
/// Debug flag: trace block relocation.
pub const DEBUG_BMOVE: u32 = 0x0002;
/// Debug flag: trace inode renumbering.
pub const DEBUG_INODEMAP: u32 = 0x0004;
/// Debug flag: trace inode table moves.
pub const DEBUG_ITABLEMOVE: u32 = 0x0008;

/// Progress pass identifiers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Pass {
    /// Extending or reallocating inode tables.
    ExtendItable = 1,
    /// Relocating data blocks.
    BlockReloc = 2,
    /// Scanning the inode table.
    InodeScan = 3,
    /// Updating inode references.
    InodeRefUpd = 4,
    /// Moving the inode table.
    MoveItable = 5,
}

/// A progress callback: `(pass, current, max)`. A returned error aborts the
/// pass.
pub type ProgressFn<'a> = dyn FnMut(Pass, u64, u64) -> Result<()> + 'a;

/// Allocation state of one group's new inode table during growth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TableStatus {
    /// No location found yet.
    NotAllocated,
    /// A zeroed table exists at its new location.
    Allocated,
    /// The group's inodes have been migrated into the new table.
    Filled,
}

/// Returns the current Unix timestamp.
pub fn now() -> u32 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs() as u32)
        .unwrap_or(0)
}

/// State of the block allocator's forward scan.
#[derive(Clone, Copy, PartialEq, Eq)]
enum AllocState {
    /// First sweep, from the cursor to the end of the block space.
    Scanning,
    /// Second sweep, wrapped around to the first data block.
    Desperation,
}

/// The state of one grow or shrink transaction.
pub struct Resize<'a> {
    /// The shared I/O channel.
    pub io: &'a mut IoChannel,
    /// The view of the filesystem as it was, read as-is.
    pub old: Ext4Fs,
    /// The view being constructed.
    pub new: Ext4Fs,
    /// Debug flags.
    pub flags: u32,
    /// The optional progress callback.
    pub progress: Option<&'a mut ProgressFn<'a>>,

    /// Translation of relocated clusters.
    pub bmap: Option<ExtentMap>,
    /// Translation of renumbered inodes.
    pub imap: Option<ExtentMap>,
    /// Blocks the allocator must never hand out: reserved destinations of
    /// upcoming inode tables.
    pub reserve_blocks: Bitmap,
    /// Data blocks to evacuate because a new inode table will land on them.
    pub move_blocks: Bitmap,
    /// Blocks handed out by the allocator during the current rewrite pass;
    /// the reference rewriter must not translate these again.
    pub fresh_blocks: Bitmap,
    /// Scratch buffer of one group's inode table size.
    pub itable_buf: Vec<u8>,

    /// Next candidate block of the allocator.
    new_blk: Blk,
    /// Scan state of the allocator.
    alloc_state: AllocState,
}

impl<'a> Resize<'a> {
    /// Creates the transaction over an opened filesystem. The new view
    /// starts as a duplicate of the old one.
    pub fn new(io: &'a mut IoChannel, fs: Ext4Fs, flags: u32) -> Self {
        let new = fs.clone();
        let start = fs.block_map.start();
        let end = fs.block_map.end();
        let first = fs.sb.s_first_data_block;
        Self {
            io,
            old: fs,
            new,
            flags,
            progress: None,
            bmap: None,
            imap: None,
            reserve_blocks: Bitmap::new(start, end),
            move_blocks: Bitmap::new(start, end),
            fresh_blocks: Bitmap::new(start, end),
            itable_buf: Vec::new(),
            new_blk: first as Blk,
            alloc_state: AllocState::Scanning,
        }
    }

    /// Sets the progress callback.
    pub fn set_progress(&mut self, progress: &'a mut ProgressFn<'a>) {
        self.progress = Some(progress);
    }

    /// Invokes the progress callback, if any.
    pub fn progress(&mut self, pass: Pass, cur: u64, max: u64) -> Result<()> {
        if let Some(progress) = &mut self.progress {
            progress(pass, cur, max)?;
        }
        Ok(())
    }

    /// Resets the allocator cursor to the first data block.
    pub fn init_block_alloc(&mut self) {
        self.new_blk = self.new.sb.s_first_data_block as Blk;
        self.alloc_state = AllocState::Scanning;
    }

    /// Finds the next unused block: not in the old view's block map, not
    /// reserved, and not freshly allocated. Wraps around once; returns
    /// `None` when the block space is exhausted.
    pub fn get_new_block(&mut self) -> Option<Blk> {
        loop {
            if self.new_blk >= self.old.sb.blocks_count() {
                if self.alloc_state == AllocState::Desperation {
                    return None;
                }
                self.alloc_state = AllocState::Desperation;
                self.new_blk = self.old.sb.s_first_data_block as Blk;
                continue;
            }
            let blk = self.new_blk;
            if scan_is_used(&self.old, &self.reserve_blocks, &self.fresh_blocks, blk) {
                self.new_blk += 1;
                continue;
            }
            return Some(blk);
        }
    }

    /// Allocates one block for a structure the library needs to grow,
    /// updating statistics in both views and remembering the block as
    /// freshly allocated.
    pub fn allocate_block(&mut self) -> Result<Blk> {
        let blk = self
            .get_new_block()
            .ok_or_else(|| ext4::Error::NoSpace("block allocator exhausted".into()))?;
        self.fresh_blocks.mark(self.old.b2c(blk));
        self.old.block_alloc_stats(blk, 1);
        self.new.block_alloc_stats(blk, 1);
        Ok(blk)
    }

    /// Builds the bitmap of untouchable metadata: both views' tables plus
    /// everything [`Ext4Fs::mark_table_blocks`] covers on the old view.
    pub fn build_meta_bitmap(&self) -> Bitmap {
        let mut meta = Bitmap::new(self.old.block_map.start(), self.old.block_map.end());
        self.old.mark_table_blocks(&mut meta);
        for g in 0..self.new.groups {
            let blk = self.new.inode_table_loc(g);
            if blk != 0 {
                self.new
                    .mark_block_range(&mut meta, blk, self.new.inode_blocks_per_group as u64);
            }
        }
        meta
    }

    /// Makes sure the scratch itable buffer holds `blocks` blocks.
    pub fn ensure_itable_buf(&mut self, blocks: u32) {
        let want = blocks as usize * self.new.blocksize as usize;
        if self.itable_buf.len() < want {
            self.itable_buf = vec![0; want];
        }
    }

    /// Prints a debug trace line when `flag` is enabled.
    pub fn debug(&self, flag: u32, msg: std::fmt::Arguments<'_>) {
        if self.flags & flag != 0 {
            println!("{msg}");
        }
    }
}

/// Tells whether `blk` is unavailable to the allocator: in use in the old
/// view, reserved as a future table destination, or already handed out this
/// pass.
pub fn scan_is_used(old: &Ext4Fs, reserve: &Bitmap, fresh: &Bitmap, blk: Blk) -> bool {
    let cluster = old.b2c(blk);
    old.block_map.test(cluster) || reserve.test(cluster) || fresh.test(cluster)
}

#[cfg(test)]
mod test {
    use super::*;
    use ext4::imgfmt::Ext4Factory;
    use std::io::Cursor;

    fn small_fs() -> (IoChannel, Ext4Fs) {
        let dev = Cursor::new(vec![0u8; 8 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        let fs = Ext4Factory {
            blocks: 4096,
            block_size: 1024,
            blocks_per_group: 4096,
            inodes_per_group: 128,
            ..Default::default()
        }
        .create(&mut io)
        .unwrap();
        (io, fs)
    }

    #[test]
    fn allocator_skips_used_and_reserved() {
        let (mut io, mut fs) = small_fs();
        fs.read_bitmaps(&mut io).unwrap();
        let mut rfs = Resize::new(&mut io, fs, 0);

        let first = rfs.get_new_block().unwrap();
        assert!(!rfs.old.block_map.test(rfs.old.b2c(first)));

        // Reserving the found block forces the next pick further out
        rfs.reserve_blocks.mark(rfs.old.b2c(first));
        let second = rfs.get_new_block().unwrap();
        assert_ne!(first, second);

        // allocate_block marks both views and the fresh set
        let blk = rfs.allocate_block().unwrap();
        assert!(rfs.old.block_map.test(rfs.old.b2c(blk)));
        assert!(rfs.new.block_map.test(rfs.new.b2c(blk)));
        assert!(rfs.fresh_blocks.test(rfs.old.b2c(blk)));
    }

    #[test]
    fn allocator_reports_exhaustion() {
        let (mut io, mut fs) = small_fs();
        fs.read_bitmaps(&mut io).unwrap();
        let mut rfs = Resize::new(&mut io, fs, 0);

        // Reserve the whole block space
        let start = rfs.old.block_map.start();
        let end = rfs.old.block_map.end();
        rfs.reserve_blocks.mark_range(start, end - start);
        assert!(rfs.get_new_block().is_none());
    }
}
