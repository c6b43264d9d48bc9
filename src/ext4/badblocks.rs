//! The badblocks list, stored as the block pointers of the badblocks inode.

use crate::extent::block_iterate;
use crate::extent::IterAction;
use crate::fs::Ext4Fs;
use crate::io::IoChannel;
use crate::Blk;
use crate::Result;
use crate::BAD_INO;

/// An ordered list of blocks known to be bad.
#[derive(Default)]
pub struct BadblocksList {
    list: Vec<Blk>,
    modified: bool,
}

impl BadblocksList {
    /// Loads the list from the badblocks inode.
    pub fn load(io: &mut IoChannel, fs: &Ext4Fs) -> Result<Self> {
        let mut ibuf = fs.read_inode_full(io, BAD_INO)?;
        let mut list = Vec::new();
        let mut alloc = || -> Result<Blk> { unreachable!() };
        block_iterate(io, fs, BAD_INO, &mut ibuf, &mut alloc, &mut |blk, _| {
            list.push(blk);
            IterAction::Keep
        })?;
        list.sort_unstable();
        Ok(Self {
            list,
            modified: false,
        })
    }

    /// Tells whether `blk` is bad.
    pub fn test(&self, blk: Blk) -> bool {
        self.list.binary_search(&blk).is_ok()
    }

    /// Removes `blk` from the list.
    pub fn del(&mut self, blk: Blk) {
        if let Ok(i) = self.list.binary_search(&blk) {
            self.list.remove(i);
            self.modified = true;
        }
    }

    /// Tells whether the list changed since it was loaded.
    pub fn modified(&self) -> bool {
        self.modified
    }

    /// Tells whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.list.is_empty()
    }

    /// Writes the list back into the badblocks inode, rewriting its block
    /// pointers in order and zeroing the now-unused trailing slots.
    pub fn store(&self, io: &mut IoChannel, fs: &Ext4Fs) -> Result<()> {
        let mut ibuf = fs.read_inode_full(io, BAD_INO)?;
        let mut next = 0usize;
        let mut alloc = || -> Result<Blk> { unreachable!() };
        let status = block_iterate(io, fs, BAD_INO, &mut ibuf, &mut alloc, &mut |_, _| {
            let action = match self.list.get(next) {
                Some(blk) => IterAction::Repl(*blk),
                None => IterAction::Repl(0),
            };
            next += 1;
            action
        })?;
        if status.changed {
            fs.write_inode_full(io, BAD_INO, &mut ibuf)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn ordered_queries() {
        let mut list = BadblocksList {
            list: vec![10, 20, 30],
            modified: false,
        };
        assert!(list.test(20));
        assert!(!list.test(21));

        list.del(20);
        assert!(!list.test(20));
        assert!(list.modified());

        list.del(21);
        assert_eq!(list.list, vec![10, 30]);
    }
}
