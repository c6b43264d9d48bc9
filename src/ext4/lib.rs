/*
 * Copyright 2025 Luc Lenôtre
 *
 * This file is part of Maestro.
 *
 * Maestro is free software: you can redistribute it and/or modify it under the
 * terms of the GNU General Public License as published by the Free Software
 * Foundation, either version 3 of the License, or (at your option) any later
 * version.
 *
 * Maestro is distributed in the hope that it will be useful, but WITHOUT ANY
 * WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS FOR
 * A PARTICULAR PURPOSE. See the GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License along with
 * Maestro. If not, see <https://www.gnu.org/licenses/>.
 */

//! Minimal ext4 on-disk support library.
//!
//! This crate implements the parts of the ext4 on-disk format needed to
//! manipulate an unmounted filesystem image: superblock and group
//! descriptors, block/inode allocation bitmaps, inode I/O, extent and
//! indirect block traversal, directory blocks, extended attributes and the
//! badblocks list. Higher-level tools build on the [`fs::Ext4Fs`] view
//! handle.

use std::fmt;
use std::io as stdio;
use std::mem::size_of;
use std::slice;

pub mod badblocks;
pub mod bitmap;
pub mod crc16;
pub mod crc32c;
pub mod desc;
pub mod dir;
pub mod extent;
pub mod fs;
pub mod imgfmt;
pub mod inode;
pub mod io;
pub mod sb;
pub mod xattr;

/// A block number.
pub type Blk = u64;
/// An inode number, starting at `1`.
pub type Ino = u32;
/// A block group number.
pub type Group = u32;

/// The badblocks inode.
pub const BAD_INO: Ino = 1;
/// The root directory inode.
pub const ROOT_INO: Ino = 2;
/// The resize inode.
pub const RESIZE_INO: Ino = 7;

/// Errors reported by the library and by the tools built on it.
#[derive(Debug)]
pub enum Error {
    /// A failure from the underlying block channel.
    Io(stdio::Error),
    /// No free block could be found, or not enough movable blocks exist.
    NoSpace(String),
    /// An iteration over block groups completed without making progress.
    NoProgress,
    /// An inode could not be renumbered below the new ceiling.
    RenumberOutOfRange {
        /// The inode being moved.
        ino: Ino,
        /// The highest allowed inode number.
        ceiling: Ino,
    },
    /// The target capacity is below the number of inodes currently in use.
    NotEnoughInodes {
        /// The number of inodes in use.
        in_use: u32,
        /// The requested capacity.
        capacity: u32,
    },
    /// A feature flag forbids the requested operation.
    FeatureForbidden(&'static str),
    /// The on-disk structures are not in the expected shape.
    Corrupt(String),
    /// A failure reported from inside an iteration callback.
    Aborted(String),
}

/// Result alias for [`Error`].
pub type Result<T> = std::result::Result<T, Error>;

impl From<stdio::Error> for Error {
    fn from(e: stdio::Error) -> Self {
        Self::Io(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "I/O error: {e}"),
            Self::NoSpace(msg) => write!(f, "not enough free space: {msg}"),
            Self::NoProgress => write!(
                f,
                "could not allocate any additional inode table, giving up"
            ),
            Self::RenumberOutOfRange { ino, ceiling } => write!(
                f,
                "inode {ino} could not be renumbered below {ceiling}; choose a larger inode count"
            ),
            Self::NotEnoughInodes { in_use, capacity } => write!(
                f,
                "not enough inodes: {in_use} in use, but the requested capacity is {capacity}"
            ),
            Self::FeatureForbidden(feature) => {
                write!(f, "operation forbidden by the `{feature}` feature")
            }
            Self::Corrupt(msg) => write!(f, "corrupt filesystem: {msg}"),
            Self::Aborted(msg) => write!(f, "aborted: {msg}"),
        }
    }
}

/// Reinterprets the given reference as a byte slice.
pub fn reinterpret<T>(val: &T) -> &[u8] {
    unsafe { slice::from_raw_parts(val as *const _ as *const u8, size_of::<T>()) }
}

/// Reads a little-endian `u32` at `off` in `buf`.
pub fn read_u32(buf: &[u8], off: usize) -> u32 {
    u32::from_le_bytes([buf[off], buf[off + 1], buf[off + 2], buf[off + 3]])
}

/// Writes a little-endian `u32` at `off` in `buf`.
pub fn write_u32(buf: &mut [u8], off: usize, val: u32) {
    buf[off..off + 4].copy_from_slice(&val.to_le_bytes());
}

/// Reads a little-endian `u16` at `off` in `buf`.
pub fn read_u16(buf: &[u8], off: usize) -> u16 {
    u16::from_le_bytes([buf[off], buf[off + 1]])
}

/// Writes a little-endian `u16` at `off` in `buf`.
pub fn write_u16(buf: &mut [u8], off: usize, val: u16) {
    buf[off..off + 2].copy_from_slice(&val.to_le_bytes());
}
