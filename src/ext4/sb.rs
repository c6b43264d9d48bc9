//! The ext4 superblock.

use crate::crc32c;
use crate::io::IoChannel;
use crate::reinterpret;
use crate::Blk;
use crate::Error;
use crate::Ino;
use crate::Result;
use std::mem;
use std::mem::size_of;
use std::slice;

/// The offset of the superblock from the beginning of the device.
pub const SUPERBLOCK_OFFSET: u64 = 1024;
/// The filesystem's signature.
pub const EXT4_SIGNATURE: u16 = 0xef53;

/// Filesystem state: cleanly unmounted.
pub const STATE_VALID: u16 = 0x1;
/// Filesystem state: errors detected.
pub const STATE_ERROR: u16 = 0x2;

/// Compatible feature: the filesystem has a journal.
pub const COMPAT_HAS_JOURNAL: u32 = 0x4;
/// Compatible feature: extended attributes.
pub const COMPAT_EXT_ATTR: u32 = 0x8;
/// Compatible feature: reserved GDT blocks for online resize.
pub const COMPAT_RESIZE_INODE: u32 = 0x10;
/// Compatible feature: directory hash index.
pub const COMPAT_DIR_INDEX: u32 = 0x20;
/// Compatible feature: inode numbers must not change.
pub const COMPAT_STABLE_INODES: u32 = 0x800;

/// Incompatible feature: directory entries carry a file type.
pub const INCOMPAT_FILETYPE: u32 = 0x2;
/// Incompatible feature: the journal needs recovery.
pub const INCOMPAT_RECOVER: u32 = 0x4;
/// Incompatible feature: extents.
pub const INCOMPAT_EXTENTS: u32 = 0x40;
/// Incompatible feature: 64-bit block counts and 64-byte descriptors.
pub const INCOMPAT_64BIT: u32 = 0x80;
/// Incompatible feature: multi-mount protection.
pub const INCOMPAT_MMP: u32 = 0x100;
/// Incompatible feature: flexible block groups.
pub const INCOMPAT_FLEX_BG: u32 = 0x200;
/// Incompatible feature: extended attribute values in dedicated inodes.
pub const INCOMPAT_EA_INODE: u32 = 0x400;
/// Incompatible feature: the checksum seed is stored in the superblock.
pub const INCOMPAT_CSUM_SEED: u32 = 0x2000;
/// Incompatible feature: data inline in the inode.
pub const INCOMPAT_INLINE_DATA: u32 = 0x8000;

/// Read-only compatible feature: sparse superblock backups.
pub const RO_COMPAT_SPARSE_SUPER: u32 = 0x1;
/// Read-only compatible feature: group descriptor checksums (uninit_bg).
pub const RO_COMPAT_GDT_CSUM: u32 = 0x10;
/// Read-only compatible feature: cluster-granular allocation.
pub const RO_COMPAT_BIGALLOC: u32 = 0x200;
/// Read-only compatible feature: checksums on all metadata.
pub const RO_COMPAT_METADATA_CSUM: u32 = 0x400;

/// The ext4 superblock structure.
#[repr(C, packed)]
#[derive(Clone, Copy)]
pub struct Superblock {
    /// Total number of inodes.
    pub s_inodes_count: u32,
    /// Total number of blocks (low 32 bits).
    pub s_blocks_count_lo: u32,
    /// Number of reserved blocks (low 32 bits).
    pub s_r_blocks_count_lo: u32,
    /// Number of free blocks or clusters (low 32 bits).
    pub s_free_blocks_count_lo: u32,
    /// Number of free inodes.
    pub s_free_inodes_count: u32,
    /// The first data block.
    pub s_first_data_block: u32,
    /// log2(block size) - 10
    pub s_log_block_size: u32,
    /// log2(cluster size) - 10
    pub s_log_cluster_size: u32,
    /// Number of blocks per group.
    pub s_blocks_per_group: u32,
    /// Number of clusters per group.
    pub s_clusters_per_group: u32,
    /// Number of inodes per group.
    pub s_inodes_per_group: u32,
    /// Timestamp of the last mount.
    pub s_mtime: u32,
    /// Timestamp of the last write.
    pub s_wtime: u32,
    /// Number of mounts since the last check.
    pub s_mnt_count: u16,
    /// Number of mounts allowed before a check.
    pub s_max_mnt_count: u16,
    /// The signature.
    pub s_magic: u16,
    /// The filesystem state.
    pub s_state: u16,
    /// Behaviour on error.
    pub s_errors: u16,
    /// Minor revision.
    pub s_minor_rev_level: u16,
    /// Timestamp of the last check.
    pub s_lastcheck: u32,
    /// Maximum interval between checks.
    pub s_checkinterval: u32,
    /// Creator OS.
    pub s_creator_os: u32,
    /// Revision level.
    pub s_rev_level: u32,
    /// Default UID for reserved blocks.
    pub s_def_resuid: u16,
    /// Default GID for reserved blocks.
    pub s_def_resgid: u16,

    /// First non-reserved inode.
    pub s_first_ino: u32,
    /// Size of an inode in bytes.
    pub s_inode_size: u16,
    /// Block group of this superblock copy.
    pub s_block_group_nr: u16,
    /// Compatible features.
    pub s_feature_compat: u32,
    /// Incompatible features.
    pub s_feature_incompat: u32,
    /// Read-only compatible features.
    pub s_feature_ro_compat: u32,
    /// Filesystem UUID.
    pub s_uuid: [u8; 16],
    /// Volume name.
    pub s_volume_name: [u8; 16],
    /// Path of the last mount point.
    pub s_last_mounted: [u8; 64],
    /// Compression algorithms in use.
    pub s_algorithm_usage_bitmap: u32,
    /// Blocks to preallocate for files.
    pub s_prealloc_blocks: u8,
    /// Blocks to preallocate for directories.
    pub s_prealloc_dir_blocks: u8,
    /// Number of reserved GDT blocks for online growth.
    pub s_reserved_gdt_blocks: u16,
    /// Journal UUID.
    pub s_journal_uuid: [u8; 16],
    /// Journal inode.
    pub s_journal_inum: u32,
    /// Journal device.
    pub s_journal_dev: u32,
    /// Head of the orphan inode list.
    pub s_last_orphan: u32,
    /// HTREE hash seed.
    pub s_hash_seed: [u32; 4],
    /// Default hash version.
    pub s_def_hash_version: u8,
    /// Journal backup type.
    pub s_jnl_backup_type: u8,
    /// Group descriptor size.
    pub s_desc_size: u16,
    /// Default mount options.
    pub s_default_mount_opts: u32,
    /// First meta block group.
    pub s_first_meta_bg: u32,
    /// Creation timestamp.
    pub s_mkfs_time: u32,
    /// Backup of the journal inode.
    pub s_jnl_blocks: [u32; 17],

    /// Total number of blocks (high 32 bits).
    pub s_blocks_count_hi: u32,
    /// Number of reserved blocks (high 32 bits).
    pub s_r_blocks_count_hi: u32,
    /// Number of free blocks or clusters (high 32 bits).
    pub s_free_blocks_count_hi: u32,
    /// All inodes have at least this many extra bytes.
    pub s_min_extra_isize: u16,
    /// New inodes should reserve this many extra bytes.
    pub s_want_extra_isize: u16,
    /// Miscellaneous flags.
    pub s_flags: u32,
    /// RAID stride.
    pub s_raid_stride: u16,
    /// MMP check interval in seconds.
    pub s_mmp_interval: u16,
    /// Block used by multi-mount protection.
    pub s_mmp_block: u64,
    /// Blocks on all data disks.
    pub s_raid_stripe_width: u32,
    /// log2(groups per flex group)
    pub s_log_groups_per_flex: u8,
    /// Metadata checksum algorithm (1 = crc32c).
    pub s_checksum_type: u8,
    /// Padding.
    pub s_reserved_pad: u16,
    /// Kilobytes written over the filesystem's lifetime.
    pub s_kbytes_written: u64,
    /// Inode of the active snapshot.
    pub s_snapshot_inum: u32,
    /// Id of the active snapshot.
    pub s_snapshot_id: u32,
    /// Blocks reserved for the active snapshot.
    pub s_snapshot_r_blocks_count: u64,
    /// Head of the snapshot list.
    pub s_snapshot_list: u32,
    /// Number of errors seen.
    pub s_error_count: u32,
    /// First error time.
    pub s_first_error_time: u32,
    /// Inode involved in the first error.
    pub s_first_error_ino: u32,
    /// Block involved in the first error.
    pub s_first_error_block: u64,
    /// Function where the first error happened.
    pub s_first_error_func: [u8; 32],
    /// Line of the first error.
    pub s_first_error_line: u32,
    /// Most recent error time.
    pub s_last_error_time: u32,
    /// Inode involved in the last error.
    pub s_last_error_ino: u32,
    /// Line of the last error.
    pub s_last_error_line: u32,
    /// Block involved in the last error.
    pub s_last_error_block: u64,
    /// Function where the last error happened.
    pub s_last_error_func: [u8; 32],
    /// Mount options.
    pub s_mount_opts: [u8; 64],
    /// Inode tracking user quota.
    pub s_usr_quota_inum: u32,
    /// Inode tracking group quota.
    pub s_grp_quota_inum: u32,
    /// Overhead clusters.
    pub s_overhead_clusters: u32,
    /// Groups holding superblock backups, when sparse_super2 is set.
    pub s_backup_bgs: [u32; 2],
    /// Encryption algorithms.
    pub s_encrypt_algos: [u8; 4],
    /// Salt for string2key.
    pub s_encrypt_pw_salt: [u8; 16],
    /// Inode of lost+found.
    pub s_lpf_ino: u32,
    /// Inode tracking project quota.
    pub s_prj_quota_inum: u32,
    /// Checksum seed, when csum_seed is set.
    pub s_checksum_seed: u32,
    /// High bits of the last write time.
    pub s_wtime_hi: u8,
    /// High bits of the last mount time.
    pub s_mtime_hi: u8,
    /// High bits of the creation time.
    pub s_mkfs_time_hi: u8,
    /// High bits of the last check time.
    pub s_lastcheck_hi: u8,
    /// High bits of the first error time.
    pub s_first_error_time_hi: u8,
    /// High bits of the last error time.
    pub s_last_error_time_hi: u8,
    /// Code of the first error.
    pub s_first_error_errcode: u8,
    /// Code of the last error.
    pub s_last_error_errcode: u8,
    /// Filename charset encoding.
    pub s_encoding: u16,
    /// Filename charset encoding flags.
    pub s_encoding_flags: u16,
    /// Inode of the orphan file.
    pub s_orphan_file_inum: u32,
    /// Reserved.
    pub s_reserved: [u32; 94],
    /// Superblock checksum.
    pub s_checksum: u32,
}

impl Superblock {
    /// Reads the superblock from the device.
    pub fn read(io: &mut IoChannel) -> Result<Self> {
        let mut sb: Superblock = unsafe { mem::zeroed() };
        let slice = unsafe {
            slice::from_raw_parts_mut(&mut sb as *mut _ as *mut u8, size_of::<Self>())
        };
        io.read_bytes(SUPERBLOCK_OFFSET, slice)?;

        let magic = sb.s_magic;
        if magic != EXT4_SIGNATURE {
            return Err(Error::Corrupt(format!(
                "bad superblock signature: {magic:#x}"
            )));
        }
        Ok(sb)
    }

    /// Writes the superblock back to the device, refreshing its checksum.
    pub fn write(&mut self, io: &mut IoChannel) -> Result<()> {
        if self.has_metadata_csum() {
            self.s_checksum = self.csum();
        }
        io.write_bytes(SUPERBLOCK_OFFSET, reinterpret(self))?;
        Ok(())
    }

    /// Computes the superblock checksum.
    pub fn csum(&self) -> u32 {
        let bytes = reinterpret(self);
        crc32c::compute(!0, &bytes[..bytes.len() - 4])
    }

    /// Returns the size of a block in bytes.
    pub fn block_size(&self) -> u32 {
        let log = self.s_log_block_size;
        1024 << log
    }

    /// Returns the size of an inode in bytes.
    pub fn inode_size(&self) -> u32 {
        if self.s_rev_level >= 1 {
            let size = self.s_inode_size;
            size as u32
        } else {
            128
        }
    }

    /// Returns the first non-reserved inode.
    pub fn first_ino(&self) -> Ino {
        if self.s_rev_level >= 1 {
            self.s_first_ino
        } else {
            11
        }
    }

    /// Returns the number of blocks per allocation cluster.
    pub fn cluster_ratio(&self) -> u32 {
        let log_c = self.s_log_cluster_size;
        let log_b = self.s_log_block_size;
        1 << (log_c - log_b)
    }

    /// Returns the size of a group descriptor in bytes.
    pub fn desc_size(&self) -> u32 {
        if self.has_64bit() {
            let size = self.s_desc_size;
            size as u32
        } else {
            32
        }
    }

    /// Returns the total number of blocks.
    pub fn blocks_count(&self) -> Blk {
        let lo = self.s_blocks_count_lo;
        if self.has_64bit() {
            let hi = self.s_blocks_count_hi;
            (hi as u64) << 32 | lo as u64
        } else {
            lo as u64
        }
    }

    /// Returns the number of free blocks (clusters, with `bigalloc`).
    pub fn free_blocks_count(&self) -> u64 {
        let lo = self.s_free_blocks_count_lo;
        if self.has_64bit() {
            let hi = self.s_free_blocks_count_hi;
            (hi as u64) << 32 | lo as u64
        } else {
            lo as u64
        }
    }

    /// Sets the number of free blocks (clusters, with `bigalloc`).
    pub fn set_free_blocks_count(&mut self, count: u64) {
        self.s_free_blocks_count_lo = count as u32;
        if self.has_64bit() {
            self.s_free_blocks_count_hi = (count >> 32) as u32;
        }
    }

    pub fn has_64bit(&self) -> bool {
        let f = self.s_feature_incompat;
        f & INCOMPAT_64BIT != 0
    }

    pub fn has_flex_bg(&self) -> bool {
        let f = self.s_feature_incompat;
        f & INCOMPAT_FLEX_BG != 0
    }

    pub fn has_mmp(&self) -> bool {
        let f = self.s_feature_incompat;
        f & INCOMPAT_MMP != 0
    }

    pub fn has_ea_inode(&self) -> bool {
        let f = self.s_feature_incompat;
        f & INCOMPAT_EA_INODE != 0
    }

    pub fn has_journal_needs_recovery(&self) -> bool {
        let f = self.s_feature_incompat;
        f & INCOMPAT_RECOVER != 0
    }

    pub fn has_bigalloc(&self) -> bool {
        let f = self.s_feature_ro_compat;
        f & RO_COMPAT_BIGALLOC != 0
    }

    pub fn has_metadata_csum(&self) -> bool {
        let f = self.s_feature_ro_compat;
        f & RO_COMPAT_METADATA_CSUM != 0
    }

    pub fn has_gdt_csum(&self) -> bool {
        let f = self.s_feature_ro_compat;
        f & RO_COMPAT_GDT_CSUM != 0
    }

    /// Tells whether group descriptors carry a checksum.
    pub fn has_group_desc_csum(&self) -> bool {
        self.has_metadata_csum() || self.has_gdt_csum()
    }

    pub fn has_sparse_super(&self) -> bool {
        let f = self.s_feature_ro_compat;
        f & RO_COMPAT_SPARSE_SUPER != 0
    }

    pub fn has_stable_inodes(&self) -> bool {
        let f = self.s_feature_compat;
        f & COMPAT_STABLE_INODES != 0
    }

    /// Returns the seed for metadata checksums.
    pub fn csum_seed(&self) -> u32 {
        let f = self.s_feature_incompat;
        if f & INCOMPAT_CSUM_SEED != 0 {
            self.s_checksum_seed
        } else {
            let uuid = self.s_uuid;
            crc32c::compute(!0, &uuid)
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn struct_size() {
        assert_eq!(size_of::<Superblock>(), 1024);
    }

    #[test]
    fn geometry() {
        let mut sb: Superblock = unsafe { mem::zeroed() };
        sb.s_rev_level = 1;
        sb.s_log_block_size = 2;
        sb.s_log_cluster_size = 2;
        sb.s_inode_size = 256;
        assert_eq!(sb.block_size(), 4096);
        assert_eq!(sb.inode_size(), 256);
        assert_eq!(sb.cluster_ratio(), 1);

        sb.s_feature_ro_compat |= RO_COMPAT_BIGALLOC;
        sb.s_log_cluster_size = 6;
        assert_eq!(sb.cluster_ratio(), 16);
    }

    #[test]
    fn counts_64bit() {
        let mut sb: Superblock = unsafe { mem::zeroed() };
        sb.s_feature_incompat = INCOMPAT_64BIT;
        sb.s_blocks_count_lo = 0x1234;
        sb.s_blocks_count_hi = 0x1;
        assert_eq!(sb.blocks_count(), 0x1_0000_1234);

        sb.set_free_blocks_count(0x2_0000_0042);
        assert_eq!(sb.free_blocks_count(), 0x2_0000_0042);
    }
}
