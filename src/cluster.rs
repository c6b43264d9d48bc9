//! Alignment of inode-table block ranges to allocation clusters.
//!
//! On `bigalloc` filesystems, allocation is tracked per cluster. Inode
//! tables do not necessarily start or end on a cluster boundary, so a range
//! of table blocks to release must be trimmed to the whole clusters it
//! actually owns. Other metadata sharing a cluster with a table is always
//! placed before it, so a table only owns a cluster when it holds the
//! cluster's first block.

use ext4::fs::Ext4Fs;
use ext4::Blk;

/// Rounds the range `(first, num)` to whole clusters, in place.
///
/// After the call, `first` is cluster-aligned and `num` is a multiple of the
/// cluster size, possibly zero when the range owns no complete cluster.
pub fn align_range_to_clusters(fs: &Ext4Fs, first: &mut Blk, num: &mut u64) {
    let cluster_size = fs.cluster_ratio() as u64;
    if *num == 0 {
        return;
    }
    let start = *first;
    let end = *first + *num - 1;
    let mask = cluster_size - 1;

    // Advance an unaligned start to the next cluster boundary
    if start % cluster_size != 0 {
        let diff = cluster_size - start % cluster_size;
        *first += diff;
        if *num <= diff {
            *num = 0;
        } else {
            *num -= diff;
        }
    }

    // Extend the end to the cluster boundary
    if end & mask != mask && *num != 0 {
        *num += cluster_size - end % cluster_size - 1;
    }

    // When several tables share one cluster, only the range holding the
    // cluster's first block may free it
    if *first > (end & !mask) {
        if *num <= cluster_size {
            *num = 0;
        } else {
            *num -= cluster_size;
        }
    }
}

/// Releases a range of inode-table blocks in the given view.
///
/// This is the only path through which inode-table ranges reach the
/// range-release primitive, so cluster alignment cannot be bypassed.
pub fn free_itable_range(fs: &mut Ext4Fs, first: Blk, num: u64) {
    let mut first = first;
    let mut num = num;
    if fs.sb.has_bigalloc() {
        align_range_to_clusters(fs, &mut first, &mut num);
    }
    if num > 0 {
        fs.block_alloc_stats_range(first, num, -1);
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use ext4::imgfmt::Ext4Factory;
    use ext4::io::IoChannel;
    use std::io::Cursor;

    fn bigalloc_fs(cluster_log: u32) -> Ext4Fs {
        let dev = Cursor::new(vec![0u8; 16 * 1024 * 1024]);
        let mut io = IoChannel::new(Box::new(dev), 1024);
        Ext4Factory {
            blocks: 16384,
            block_size: 1024,
            blocks_per_group: 16384,
            inodes_per_group: 512,
            cluster_log,
            ..Default::default()
        }
        .create(&mut io)
        .unwrap()
    }

    #[test]
    fn aligned_range_untouched() {
        let fs = bigalloc_fs(2);
        let mut first = 64;
        let mut num = 16;
        align_range_to_clusters(&fs, &mut first, &mut num);
        assert_eq!((first, num), (64, 16));
    }

    #[test]
    fn unaligned_start_advances() {
        let fs = bigalloc_fs(2);
        // Range 66..=81: the first whole cluster starts at 68; the end is
        // extended to the cluster boundary 83
        let mut first = 66;
        let mut num = 16;
        align_range_to_clusters(&fs, &mut first, &mut num);
        assert_eq!(first % 4, 0);
        assert_eq!((first + num) % 4, 0);
        assert_eq!((first, num), (68, 16));
    }

    #[test]
    fn tiny_range_owns_nothing() {
        let fs = bigalloc_fs(2);
        // Range 65..=66 never reaches a cluster's first block
        let mut first = 65;
        let mut num = 2;
        align_range_to_clusters(&fs, &mut first, &mut num);
        assert_eq!(num, 0);
    }

    #[test]
    fn contract_holds() {
        let fs = bigalloc_fs(3);
        for start in 0..32u64 {
            for len in 1..40u64 {
                let mut first = start;
                let mut num = len;
                align_range_to_clusters(&fs, &mut first, &mut num);
                if num > 0 {
                    assert_eq!(first % 8, 0, "start {start} len {len}");
                    assert_eq!((first + num) % 8, 0, "start {start} len {len}");
                    // Never frees more than the original range touched
                    assert!(first >= start);
                }
            }
        }
    }
}
