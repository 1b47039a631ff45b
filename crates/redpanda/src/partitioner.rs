//! Partition routing for events.

/// Maps a message key to a partition.
///
/// Uses FNV-1a so producers in different processes agree on the routing.
pub fn partition_for(key: &str, num_partitions: i32) -> i32 {
    if num_partitions <= 1 {
        return 0;
    }

    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for byte in key.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    (hash % num_partitions as u64) as i32
}
