pub const MIB: u64 = 1024 * 1024;

/// Rounds a byte offset up to the next MiB boundary.
pub fn align_mib(offset: u64) -> u64 {
    offset.div_ceil(MIB).saturating_mul(MIB)
}

pub fn mib(count: u64) -> u64 {
    count.saturating_mul(MIB)
}

/// Parses a parted byte value such as `1048576B`.
pub fn parse_bytes(input: &str) -> Option<u64> {
    input.trim().strip_suffix('B')?.parse().ok()
}
