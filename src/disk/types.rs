use super::devpath::partition_path;

/// Byte range of a partition, `end` inclusive as parted prints it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub start: u64,
    pub end: u64,
}

impl Span {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start) + 1
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

/// Partition layout of one run.
///
/// Built by the locator, numbered by the layout planner and updated by the
/// recreator as partitions are actually created. `None` means the partition
/// is absent or not planned yet.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Partitions {
    pub source_dev_node: String,
    pub source_dev_path: String,
    pub target_dev_node: String,
    pub target_dev_path: String,

    pub recovery_nr: u32,
    pub sysboot_nr: Option<u32>,
    pub swap_nr: Option<u32>,
    pub writable_nr: Option<u32>,
    pub last_part_nr: Option<u32>,

    pub recovery_span: Option<Span>,
    pub sysboot_span: Option<Span>,
    pub swap_span: Option<Span>,
    pub writable_span: Option<Span>,

    /// Size of the target disk in bytes
    pub target_size: u64,
}

impl Partitions {
    pub fn same_disk(&self) -> bool {
        self.source_dev_path == self.target_dev_path
    }

    pub fn recovery_path(&self) -> String {
        partition_path(&self.source_dev_path, self.recovery_nr)
    }

    pub fn sysboot_path(&self) -> Option<String> {
        self.sysboot_nr
            .map(|nr| partition_path(&self.target_dev_path, nr))
    }

    pub fn swap_path(&self) -> Option<String> {
        self.swap_nr.map(|nr| partition_path(&self.target_dev_path, nr))
    }

    pub fn writable_path(&self) -> Option<String> {
        self.writable_nr
            .map(|nr| partition_path(&self.target_dev_path, nr))
    }

    /// End of the last partition that stays in front of writable.
    pub fn fixed_end(&self) -> Option<u64> {
        let recovery = if self.same_disk() {
            self.recovery_span
        } else {
            None
        };
        [recovery, self.sysboot_span, self.swap_span]
            .into_iter()
            .flatten()
            .map(|s| s.end)
            .max()
    }
}
