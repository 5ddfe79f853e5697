//! Splitting partition device paths into disk and partition number.
//!
//! Block devices whose name ends in a digit get a `p` between the disk
//! name and the partition number, everything else gets the number directly.

use anyhow::{Result, anyhow};
use regex::Regex;
use std::sync::LazyLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Naming {
    /// `/dev/sda3`, `/dev/vdb1`, `/dev/xvda2`
    Numeric,
    /// `/dev/mmcblk0p3`
    Mmc,
    /// `/dev/nvme0n1p3`
    Nvme,
    /// `/dev/loop0p3`
    Loop,
    /// `/dev/md126p3`
    Raid,
    /// `/dev/mapper/loop0p3`
    Mapper,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartitionDevice {
    /// Disk path without the partition suffix, `/dev/mmcblk0`
    pub disk_path: String,
    /// Last component of the disk path, `mmcblk0`
    pub disk_node: String,
    pub nr: u32,
    pub naming: Naming,
}

static PATTERNS: LazyLock<Vec<(Naming, Regex)>> = LazyLock::new(|| {
    [
        (Naming::Numeric, r"^(/dev/(?:sd|vd|hd|xvd)[a-z]+)([0-9]+)$"),
        (Naming::Mmc, r"^(/dev/mmcblk[0-9]+)p([0-9]+)$"),
        (Naming::Nvme, r"^(/dev/nvme[0-9]+n[0-9]+)p([0-9]+)$"),
        (Naming::Loop, r"^(/dev/loop[0-9]+)p([0-9]+)$"),
        (Naming::Raid, r"^(/dev/md[0-9]+)p([0-9]+)$"),
        (Naming::Mapper, r"^(/dev/mapper/.+?)p([0-9]+)$"),
    ]
    .into_iter()
    .filter_map(|(naming, pattern)| Regex::new(pattern).ok().map(|re| (naming, re)))
    .collect()
});

pub fn split_partition_path(path: &str) -> Result<PartitionDevice> {
    let path = path.trim();
    for (naming, re) in PATTERNS.iter() {
        let Some(caps) = re.captures(path) else {
            continue;
        };
        let disk_path = caps[1].to_string();
        let nr = caps[2]
            .parse()
            .map_err(|_| anyhow!("invalid partition number in {path}"))?;
        return Ok(PartitionDevice {
            disk_node: disk_node(&disk_path),
            disk_path,
            nr,
            naming: *naming,
        });
    }
    Err(anyhow!("unrecognized partition device path: {path}"))
}

/// Inverse of [`split_partition_path`].
pub fn partition_path(disk_path: &str, nr: u32) -> String {
    let needs_p = disk_path.starts_with("/dev/mapper/")
        || disk_path.ends_with(|c: char| c.is_ascii_digit());
    if needs_p {
        format!("{disk_path}p{nr}")
    } else {
        format!("{disk_path}{nr}")
    }
}

/// Basename of the disk, `/dev/mapper/loop0` gives `loop0`.
pub fn disk_node(disk_path: &str) -> String {
    disk_path
        .rsplit('/')
        .next()
        .unwrap_or(disk_path)
        .to_string()
}

/// Accepts `mmcblk1` as well as `/dev/mmcblk1`.
pub fn disk_path(device: &str) -> String {
    let device = device.trim();
    if device.starts_with("/dev/") {
        device.to_string()
    } else {
        format!("/dev/{device}")
    }
}
