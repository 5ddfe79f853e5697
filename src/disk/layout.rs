use anyhow::{Result, anyhow, bail};

use super::types::{Partitions, Span};
use super::utils::{MIB, align_mib, mib};
use crate::config::{Bootloader, DEFAULT_BOOT_SIZE_MIB, MIN_BOOT_SIZE_MIB, RecoveryConfig, RecoveryOs};
use crate::error::RecoveryError;

/// First MiB boundary after `prev_end`.
pub fn next_start(prev_end: u64) -> u64 {
    align_mib(prev_end + 1)
}

pub fn span_after(prev_end: u64, size_mib: u64) -> Span {
    let start = next_start(prev_end);
    Span::new(start, start + mib(size_mib) - 1)
}

/// Decides partition numbers and byte ranges for system-boot, swap and
/// writable relative to the recovery partition.
pub struct LayoutPlanner<'a> {
    config: &'a RecoveryConfig,
    os: RecoveryOs,
}

impl<'a> LayoutPlanner<'a> {
    pub fn new(config: &'a RecoveryConfig, os: RecoveryOs) -> Self {
        Self { config, os }
    }

    pub fn plan(&self, parts: &mut Partitions) -> Result<()> {
        match self.config.configs.bootloader {
            Bootloader::UBoot => self.plan_uboot(parts)?,
            Bootloader::Grub => self.plan_grub(parts)?,
        }
        if parts.target_size > 0 {
            parts.writable_span = Some(self.writable_span(parts)?);
        } else {
            parts.writable_span = None;
        }
        info!(
            "planned system-boot {:?} swap {:?} writable {:?} on {}",
            parts.sysboot_nr, parts.swap_nr, parts.writable_nr, parts.target_dev_path
        );
        Ok(())
    }

    /// u-boot firmware expects system-boot where it is, only writable moves.
    fn plan_uboot(&self, parts: &mut Partitions) -> Result<()> {
        if parts.sysboot_nr.is_none() {
            return Err(RecoveryError::LostSystemBoot.into());
        }
        parts.swap_nr = None;
        parts.swap_span = None;
        parts.writable_nr = Some(parts.recovery_nr + 1);
        Ok(())
    }

    fn plan_grub(&self, parts: &mut Partitions) -> Result<()> {
        let (sysboot_nr, sysboot_span) = if parts.same_disk() {
            let recovery = parts.recovery_span.ok_or_else(|| {
                anyhow!(
                    "recovery partition {} missing from {}",
                    parts.recovery_nr,
                    parts.target_dev_path
                )
            })?;
            (
                parts.recovery_nr + 1,
                span_after(recovery.end, self.boot_size_mib()),
            )
        } else {
            // fresh table on another disk
            (1, Span::new(MIB, MIB + mib(self.boot_size_mib()) - 1))
        };
        parts.sysboot_nr = Some(sysboot_nr);
        parts.sysboot_span = Some(sysboot_span);

        if self.config.swap_partition_enabled() {
            parts.swap_nr = Some(sysboot_nr + 1);
            parts.swap_span = Some(span_after(sysboot_span.end, self.config.configs.swap_size));
            parts.writable_nr = Some(sysboot_nr + 2);
        } else {
            parts.swap_nr = None;
            parts.swap_span = None;
            parts.writable_nr = Some(sysboot_nr + 1);
        }
        Ok(())
    }

    pub fn boot_size_mib(&self) -> u64 {
        let size = self.config.configs.boot_size;
        if size < MIN_BOOT_SIZE_MIB {
            warn!("bootsize {size} MiB is below {MIN_BOOT_SIZE_MIB} MiB, using {DEFAULT_BOOT_SIZE_MIB} MiB");
            return DEFAULT_BOOT_SIZE_MIB;
        }
        size
    }

    /// Writable starts after the last fixed partition and takes the rest of
    /// the disk minus one MiB, or `rootfssize` for curtin installs.
    pub fn writable_span(&self, parts: &Partitions) -> Result<Span> {
        let start = parts.fixed_end().map(next_start).unwrap_or(MIB);
        let disk_end = parts
            .target_size
            .checked_sub(MIB + 1)
            .ok_or_else(|| anyhow!("size of {} is unknown", parts.target_dev_path))?;
        let rootfs = self.config.configs.rootfs_size;
        let end = if self.os.is_curtin() && rootfs > 0 {
            (start + mib(rootfs as u64) - 1).min(disk_end)
        } else {
            disk_end
        };
        if end <= start {
            bail!(
                "no room left for writable on {} after byte {start}",
                parts.target_dev_path
            );
        }
        Ok(Span::new(start, end))
    }
}
