use anyhow::{Context, Result, anyhow};
use std::fs;

use super::devpath::{self, split_partition_path};
use super::parted::Parted;
use super::types::Partitions;
use super::{SWAP_LABEL, SYSBOOT_LABEL, WRITABLE_LABEL};
use crate::config::{RecoveryConfig, RecoveryType};
use crate::error::RecoveryError;
use crate::host::Host;
use crate::paths::RecoveryPaths;

/// A labelled partition resolved to its disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Located {
    pub dev_node: String,
    pub dev_path: String,
    pub nr: u32,
}

/// Resolve a filesystem label with `findfs`.
pub fn find_part(host: &dyn Host, label: &str) -> Result<Located> {
    let not_found = || RecoveryError::Discovery {
        label: label.to_string(),
    };
    let out = host.execute("findfs", &[&format!("LABEL={label}")])?;
    let path = out.stdout.trim();
    if out.code != 0 || !path.starts_with("/dev/") {
        return Err(not_found().into());
    }
    let dev = split_partition_path(path).with_context(not_found)?;
    debug!("label {label} is partition {} of {}", dev.nr, dev.disk_path);
    Ok(Located {
        dev_node: dev.disk_node,
        dev_path: dev.disk_path,
        nr: dev.nr,
    })
}

pub struct Locator<'a> {
    host: &'a dyn Host,
    config: &'a RecoveryConfig,
    paths: &'a RecoveryPaths,
}

impl<'a> Locator<'a> {
    pub fn new(host: &'a dyn Host, config: &'a RecoveryConfig, paths: &'a RecoveryPaths) -> Self {
        Self {
            host,
            config,
            paths,
        }
    }

    /// Discover where recovery lives, which disk to install to and what is
    /// already on that disk.
    pub fn get_partitions(&self, recovery_type: RecoveryType) -> Result<Partitions> {
        let label = self.config.label();
        let recovery = find_part(self.host, label)?;
        let (target_node, target_path) = self.find_target_disk(&recovery, recovery_type)?;

        let mut parts = Partitions {
            source_dev_node: recovery.dev_node.clone(),
            source_dev_path: recovery.dev_path.clone(),
            target_dev_node: target_node,
            target_dev_path: target_path,
            recovery_nr: recovery.nr,
            ..Default::default()
        };

        parts.sysboot_nr = self.on_target(&parts, SYSBOOT_LABEL);
        parts.swap_nr = self.on_target(&parts, SWAP_LABEL);
        parts.writable_nr = self.on_target(&parts, WRITABLE_LABEL);

        let parted = Parted::new(self.host, &parts.target_dev_path);
        let table = match parted.print() {
            Ok(table) => table,
            Err(e) if !parts.same_disk() => {
                warn!("{} has no readable partition table: {e:#}", parts.target_dev_path);
                return Ok(parts);
            }
            Err(e) => return Err(e),
        };

        parts.target_size = table.disk_size;
        parts.last_part_nr = table.last_nr();
        for entry in &table.entries {
            if parts.same_disk() && entry.nr == parts.recovery_nr {
                parts.recovery_span = Some(entry.span);
            }
            if Some(entry.nr) == parts.sysboot_nr {
                parts.sysboot_span = Some(entry.span);
            }
            if Some(entry.nr) == parts.swap_nr {
                parts.swap_span = Some(entry.span);
            }
            if Some(entry.nr) == parts.writable_nr {
                parts.writable_span = Some(entry.span);
            }
        }

        info!(
            "recovery {}, target {} ({} bytes), system-boot {:?}, swap {:?}, writable {:?}, last {:?}",
            parts.recovery_path(),
            parts.target_dev_path,
            parts.target_size,
            parts.sysboot_nr,
            parts.swap_nr,
            parts.writable_nr,
            parts.last_part_nr
        );
        Ok(parts)
    }

    /// Labels found on another disk than the target are ignored.
    fn on_target(&self, parts: &Partitions, label: &str) -> Option<u32> {
        match find_part(self.host, label) {
            Ok(found) if found.dev_path == parts.target_dev_path => Some(found.nr),
            Ok(found) => {
                debug!("ignoring {label} on {}", found.dev_path);
                None
            }
            Err(_) => None,
        }
    }

    pub fn find_target_disk(
        &self,
        recovery: &Located,
        recovery_type: RecoveryType,
    ) -> Result<(String, String)> {
        let chosen = if recovery_type == RecoveryType::HeadlessInstaller {
            match &self.config.recovery.recovery_device {
                Some(device) => devpath::disk_path(device),
                None => self.scan_other_disk(&recovery.dev_node)?,
            }
        } else {
            match &self.config.recovery.system_device {
                Some(device) => devpath::disk_path(device),
                None => recovery.dev_path.clone(),
            }
        };
        info!("target disk is {chosen}");
        Ok((devpath::disk_node(&chosen), chosen))
    }

    /// First eMMC, then SCSI disk in `/sys/block` that is not `source`.
    fn scan_other_disk(&self, source: &str) -> Result<String> {
        let dir = &self.paths.sys_block;
        let mut names: Vec<String> = fs::read_dir(dir)
            .with_context(|| format!("listing {}", dir.display()))?
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();

        let candidate = |prefix: &str| {
            names.iter().find(|name| {
                name.starts_with(prefix)
                    && name.as_str() != source
                    && !name.contains("boot")
                    && !name.contains("rpmb")
            })
        };
        candidate("mmcblk")
            .or_else(|| candidate("sd"))
            .map(|name| format!("/dev/{name}"))
            .ok_or_else(|| anyhow!("no target disk other than {source} found"))
    }
}
