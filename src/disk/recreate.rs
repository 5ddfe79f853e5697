use anyhow::{Context, Result, anyhow, bail};
use std::path::Path;

use super::devpath::partition_path;
use super::layout::{LayoutPlanner, span_after};
use super::parted::{Parted, PartedTable};
use super::types::{Partitions, Span};
use super::{SWAP_LABEL, SYSBOOT_LABEL, WRITABLE_LABEL};
use crate::boot::grub::find_efi_dir;
use crate::config::{Bootloader, RecoveryConfig, RecoveryOs};
use crate::error::RecoveryError;
use crate::file;
use crate::host::{DeviceWait, Host, MountGuard};
use crate::paths::RecoveryPaths;

/// Rebuilds the partitions behind recovery and lays the factory images
/// down on them.
pub struct Recreator<'a> {
    host: &'a dyn Host,
    config: &'a RecoveryConfig,
    paths: &'a RecoveryPaths,
    wait: DeviceWait,
}

impl<'a> Recreator<'a> {
    pub fn new(host: &'a dyn Host, config: &'a RecoveryConfig, paths: &'a RecoveryPaths) -> Self {
        Self {
            host,
            config,
            paths,
            wait: DeviceWait::default(),
        }
    }

    pub fn with_device_wait(mut self, wait: DeviceWait) -> Self {
        self.wait = wait;
        self
    }

    pub fn restore_parts(&self, parts: &mut Partitions, os: RecoveryOs) -> Result<()> {
        let planner = LayoutPlanner::new(self.config, os);
        // planning fails before anything on disk is touched
        planner.plan(parts)?;

        let parted = Parted::new(self.host, &parts.target_dev_path);
        let bootloader = self.config.configs.bootloader;

        if parts.same_disk() {
            if self.config.is_gpt() {
                self.host.run(
                    "sgdisk",
                    &[
                        parted.device(),
                        "--randomize-guids",
                        "--move-second-header",
                    ],
                )?;
            }
            let table = parted.print()?;
            self.remove_trailing(&parted, &table, parts, bootloader)?;
        } else {
            parted.mklabel_gpt()?;
            let table = parted.print()?;
            parts.target_size = table.disk_size;
        }

        match bootloader {
            Bootloader::Grub => self.create_sysboot(&parted, parts)?,
            Bootloader::UBoot => self.reformat_sysboot(&parted, parts)?,
        }

        if parts.swap_nr.is_some() {
            self.create_swap(&parted, parts)?;
        }

        self.create_writable(&parted, parts, &planner)?;
        self.populate_writable(parts, os)?;
        Ok(())
    }

    fn remove_trailing(
        &self,
        parted: &Parted<'_>,
        table: &PartedTable,
        parts: &Partitions,
        bootloader: Bootloader,
    ) -> Result<()> {
        let mut doomed: Vec<u32> = table
            .entries
            .iter()
            .map(|e| e.nr)
            .filter(|nr| *nr > parts.recovery_nr)
            .filter(|nr| !(bootloader == Bootloader::UBoot && Some(*nr) == parts.sysboot_nr))
            .collect();
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for nr in doomed {
            parted.rm(nr)?;
        }
        Ok(())
    }

    /// msdos partitions past the fourth live in the extended partition.
    fn part_kind(&self, parts: &Partitions) -> &'static str {
        if !self.config.is_gpt() && parts.same_disk() && parts.recovery_nr > 4 {
            "logical"
        } else {
            "primary"
        }
    }

    fn create_sysboot(&self, parted: &Parted<'_>, parts: &mut Partitions) -> Result<()> {
        let (Some(nr), Some(span)) = (parts.sysboot_nr, parts.sysboot_span) else {
            bail!("system-boot was not planned");
        };
        parted.mkpart(self.part_kind(parts), "fat32", span)?;
        if self.config.is_gpt() {
            parted.name(nr, SYSBOOT_LABEL)?;
        }
        let path = partition_path(&parts.target_dev_path, nr);
        self.settle(parted, &path)?;
        parts.sysboot_span = Some(self.created_span(parted, nr)?);
        self.format_and_fill_sysboot(&path)?;
        parted.set_flag(nr, "boot")
    }

    fn reformat_sysboot(&self, parted: &Parted<'_>, parts: &mut Partitions) -> Result<()> {
        let nr = parts
            .sysboot_nr
            .ok_or(RecoveryError::LostSystemBoot)?;
        let path = partition_path(&parts.target_dev_path, nr);
        self.format_and_fill_sysboot(&path)?;
        parted.set_flag(nr, "boot")
    }

    fn format_and_fill_sysboot(&self, path: &str) -> Result<()> {
        self.host
            .run("mkfs.vfat", &["-F", "32", "-n", SYSBOOT_LABEL, path])?;
        let tarball = self.paths.sysboot_tarball();
        if !tarball.exists() {
            info!("{} not found, leaving system-boot empty", tarball.display());
            return Ok(());
        }
        let mnt = MountGuard::mount(self.host, path, &self.paths.sysboot_mnt, "vfat")?;
        file::extract_tar_xz_via_scratch(self.host, &tarball, mnt.path())?;
        mnt.unmount()
    }

    fn create_swap(&self, parted: &Parted<'_>, parts: &mut Partitions) -> Result<()> {
        let (Some(nr), Some(boot)) = (parts.swap_nr, parts.sysboot_span) else {
            bail!("swap was not planned");
        };
        let span = span_after(boot.end, self.config.configs.swap_size);
        parted.mkpart(self.part_kind(parts), "linux-swap", span)?;
        if self.config.is_gpt() {
            parted.name(nr, SWAP_LABEL)?;
        }
        let path = partition_path(&parts.target_dev_path, nr);
        self.settle(parted, &path)?;
        parts.swap_span = Some(self.created_span(parted, nr)?);
        self.host.run("mkswap", &["-L", SWAP_LABEL, &path])
    }

    fn create_writable(
        &self,
        parted: &Parted<'_>,
        parts: &mut Partitions,
        planner: &LayoutPlanner<'_>,
    ) -> Result<()> {
        let nr = parts
            .writable_nr
            .ok_or_else(|| anyhow!("writable was not planned"))?;
        // offsets follow what parted actually created, not the plan
        let span = planner.writable_span(parts)?;
        parted.mkpart(self.part_kind(parts), "ext4", span)?;
        if self.config.is_gpt() {
            parted.name(nr, WRITABLE_LABEL)?;
        }
        let path = partition_path(&parts.target_dev_path, nr);
        self.settle(parted, &path)?;
        parts.writable_span = Some(self.created_span(parted, nr)?);
        self.host
            .run("mkfs.ext4", &["-F", "-L", WRITABLE_LABEL, &path])
    }

    fn populate_writable(&self, parts: &Partitions, os: RecoveryOs) -> Result<()> {
        if os.is_curtin() {
            let cfg = self
                .config
                .configs
                .curtin_config
                .clone()
                .unwrap_or_else(|| self.paths.curtin_config.clone());
            info!("handing writable over to curtin with {}", cfg.display());
            return self.host.run(
                "curtin",
                &["--showtrace", "-c", &cfg.to_string_lossy(), "install"],
            );
        }

        let path = parts
            .writable_path()
            .ok_or_else(|| anyhow!("writable was not planned"))?;
        let tarball = self.paths.writable_tarball();
        let squashfs = self.paths.rootfs_squashfs();
        let mnt = MountGuard::mount(self.host, &path, &self.paths.writable_mnt, "ext4")?;
        if tarball.exists() {
            file::extract_tar_xz(self.host, &tarball, mnt.path())?;
        } else if squashfs.exists() {
            file::unsquash(self.host, &squashfs, mnt.path())?;
        } else {
            bail!(
                "neither {} nor {} found",
                tarball.display(),
                squashfs.display()
            );
        }
        mnt.unmount()
    }

    /// Wait for the kernel and udev to publish a freshly created partition.
    fn settle(&self, parted: &Parted<'_>, part_path: &str) -> Result<()> {
        self.host.run("udevadm", &["settle"])?;
        self.host.run("partprobe", &[parted.device()])?;
        self.wait.wait(self.host, Path::new(part_path))
    }

    fn created_span(&self, parted: &Parted<'_>, nr: u32) -> Result<Span> {
        let table = parted.print()?;
        table
            .get(nr)
            .map(|e| e.span)
            .ok_or_else(|| anyhow!("partition {nr} missing from {} after mkpart", parted.device()))
    }

    /// Headless install: clone the running recovery partition onto the
    /// target disk as partition 1 and mark it for a factory install.
    pub fn copy_recovery_part(&self, parts: &mut Partitions) -> Result<()> {
        if parts.same_disk() {
            bail!(
                "cannot copy recovery onto its own disk {}",
                parts.source_dev_path
            );
        }
        let label = self.config.label();
        let end = (4 + self.config.recovery.recovery_size).to_string();
        let parted = Parted::new(self.host, &parts.target_dev_path);
        info!(
            "copying recovery to {} ({} MiB)",
            parts.target_dev_path, self.config.recovery.recovery_size
        );
        self.host.run(
            "parted",
            &[
                "-ms", "-a", "optimal", parted.device(), "unit", "MiB", "mklabel", "gpt",
                "mkpart", "primary", "fat32", "4", &end, "name", "1", label, "set", "1", "boot",
                "on", "print",
            ],
        )?;
        parts.recovery_nr = 1;
        parts.last_part_nr = Some(1);

        let path = partition_path(&parts.target_dev_path, 1);
        self.settle(&parted, &path)?;
        self.host
            .run("mkfs.vfat", &["-F", "32", "-n", label, &path])?;

        let mnt = MountGuard::mount(self.host, &path, &self.paths.reco_copy_mnt, "vfat")?;
        file::copy_tree(&self.paths.recovery_root, mnt.path())
            .context("copying recovery tree")?;
        self.host.run("sync", &[])?;

        match find_efi_dir(mnt.path()) {
            Ok(efi) => {
                let grubenv = mnt.path().join(efi).join("ubuntu/grubenv");
                self.host.run(
                    "grub-editenv",
                    &[
                        &grubenv.to_string_lossy(),
                        "set",
                        "recovery_type=factory_install",
                    ],
                )?;
            }
            Err(e) => warn!("{e:#}, copied recovery keeps its grubenv"),
        }
        mnt.unmount()
    }
}
