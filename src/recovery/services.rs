use anyhow::{Context, Result, anyhow};
use std::path::PathBuf;

use super::data;
use crate::boot::efi::BootEntryReconciler;
use crate::boot::grub::{self, GrubMenuEntry, find_efi_dir};
use crate::boot::uboot;
use crate::config::{RecoveryConfig, RecoveryOs, RecoveryType};
use crate::disk::{Locator, Partitions, Recreator};
use crate::host::{DeviceWait, Host, MountGuard};
use crate::paths::RecoveryPaths;

/// ESP mount point under `/boot` in the classic system.
const CLASSIC_EFI_DIR: &str = "efi";

/// Installer media over the recovery root, curtin flavor only. Has to
/// happen before the config is read from there.
pub fn bind_installer_media<'a>(host: &'a dyn Host, paths: &RecoveryPaths) -> Result<MountGuard<'a>> {
    info!(
        "bind mount {} to {}",
        paths.cdrom.display(),
        paths.recovery_root.display()
    );
    MountGuard::bind(host, &paths.cdrom, &paths.recovery_root)
}

/// Everything that reads or rewrites the disks and what is on them.
pub trait PartitionService {
    fn get_partitions(&self, recovery_type: RecoveryType) -> Result<Partitions>;

    fn restore_parts(&self, parts: &mut Partitions, os: RecoveryOs) -> Result<()>;

    fn copy_recovery_part(&self, parts: &mut Partitions) -> Result<()>;

    fn mount_writable(&self, parts: &Partitions) -> Result<MountGuard<'_>>;

    fn mount_sysboot(&self, parts: &Partitions) -> Result<MountGuard<'_>>;

    fn persisted_log(&self, os: RecoveryOs) -> PathBuf;

    /// Mounts the old writable itself; a missing partition is not an error.
    fn backup_assertions(&self, parts: &Partitions) -> Result<()>;

    fn restore_assertions(&self) -> Result<()>;

    fn seed_system(&self, recovery_type: RecoveryType, label: &str) -> Result<()>;
}

/// Bootloader and firmware configuration.
pub trait BootService {
    fn restore_boot_entries(
        &self,
        parts: &Partitions,
        recovery_type: RecoveryType,
        os: RecoveryOs,
    ) -> Result<()>;

    fn update_boot_entries(&self, parts: &Partitions, os: RecoveryOs) -> Result<()>;

    fn update_uboot(&self, parts: &Partitions, recovery_type: RecoveryType, label: &str)
    -> Result<()>;

    fn update_grub(&self, os: RecoveryOs, label: &str) -> Result<()>;

    fn update_fstab(&self, parts: &Partitions) -> Result<()>;

    fn grub_install(&self, parts: &Partitions, os: RecoveryOs) -> Result<()>;
}

/// Both services backed by a [`Host`].
pub struct SystemServices<'a> {
    host: &'a dyn Host,
    config: &'a RecoveryConfig,
    paths: &'a RecoveryPaths,
    wait: DeviceWait,
}

impl<'a> SystemServices<'a> {
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

    fn recreator(&self) -> Recreator<'_> {
        Recreator::new(self.host, self.config, self.paths).with_device_wait(self.wait.clone())
    }

    /// Run `edit` with the recovery root writable, put it back read-only
    /// whatever the outcome.
    fn with_recovery_rw<T>(&self, edit: impl FnOnce() -> Result<T>) -> Result<T> {
        let root = &self.paths.recovery_root;
        self.host.remount(root, false)?;
        let result = edit();
        if let Err(e) = self.host.remount(root, true) {
            warn!("{} stays read-write: {e:#}", root.display());
        }
        result
    }
}

impl PartitionService for SystemServices<'_> {
    fn get_partitions(&self, recovery_type: RecoveryType) -> Result<Partitions> {
        Locator::new(self.host, self.config, self.paths).get_partitions(recovery_type)
    }

    fn restore_parts(&self, parts: &mut Partitions, os: RecoveryOs) -> Result<()> {
        self.recreator().restore_parts(parts, os)
    }

    fn copy_recovery_part(&self, parts: &mut Partitions) -> Result<()> {
        self.recreator().copy_recovery_part(parts)
    }

    fn mount_writable(&self, parts: &Partitions) -> Result<MountGuard<'_>> {
        let dev = parts
            .writable_path()
            .ok_or_else(|| anyhow!("writable partition unknown"))?;
        MountGuard::mount(self.host, &dev, &self.paths.writable_mnt, "ext4")
    }

    fn mount_sysboot(&self, parts: &Partitions) -> Result<MountGuard<'_>> {
        let dev = parts
            .sysboot_path()
            .ok_or_else(|| anyhow!("system-boot partition unknown"))?;
        MountGuard::mount(self.host, &dev, &self.paths.sysboot_mnt, "vfat")
    }

    fn persisted_log(&self, os: RecoveryOs) -> PathBuf {
        self.paths.persisted_log(os)
    }

    fn backup_assertions(&self, parts: &Partitions) -> Result<()> {
        let Some(dev) = parts.writable_path() else {
            info!("no writable partition, no assertions to back up");
            return Ok(());
        };
        let mnt = match MountGuard::mount(self.host, &dev, &self.paths.writable_mnt, "ext4") {
            Ok(mnt) => mnt,
            Err(e) => {
                warn!("cannot mount old writable {dev}: {e:#}");
                return Ok(());
            }
        };
        data::backup_assertions(self.paths)?;
        mnt.unmount()
    }

    fn restore_assertions(&self) -> Result<()> {
        data::restore_assertions(self.paths).map(|_| ())
    }

    fn seed_system(&self, recovery_type: RecoveryType, label: &str) -> Result<()> {
        data::copy_snaps_asserts(self.paths).context("copying snaps and assertions")?;
        data::add_firstboot_service(self.host, self.paths, recovery_type, label)
            .context("adding first-boot service")
    }
}

impl BootService for SystemServices<'_> {
    fn restore_boot_entries(
        &self,
        parts: &Partitions,
        recovery_type: RecoveryType,
        os: RecoveryOs,
    ) -> Result<()> {
        BootEntryReconciler::new(self.host).restore_boot_entries(parts, recovery_type, os)
    }

    fn update_boot_entries(&self, parts: &Partitions, os: RecoveryOs) -> Result<()> {
        BootEntryReconciler::new(self.host).update_boot_entries(parts, os)
    }

    fn update_uboot(
        &self,
        parts: &Partitions,
        recovery_type: RecoveryType,
        label: &str,
    ) -> Result<()> {
        uboot::update_uboot_env(&self.paths.sysboot_uboot_env(), &self.paths.backup_snaps, label)?;

        let reco_env = self.paths.recovery_uboot_env();
        if recovery_type == RecoveryType::FactoryInstall && reco_env.is_file() {
            self.with_recovery_rw(|| uboot::set_boot_partition_keys(&reco_env, parts))?;
        }
        Ok(())
    }

    fn update_grub(&self, os: RecoveryOs, label: &str) -> Result<()> {
        let reco_efi = find_efi_dir(&self.paths.recovery_root)?;
        let grubenv = self
            .paths
            .recovery_root
            .join(reco_efi)
            .join("ubuntu/grubenv");
        let grub_cfg = if os.is_core() {
            let sys_efi = find_efi_dir(&self.paths.sysboot_mnt)?;
            self.paths.sysboot_mnt.join(sys_efi).join("ubuntu/grub.cfg")
        } else {
            self.paths.writable_grub_custom()
        };
        let entry = GrubMenuEntry::factory_restore(label, reco_efi, os);
        let dedup = self.config.recovery.grub_menu_dedup;
        self.with_recovery_rw(|| grub::update_grub_cfg(self.host, &grub_cfg, &grubenv, &entry, dedup))
    }

    fn update_fstab(&self, parts: &Partitions) -> Result<()> {
        grub::update_fstab(self.host, parts, &self.paths.writable_fstab(), CLASSIC_EFI_DIR)
    }

    fn grub_install(&self, parts: &Partitions, os: RecoveryOs) -> Result<()> {
        BootEntryReconciler::new(self.host).ensure_recovery_entry(parts, os)?;

        let configs = &self.config.configs;
        let resume = match (configs.swap, configs.swapfile) {
            (true, true) => parts.writable_path(),
            (true, false) => parts.swap_path(),
            _ => None,
        };
        grub::grub_install(
            self.host,
            &self.paths.writable_mnt,
            &self.paths.sysboot_mnt,
            CLASSIC_EFI_DIR,
            resume.as_deref(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Bootloader, PartitionTable};
    use crate::host::fake::FakeHost;
    use std::fs;
    use tempfile::TempDir;

    fn parts() -> Partitions {
        Partitions {
            source_dev_node: "sda".into(),
            source_dev_path: "/dev/sda".into(),
            target_dev_node: "sda".into(),
            target_dev_path: "/dev/sda".into(),
            recovery_nr: 1,
            sysboot_nr: Some(2),
            swap_nr: Some(3),
            writable_nr: Some(4),
            ..Default::default()
        }
    }

    #[test]
    fn grub_edit_is_wrapped_in_remounts() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RecoveryPaths::under(temp.path());
        fs::create_dir_all(paths.recovery_root.join("EFI/ubuntu")).expect("mkdir");
        let cfg_dir = paths.sysboot_mnt.join("EFI/ubuntu");
        fs::create_dir_all(&cfg_dir).expect("mkdir");
        fs::write(cfg_dir.join("grub.cfg"), "set cmdline=\"quiet\"\n").expect("write");
        let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
        let host = FakeHost::new();

        SystemServices::new(&host, &config, &paths)
            .update_grub(RecoveryOs::UbuntuCore, "recovery")
            .expect("update grub");

        let root = paths.recovery_root.display().to_string();
        let calls = host.calls();
        assert_eq!(calls.first(), Some(&format!("remount {root} rw")));
        assert_eq!(calls.last(), Some(&format!("remount {root} ro")));
        assert!(calls[1].starts_with("grub-editenv "));
        let cfg = fs::read_to_string(cfg_dir.join("grub.cfg")).expect("read");
        assert!(cfg.contains("$cloud_init_disabled"));
        assert!(cfg.contains("load_env -f (${root})/EFI/ubuntu/grubenv"));
    }

    #[test]
    fn failed_grub_edit_still_remounts_ro() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RecoveryPaths::under(temp.path());
        fs::create_dir_all(paths.recovery_root.join("efi")).expect("mkdir");
        let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
        let host = FakeHost::new();

        // classic 40_custom does not exist
        assert!(
            SystemServices::new(&host, &config, &paths)
                .update_grub(RecoveryOs::UbuntuClassic, "recovery")
                .is_err()
        );
        let root = paths.recovery_root.display().to_string();
        assert_eq!(host.calls().last(), Some(&format!("remount {root} ro")));
    }

    #[test]
    fn resume_device_follows_swap_kind() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RecoveryPaths::under(temp.path());
        fs::create_dir_all(&paths.sysboot_mnt).expect("mkdir");
        let default_grub = paths.writable_default_grub();
        fs::create_dir_all(default_grub.parent().expect("parent")).expect("mkdir");
        fs::write(&default_grub, "GRUB_CMDLINE_LINUX_DEFAULT=\"quiet splash\"\n").expect("write");
        let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt).with_swap_partition(512);
        let host = FakeHost::new();
        host.respond("efibootmgr -v", "Boot0000* factory_restore\tHD(1)\nBoot0001* ubuntu\tHD(2)\n");

        SystemServices::new(&host, &config, &paths)
            .grub_install(&parts(), RecoveryOs::UbuntuClassic)
            .expect("grub install");

        let content = fs::read_to_string(&default_grub).expect("read");
        assert!(content.contains("quiet splash resume=/dev/sda3"));
        assert!(host.commands_of("efibootmgr").iter().all(|c| !c.contains(" -c ")));
    }

    #[test]
    fn missing_old_writable_skips_backup() {
        let temp = TempDir::new().expect("temp dir");
        let paths = RecoveryPaths::under(temp.path());
        let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
        let host = FakeHost::new();
        let mut p = parts();
        p.writable_nr = None;

        SystemServices::new(&host, &config, &paths)
            .backup_assertions(&p)
            .expect("backup");
        assert!(host.calls().is_empty());
    }
}
