use std::path::{Path, PathBuf};

use crate::config::RecoveryOs;

/// Well-known locations used during a recovery run.
///
/// Every path hangs off one of a few roots so a run can be redirected
/// into a scratch directory.
#[derive(Debug, Clone)]
pub struct RecoveryPaths {
    /// Mount point of the running recovery partition
    pub recovery_root: PathBuf,
    /// Root of the running recovery system
    pub host_root: PathBuf,
    pub writable_mnt: PathBuf,
    pub sysboot_mnt: PathBuf,
    /// Where a freshly created recovery partition is mounted in headless mode
    pub reco_copy_mnt: PathBuf,
    pub assertion_backup: PathBuf,
    pub backup_snaps: PathBuf,
    pub sys_block: PathBuf,
    pub curtin_config: PathBuf,
    /// Installer media, bind-mounted over the recovery root for curtin
    pub cdrom: PathBuf,
}

impl Default for RecoveryPaths {
    fn default() -> Self {
        Self {
            recovery_root: PathBuf::from("/run/recovery"),
            host_root: PathBuf::from("/"),
            writable_mnt: PathBuf::from("/tmp/writableMnt"),
            sysboot_mnt: PathBuf::from("/tmp/system-boot"),
            reco_copy_mnt: PathBuf::from("/tmp/recoMnt"),
            assertion_backup: PathBuf::from("/tmp/assert_backup"),
            backup_snaps: PathBuf::from("/backup_snaps"),
            sys_block: PathBuf::from("/sys/block"),
            curtin_config: PathBuf::from("/tmp/curtin-recovery-cfg.yaml"),
            cdrom: PathBuf::from("/cdrom"),
        }
    }
}

impl RecoveryPaths {
    /// Same layout with every root moved under `root`.
    pub fn under(root: &Path) -> Self {
        let d = Self::default();
        let rebase = |p: &Path| root.join(p.strip_prefix("/").unwrap_or(p));
        Self {
            recovery_root: rebase(&d.recovery_root),
            host_root: root.join("host"),
            writable_mnt: rebase(&d.writable_mnt),
            sysboot_mnt: rebase(&d.sysboot_mnt),
            reco_copy_mnt: rebase(&d.reco_copy_mnt),
            assertion_backup: rebase(&d.assertion_backup),
            backup_snaps: rebase(&d.backup_snaps),
            sys_block: rebase(&d.sys_block),
            curtin_config: rebase(&d.curtin_config),
            cdrom: rebase(&d.cdrom),
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.recovery_root.join("recovery/config.toml")
    }

    pub fn factory_dir(&self) -> PathBuf {
        self.recovery_root.join("recovery/factory")
    }

    pub fn sysboot_tarball(&self) -> PathBuf {
        self.factory_dir().join("system-boot.tar.xz")
    }

    pub fn writable_tarball(&self) -> PathBuf {
        self.factory_dir().join("writable.tar.xz")
    }

    pub fn rootfs_squashfs(&self) -> PathBuf {
        self.factory_dir().join("rootfs.squashfs")
    }

    pub fn writable_includes(&self) -> PathBuf {
        self.recovery_root.join("recovery/writable-includes.squashfs")
    }

    pub fn snaps_src(&self) -> PathBuf {
        self.factory_dir().join("snaps")
    }

    pub fn devmode_snaps_src(&self) -> PathBuf {
        self.factory_dir().join("snaps-devmode")
    }

    pub fn preinstall_assertions_src(&self) -> PathBuf {
        self.factory_dir().join("assertions-preinstall")
    }

    pub fn recovery_uboot_env(&self) -> PathBuf {
        self.recovery_root.join("uboot.env")
    }

    pub fn system_data(&self) -> PathBuf {
        self.writable_mnt.join("system-data")
    }

    pub fn seed_snaps(&self) -> PathBuf {
        self.system_data().join("var/lib/snapd/seed/snaps")
    }

    pub fn seed_assertions(&self) -> PathBuf {
        self.system_data().join("var/lib/snapd/seed/assertions")
    }

    /// Signed identity material kept across a factory restore.
    pub fn assertions_on_writable(&self) -> PathBuf {
        self.writable_mnt.join("writable/recovery")
    }

    pub fn sysboot_uboot_env(&self) -> PathBuf {
        self.sysboot_mnt.join("uboot.env")
    }

    pub fn firstboot_service_dir(&self) -> PathBuf {
        self.host_root.join("var/lib/devmode-firstboot")
    }

    pub fn systemd_units(&self) -> PathBuf {
        self.host_root.join("etc/systemd/system")
    }

    pub fn persisted_log(&self, os: RecoveryOs) -> PathBuf {
        if os.is_core() {
            self.system_data().join("var/log/recovery/recovery.bin.log")
        } else {
            self.writable_mnt.join("var/log/recovery/recovery.bin.log")
        }
    }

    pub fn writable_fstab(&self) -> PathBuf {
        self.writable_mnt.join("etc/fstab")
    }

    pub fn writable_default_grub(&self) -> PathBuf {
        self.writable_mnt.join("etc/default/grub")
    }

    pub fn writable_grub_custom(&self) -> PathBuf {
        self.writable_mnt.join("etc/grub.d/40_custom")
    }
}
