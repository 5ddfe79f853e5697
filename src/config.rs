use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::ValueEnum;

use crate::error::RecoveryError;

pub const DEFAULT_BOOT_SIZE_MIB: u64 = 64;
pub const MIN_BOOT_SIZE_MIB: u64 = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Bootloader {
    #[serde(rename = "u-boot")]
    UBoot,
    #[serde(rename = "grub")]
    Grub,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionTable {
    Mbr,
    Gpt,
}

/// What this run was started for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecoveryType {
    #[value(name = "factory_install")]
    FactoryInstall,
    #[value(name = "factory_restore")]
    FactoryRestore,
    #[value(name = "headless_installer")]
    HeadlessInstaller,
}

impl RecoveryType {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryType::FactoryInstall => "factory_install",
            RecoveryType::FactoryRestore => "factory_restore",
            RecoveryType::HeadlessInstaller => "headless_installer",
        }
    }
}

impl fmt::Display for RecoveryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Flavor of the operating system laid down on writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum RecoveryOs {
    #[value(name = "ubuntu_core")]
    UbuntuCore,
    #[value(name = "ubuntu_classic")]
    UbuntuClassic,
    #[value(name = "ubuntu_classic_curtin")]
    UbuntuClassicCurtin,
}

impl RecoveryOs {
    pub fn as_str(self) -> &'static str {
        match self {
            RecoveryOs::UbuntuCore => "ubuntu_core",
            RecoveryOs::UbuntuClassic => "ubuntu_classic",
            RecoveryOs::UbuntuClassicCurtin => "ubuntu_classic_curtin",
        }
    }

    pub fn is_core(self) -> bool {
        self == RecoveryOs::UbuntuCore
    }

    pub fn is_curtin(self) -> bool {
        self == RecoveryOs::UbuntuClassicCurtin
    }
}

impl fmt::Display for RecoveryOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// System layout settings, the `[configs]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SystemConfig {
    #[serde(default = "default_arch")]
    pub arch: String,
    pub bootloader: Bootloader,
    pub partition_type: PartitionTable,
    #[serde(default)]
    pub swap: bool,
    #[serde(default)]
    pub swapfile: bool,
    /// Swap size in MiB
    #[serde(default, rename = "swapsize")]
    pub swap_size: u64,
    /// system-boot size in MiB
    #[serde(default = "default_boot_size", rename = "bootsize")]
    pub boot_size: u64,
    /// writable size in MiB for the curtin layout, non-positive means rest of disk
    #[serde(default = "default_rootfs_size", rename = "rootfssize")]
    pub rootfs_size: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub curtin_config: Option<PathBuf>,
}

/// Recovery partition settings, the `[recovery]` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RecoverySettings {
    #[serde(default = "default_label")]
    pub filesystem_label: String,
    /// Recovery partition size in MiB, used when cloning it to another disk
    #[serde(default = "default_recovery_size", rename = "recoverysize")]
    pub recovery_size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recovery_device: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_device: Option<String>,
    #[serde(default = "default_confirm_timeout", with = "humantime_serde")]
    pub restore_confirm_timeout: Duration,
    /// Skip appending the recovery menu entry when grub.cfg already has one
    #[serde(default)]
    pub grub_menu_dedup: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryConfig {
    pub configs: SystemConfig,
    pub recovery: RecoverySettings,
}

fn default_arch() -> String {
    "amd64".to_string()
}

fn default_boot_size() -> u64 {
    DEFAULT_BOOT_SIZE_MIB
}

fn default_rootfs_size() -> i64 {
    -1
}

fn default_label() -> String {
    "recovery".to_string()
}

fn default_recovery_size() -> u64 {
    768
}

fn default_confirm_timeout() -> Duration {
    Duration::from_secs(300)
}

impl RecoveryConfig {
    pub fn new(bootloader: Bootloader, partition_type: PartitionTable) -> Self {
        Self {
            configs: SystemConfig {
                arch: default_arch(),
                bootloader,
                partition_type,
                swap: false,
                swapfile: false,
                swap_size: 0,
                boot_size: default_boot_size(),
                rootfs_size: default_rootfs_size(),
                curtin_config: None,
            },
            recovery: RecoverySettings {
                filesystem_label: default_label(),
                recovery_size: default_recovery_size(),
                recovery_device: None,
                system_device: None,
                restore_confirm_timeout: default_confirm_timeout(),
                grub_menu_dedup: false,
            },
        }
    }

    pub fn with_swap_partition(mut self, size_mib: u64) -> Self {
        self.configs.swap = true;
        self.configs.swapfile = false;
        self.configs.swap_size = size_mib;
        self
    }

    pub fn with_boot_size(mut self, size_mib: u64) -> Self {
        self.configs.boot_size = size_mib;
        self
    }

    pub fn with_label(mut self, label: &str) -> Self {
        self.recovery.filesystem_label = label.to_string();
        self
    }

    pub fn with_recovery_device(mut self, device: &str) -> Self {
        self.recovery.recovery_device = Some(device.to_string());
        self
    }

    pub fn load_from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)
            .map_err(|e| RecoveryError::config(format!("read {}: {e}", path.display())))?;
        let config = Self::from_toml_str(&content)
            .with_context(|| format!("invalid config {}", path.display()))?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, RecoveryError> {
        let config: RecoveryConfig =
            toml::from_str(content).map_err(|e| RecoveryError::config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects combinations the fixed partition layouts cannot express.
    pub fn validate(&self) -> Result<(), RecoveryError> {
        if self.recovery.filesystem_label.trim().is_empty() {
            return Err(RecoveryError::config("recovery filesystem-label is empty"));
        }
        if self.configs.bootloader == Bootloader::UBoot && self.swap_partition_enabled() {
            return Err(RecoveryError::config(
                "swap partition is not supported with u-boot, use swapfile",
            ));
        }
        Ok(())
    }

    pub fn swap_partition_enabled(&self) -> bool {
        self.configs.swap && !self.configs.swapfile && self.configs.swap_size > 0
    }

    pub fn is_gpt(&self) -> bool {
        self.configs.partition_type == PartitionTable::Gpt
    }

    pub fn label(&self) -> &str {
        &self.recovery.filesystem_label
    }
}
