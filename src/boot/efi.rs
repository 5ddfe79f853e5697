use anyhow::{Result, anyhow};
use regex::Regex;
use std::sync::LazyLock;

use crate::config::{RecoveryOs, RecoveryType};
use crate::disk::Partitions;
use crate::error::RecoveryError;
use crate::host::Host;

pub const LOADER: &str = r"\EFI\BOOT\BOOTX64.EFI";
pub const RECOVERY_ENTRY: &str = "factory_restore";
pub const CORE_ENTRY: &str = "ubuntu_core";
pub const CLASSIC_ENTRY: &str = "ubuntu";

static BOOT_LINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^Boot([0-9A-Fa-f]{4})\*?\s+(.*)$").ok());

pub fn os_entry_label(os: RecoveryOs) -> &'static str {
    if os.is_core() { CORE_ENTRY } else { CLASSIC_ENTRY }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootEntry {
    pub id: u16,
    pub label: String,
}

impl BootEntry {
    pub fn hex_id(&self) -> String {
        format!("{:04X}", self.id)
    }
}

/// Entries from `efibootmgr -v`. The label ends where the device path starts.
pub fn parse_entries(listing: &str) -> Vec<BootEntry> {
    let Some(re) = BOOT_LINE.as_ref() else {
        return Vec::new();
    };
    listing
        .lines()
        .filter_map(|line| {
            let caps = re.captures(line.trim_end())?;
            let id = u16::from_str_radix(&caps[1], 16).ok()?;
            let rest = &caps[2];
            let label = rest
                .split('\t')
                .next()
                .map(strip_device_path)
                .unwrap_or_default()
                .trim()
                .to_string();
            Some(BootEntry { id, label })
        })
        .collect()
}

fn strip_device_path(text: &str) -> &str {
    ["  ", " HD(", " PciRoot(", " VenHw(", " BBS("]
        .iter()
        .filter_map(|marker| text.find(marker))
        .min()
        .map_or(text, |pos| &text[..pos])
}

/// Keeps the firmware's boot entries for recovery and the installed OS
/// in step with the disk.
pub struct BootEntryReconciler<'a> {
    host: &'a dyn Host,
}

impl<'a> BootEntryReconciler<'a> {
    pub fn new(host: &'a dyn Host) -> Self {
        Self { host }
    }

    pub fn entries(&self) -> Result<Vec<BootEntry>> {
        let out = self.host.capture("efibootmgr", &["-v"])?;
        Ok(parse_entries(&out))
    }

    /// On a factory restore, make sure one entry for recovery and one for the
    /// OS exist. When either is missing all of them are recreated and
    /// [`RecoveryError::BootEntriesRepaired`] is returned.
    pub fn restore_boot_entries(
        &self,
        parts: &Partitions,
        recovery_type: RecoveryType,
        os: RecoveryOs,
    ) -> Result<()> {
        if recovery_type != RecoveryType::FactoryRestore {
            return Ok(());
        }
        let os_label = os_entry_label(os);
        let entries = self.entries()?;
        let recovery = count(&entries, RECOVERY_ENTRY);
        let system = count(&entries, os_label);
        if recovery >= 1 && system >= 1 {
            info!("boot entries present: {RECOVERY_ENTRY} x{recovery}, {os_label} x{system}");
            return Ok(());
        }

        warn!("boot entries broken: {RECOVERY_ENTRY} x{recovery}, {os_label} x{system}, recreating");
        self.delete_matching(&entries, &[RECOVERY_ENTRY, os_label])?;
        self.create_recovery_entry(parts)?;
        self.create_os_entry(parts, os_label)?;
        Err(RecoveryError::BootEntriesRepaired.into())
    }

    /// Unconditionally replace both entries.
    pub fn update_boot_entries(&self, parts: &Partitions, os: RecoveryOs) -> Result<()> {
        let os_label = os_entry_label(os);
        let entries = self.entries()?;
        self.delete_matching(&entries, &[RECOVERY_ENTRY, os_label])?;
        self.create_recovery_entry(parts)?;
        self.create_os_entry(parts, os_label)
    }

    /// grub-install registers the OS entry itself, only recovery is ours.
    pub fn ensure_recovery_entry(&self, parts: &Partitions, os: RecoveryOs) -> Result<()> {
        let os_label = os_entry_label(os);
        let entries = self.entries()?;
        if count(&entries, RECOVERY_ENTRY) >= 1 && count(&entries, os_label) >= 1 {
            return Ok(());
        }
        self.delete_matching(&entries, &[RECOVERY_ENTRY, os_label])?;
        self.create_recovery_entry(parts)
    }

    fn delete_matching(&self, entries: &[BootEntry], labels: &[&str]) -> Result<()> {
        for entry in entries.iter().filter(|e| labels.contains(&e.label.as_str())) {
            info!("deleting boot entry Boot{} {}", entry.hex_id(), entry.label);
            self.host
                .run("efibootmgr", &["-b", &entry.hex_id(), "-B"])?;
        }
        Ok(())
    }

    fn create_recovery_entry(&self, parts: &Partitions) -> Result<()> {
        self.create(&parts.source_dev_path, parts.recovery_nr, RECOVERY_ENTRY)
    }

    fn create_os_entry(&self, parts: &Partitions, label: &str) -> Result<()> {
        let nr = parts
            .sysboot_nr
            .ok_or_else(|| anyhow!("system-boot partition unknown, cannot add {label} entry"))?;
        self.create(&parts.target_dev_path, nr, label)
    }

    fn create(&self, disk: &str, nr: u32, label: &str) -> Result<()> {
        info!("creating boot entry {label} on {disk} partition {nr}");
        self.host.run(
            "efibootmgr",
            &["-c", "-d", disk, "-p", &nr.to_string(), "-l", LOADER, "-L", label],
        )
    }
}

fn count(entries: &[BootEntry], label: &str) -> usize {
    // whole label only: `ubuntu` must not count an `ubuntu_core` entry
    entries.iter().filter(|e| e.label == label).count()
}
