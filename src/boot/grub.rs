use anyhow::{Context, Result, anyhow, bail};
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use crate::config::RecoveryOs;
use crate::disk::Partitions;
use crate::host::{Host, MountGuard};

pub const MENU_TITLE: &str = "Factory Restore";

const CLASSIC_MENU_COMMANDS: &[&str] = &[
    "recordfail",
    "load_video",
    "gfxmode auto",
    "insmod gzio",
    "if [ x$grub_platform = xxen ]; then insmod xzio; insmod lzopio; fi",
    "insmod part_gpt",
    "insmod ext2",
];

static CMDLINE: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r#"(?m)^set cmdline="(.*)"$"#).ok());
static EXT4_UUID: LazyLock<Option<Regex>> = LazyLock::new(|| {
    Regex::new(r"^[0-9a-f]{8}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{4}-[0-9a-f]{12}$").ok()
});
static VFAT_UUID: LazyLock<Option<Regex>> =
    LazyLock::new(|| Regex::new(r"^[0-9a-fA-F]{4}-[0-9a-fA-F]{4}$").ok());

/// `EFI` or `efi`, whichever `root` carries.
pub fn find_efi_dir(root: &Path) -> Result<&'static str> {
    ["EFI", "efi"]
        .into_iter()
        .find(|dir| root.join(dir).is_dir())
        .ok_or_else(|| anyhow!("no EFI directory in {}", root.display()))
}

/// The recovery boot menu entry appended to grub.cfg.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GrubMenuEntry {
    pub title: String,
    pub label: String,
    pub efi_dir: String,
    pub os: RecoveryOs,
    pub os_commands: Vec<String>,
    /// Prefix of kernel.img and initrd.img inside the recovery partition
    pub bootimg_path: String,
}

impl GrubMenuEntry {
    pub fn factory_restore(label: &str, efi_dir: &str, os: RecoveryOs) -> Self {
        let (os_commands, bootimg_path) = if os.is_core() {
            (Vec::new(), "$recovery_kernel/")
        } else {
            (
                CLASSIC_MENU_COMMANDS.iter().map(|c| c.to_string()).collect(),
                "",
            )
        };
        Self {
            title: MENU_TITLE.to_string(),
            label: label.to_string(),
            efi_dir: efi_dir.to_string(),
            os,
            os_commands,
            bootimg_path: bootimg_path.to_string(),
        }
    }

    fn os_name(&self) -> &'static str {
        if self.os.is_core() {
            "ubuntu_core"
        } else {
            "ubuntu_classic"
        }
    }

    pub fn cmdline(&self) -> String {
        format!(
            "recovery=LABEL={label} ro init=/lib/systemd/systemd console=tty1 panic=-1 fixrtc -- \
             recoverytype=factory_restore recoverylabel={label} snap_core=${{recovery_core}} \
             snap_kernel=${{recovery_kernel}} recoveryos={os}",
            label = self.label,
            os = self.os_name()
        )
    }

    pub fn render(&self) -> String {
        self.to_string()
    }
}

impl fmt::Display for GrubMenuEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        const IND: &str = "        ";
        writeln!(f)?;
        writeln!(f, "menuentry \"{}\" {{", self.title)?;
        for cmd in &self.os_commands {
            writeln!(f, "{IND}{cmd}")?;
        }
        writeln!(f, "{IND}# load recovery system")?;
        writeln!(f, "{IND}echo \"[grub.cfg] load factory_restore system\"")?;
        writeln!(f, "{IND}search --no-floppy --set --label \"{}\"", self.label)?;
        writeln!(f, "{IND}echo \"[grub.cfg] root: ${{root}}\"")?;
        writeln!(f, "{IND}load_env -f (${{root}})/{}/ubuntu/grubenv", self.efi_dir)?;
        writeln!(f, "{IND}set cmdline=\"{}\"", self.cmdline())?;
        writeln!(f, "{IND}echo \"[grub.cfg] loading kernel...\"")?;
        writeln!(f, "{IND}linuxefi ($root)/{}kernel.img $cmdline", self.bootimg_path)?;
        writeln!(f, "{IND}echo \"[grub.cfg] loading initrd...\"")?;
        writeln!(f, "{IND}initrdefi ($root)/{}initrd.img", self.bootimg_path)?;
        writeln!(f, "{IND}echo \"[grub.cfg] boot...\"")?;
        writeln!(f, "{IND}boot")?;
        writeln!(f, "}}")
    }
}

/// Appends ` $cloud_init_disabled` to every `set cmdline="..."` line.
pub fn disable_cloud_init(cfg: &str) -> String {
    match CMDLINE.as_ref() {
        Some(re) => re
            .replace_all(cfg, r#"set cmdline="$1 $$cloud_init_disabled""#)
            .into_owned(),
        None => cfg.to_string(),
    }
}

pub fn has_menu_entry(cfg: &str, title: &str) -> bool {
    let needle = format!("menuentry \"{title}\"");
    cfg.lines().any(|l| l.trim_start().starts_with(&needle))
}

/// Add the recovery entry to `grub_cfg` and arm `grubenv` so the next boot
/// enters recovery.
///
/// The entry is appended on every call unless `dedup` is set.
pub fn update_grub_cfg(
    host: &dyn Host,
    grub_cfg: &Path,
    grubenv: &Path,
    entry: &GrubMenuEntry,
    dedup: bool,
) -> Result<()> {
    let original = fs::read_to_string(grub_cfg)
        .with_context(|| format!("Failed to read {}", grub_cfg.display()))?;
    let mut cfg = disable_cloud_init(&original);
    if dedup && has_menu_entry(&cfg, &entry.title) {
        info!("{} already has \"{}\"", grub_cfg.display(), entry.title);
    } else {
        cfg.push_str(&entry.render());
    }
    fs::write(grub_cfg, cfg).with_context(|| format!("Failed to write {}", grub_cfg.display()))?;

    host.run(
        "grub-editenv",
        &[
            &grubenv.to_string_lossy(),
            "set",
            "recovery_type=factory_restore",
        ],
    )
}

fn blkid_uuid(host: &dyn Host, device: &str, shape: &LazyLock<Option<Regex>>) -> Result<String> {
    let uuid = host
        .capture("blkid", &["-s", "UUID", "-o", "value", device])?
        .trim()
        .to_string();
    match shape.as_ref() {
        Some(re) if re.is_match(&uuid) => Ok(uuid),
        _ => bail!("finding uuid of {device} failed: {uuid:?}"),
    }
}

/// Rewrite `<writable>/etc/fstab` to mount root and the ESP by UUID.
pub fn update_fstab(host: &dyn Host, parts: &Partitions, fstab: &Path, efi_dir: &str) -> Result<()> {
    let writable = parts
        .writable_path()
        .ok_or_else(|| anyhow!("writable partition unknown"))?;
    let sysboot = parts
        .sysboot_path()
        .ok_or_else(|| anyhow!("system-boot partition unknown"))?;
    let writable_uuid = blkid_uuid(host, &writable, &EXT4_UUID)?;
    let sysboot_uuid = blkid_uuid(host, &sysboot, &VFAT_UUID)?;

    let content = format!(
        "UUID={writable_uuid}\t/\text4\terrors=remount-ro\t0\t1\n\
         UUID={sysboot_uuid}\t/boot/{efi_dir}\tvfat\tumask=0077\t0\t1\n"
    );
    if let Some(dir) = fstab.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    fs::write(fstab, content).with_context(|| format!("Failed to write {}", fstab.display()))?;
    info!("{} now mounts root by UUID={writable_uuid}", fstab.display());
    Ok(())
}

/// Show the menu and pass the resume device on the kernel command line.
pub fn edit_default_grub(content: &str, show_menu: bool, resume: Option<&str>) -> String {
    let mut out = String::with_capacity(content.len() + 64);
    for line in content.lines() {
        if show_menu && line.starts_with("GRUB_HIDDEN_TIMEOUT=0") {
            out.push_str("GRUB_RECORDFAIL_TIMEOUT=3\n#");
            out.push_str(line);
        } else if let Some(dev) = resume {
            out.push_str(&line.replace("quiet splash", &format!("quiet splash resume={dev}")));
        } else {
            out.push_str(line);
        }
        out.push('\n');
    }
    out
}

/// Install grub from inside the restored classic system.
pub fn grub_install(
    host: &dyn Host,
    writable: &Path,
    sysboot: &Path,
    efi_dir: &str,
    resume: Option<&str>,
) -> Result<()> {
    let default_grub = writable.join("etc/default/grub");
    match fs::read_to_string(&default_grub) {
        Ok(content) => fs::write(&default_grub, edit_default_grub(&content, true, resume))
            .with_context(|| format!("Failed to write {}", default_grub.display()))?,
        Err(e) => warn!("skip editing {}: {e}", default_grub.display()),
    }

    // stale loaders in the ESP would shadow the new install
    for entry in fs::read_dir(sysboot).with_context(|| format!("listing {}", sysboot.display()))? {
        let path = entry?.path();
        if path.is_dir() {
            fs::remove_dir_all(&path)
        } else {
            fs::remove_file(&path)
        }
        .with_context(|| format!("Failed to remove {}", path.display()))?;
    }

    let mut binds = vec![MountGuard::bind(host, sysboot, &writable.join("boot").join(efi_dir))?];
    for dir in ["sys", "proc", "dev", "run"] {
        binds.push(MountGuard::bind(host, &Path::new("/").join(dir), &writable.join(dir))?);
    }

    let root = writable.to_string_lossy();
    host.run("chroot", &[&root, "grub-install", "--target=x86_64-efi"])?;
    host.run("chroot", &[&root, "update-grub"])?;
    drop(binds);
    Ok(())
}
