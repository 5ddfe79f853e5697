//! User-visible data carried into the freshly written system: signed
//! assertions kept across a restore, seed snaps and the first-boot service.

use anyhow::{Context, Result};
use std::fs;
use std::os::unix::fs::symlink;
use std::path::Path;

use crate::config::RecoveryType;
use crate::file::{copy_tree, unsquash};
use crate::host::Host;
use crate::paths::RecoveryPaths;

pub const FIRSTBOOT_UNIT: &str = "devmode-firstboot.service";

/// Save `<writable>/writable/recovery` before the partition is wiped.
/// Returns whether anything was saved.
pub fn backup_assertions(paths: &RecoveryPaths) -> Result<bool> {
    let src = paths.assertions_on_writable();
    if !src.is_dir() {
        info!("no assertions at {}, nothing to back up", src.display());
        return Ok(false);
    }
    if paths.assertion_backup.exists() {
        fs::remove_dir_all(&paths.assertion_backup).with_context(|| {
            format!("Failed to clear {}", paths.assertion_backup.display())
        })?;
    }
    copy_tree(&src, &paths.assertion_backup).context("backing up assertions")?;
    info!("assertions backed up to {}", paths.assertion_backup.display());
    Ok(true)
}

/// Put the backed up assertions back onto the new writable partition.
pub fn restore_assertions(paths: &RecoveryPaths) -> Result<bool> {
    if !paths.assertion_backup.is_dir() {
        info!("no assertion backup to restore");
        return Ok(false);
    }
    let dst = paths.assertions_on_writable();
    copy_tree(&paths.assertion_backup, &dst).context("restoring assertions")?;
    info!("assertions restored to {}", dst.display());
    Ok(true)
}

/// Seed the new system with the factory snaps and preinstalled assertions.
pub fn copy_snaps_asserts(paths: &RecoveryPaths) -> Result<()> {
    let seeds = [
        (paths.snaps_src(), paths.seed_snaps()),
        (paths.devmode_snaps_src(), paths.seed_snaps()),
        (paths.preinstall_assertions_src(), paths.seed_assertions()),
    ];
    for (src, dst) in &seeds {
        if src.is_dir() {
            debug!("seeding {} from {}", dst.display(), src.display());
            copy_tree(src, dst)?;
        }
    }
    Ok(())
}

fn write_firstboot_conf(path: &Path, label: &str, recovery_type: RecoveryType) -> Result<()> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let conf = format!("RECOVERYFSLABEL=\"{label}\"\nRECOVERY_TYPE=\"{recovery_type}\"\n");
    fs::write(path, conf).with_context(|| format!("Failed to write {}", path.display()))
}

/// Prepare writable so the device finishes setting itself up on first boot.
pub fn add_firstboot_service(
    host: &dyn Host,
    paths: &RecoveryPaths,
    recovery_type: RecoveryType,
    label: &str,
) -> Result<()> {
    // the initrd leaves etc/systemd/system alone once it holds anything
    let units = paths.system_data().join("etc/systemd/system");
    if paths.systemd_units().is_dir() {
        copy_tree(&paths.systemd_units(), &units).context("copying systemd units")?;
    } else {
        fs::create_dir_all(&units)
            .with_context(|| format!("Failed to create directory: {}", units.display()))?;
    }

    let includes = paths.writable_includes();
    if includes.exists() {
        unsquash(host, &includes, &paths.writable_mnt)?;
    }

    if !paths.firstboot_service_dir().is_dir() {
        debug!("{} absent, first-boot service not configured", paths.firstboot_service_dir().display());
        return Ok(());
    }
    let conf = paths.system_data().join("var/lib/devmode-firstboot/conf.sh");
    write_firstboot_conf(&conf, label, recovery_type)?;

    let wants = units.join("multi-user.target.wants");
    fs::create_dir_all(&wants)
        .with_context(|| format!("Failed to create directory: {}", wants.display()))?;
    let link = wants.join(FIRSTBOOT_UNIT);
    if link.symlink_metadata().is_err() {
        symlink(Path::new("/lib/systemd/system").join(FIRSTBOOT_UNIT), &link)
            .with_context(|| format!("Failed to create link: {}", link.display()))?;
    }
    info!("first-boot service enabled, {}", conf.display());
    Ok(())
}
