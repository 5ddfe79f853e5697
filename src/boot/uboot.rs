use anyhow::{Context, Result};
use std::fs;
use std::path::Path;

use super::uboot_env::UbootEnv;
use crate::disk::Partitions;
use crate::error::RecoveryError;

/// Boot script that understands `snap_mode=recovery` and loads the kernel
/// from the recovery partition.
const SNAPPY_BOOT: &str = "if test \"${snap_mode}\" = \"try\"; then setenv snap_mode \"trying\"; saveenv; if test \"${snap_try_core}\" != \"\"; then setenv snap_core \"${snap_try_core}\"; fi; if test \"${snap_try_kernel}\" != \"\"; then setenv snap_kernel \"${snap_try_kernel}\"; fi; elif test \"${snap_mode}\" = \"trying\"; then setenv snap_mode \"\"; saveenv; elif test \"${snap_mode}\" = \"recovery\"; then setenv loadinitrd \"load mmc ${mmcdev}:${mmcreco} ${initrd_addr} ${initrd_file}; setenv initrd_size ${filesize}\"; setenv loadkernel \"load mmc ${mmcdev}:${mmcreco} ${loadaddr} ${kernel_file}\"; setenv factory_recovery \"run loadfiles; setenv mmcroot \"/dev/disk/by-label/writable ${snappy_cmdline} snap_core=${snap_core} snap_kernel=${snap_kernel} recoverytype=factory_restore\"; run mmcargs; bootz ${loadaddr} ${initrd_addr}:${initrd_size} 0x02000000\"; echo \"RECOVERY\"; run factory_recovery; fi; run loadfiles; setenv mmcroot \"/dev/disk/by-label/writable ${snappy_cmdline} snap_core=${snap_core} snap_kernel=${snap_kernel}\"; run mmcargs; bootz ${loadaddr} ${initrd_addr}:${initrd_size} 0x02000000";

const LOADBOOTENV: &str = "load ${devtype} ${devnum}:${mmcpart} ${loadaddr} ${bootenv}";

/// The one `*<kind>*.snap` in `dir`, by file name.
pub fn find_single_snap(dir: &Path, kind: &str) -> Result<String> {
    let mut found: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("listing {}", dir.display()))?
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|name| name.contains(kind) && name.ends_with(".snap"))
        .collect();
    if found.len() != 1 {
        return Err(RecoveryError::LayoutAmbiguity {
            pattern: format!("*{kind}*.snap"),
            dir: dir.display().to_string(),
            found: found.len(),
        }
        .into());
    }
    Ok(found.remove(0))
}

/// Point the next boot at recovery: `snap_mode=""` and
/// `recovery_type=factory_restore` plus the snaps to boot it from.
pub fn update_uboot_env(env_path: &Path, backup_snaps: &Path, label: &str) -> Result<()> {
    // both snaps are resolved before the file is touched
    let core = find_single_snap(backup_snaps, "core")?;
    let kernel = find_single_snap(backup_snaps, "kernel")?;

    let mut env = UbootEnv::open(env_path)?;
    env.set("snap_mode", "");
    env.set("recovery_type", "factory_restore");
    env.set("recovery_core", &core);
    env.set("recovery_kernel", &kernel);
    env.set("recovery_label", &format!("LABEL={label}"));
    env.save()?;
    info!(
        "{} updated: recovery_core={core} recovery_kernel={kernel}",
        env_path.display()
    );
    Ok(())
}

/// Teach the recovery partition's own environment where recovery and
/// system-boot live, and to load the live environment from system-boot.
pub fn set_boot_partition_keys(env_path: &Path, parts: &Partitions) -> Result<()> {
    let mut env = UbootEnv::open(env_path)?;
    env.set("mmcreco", &parts.recovery_nr.to_string());
    if let Some(nr) = parts.sysboot_nr {
        env.set("mmcpart", &nr.to_string());
    }
    env.set("snappy_boot", SNAPPY_BOOT);
    env.set("loadbootenv", LOADBOOTENV);
    env.set("bootenv", "uboot.env");
    env.save()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn env_file(dir: &Path) -> std::path::PathBuf {
        let path = dir.join("uboot.env");
        let mut env = UbootEnv::create(&path, 8192).expect("create");
        env.set("snap_mode", "try");
        env.save().expect("save");
        path
    }

    #[test]
    fn writes_recovery_keys() {
        let temp = TempDir::new().expect("temp dir");
        let snaps = temp.path().join("backup_snaps");
        fs::create_dir_all(&snaps).expect("mkdir");
        fs::write(snaps.join("core_1234.snap"), b"").expect("write");
        fs::write(snaps.join("pi2-kernel_22.snap"), b"").expect("write");
        let path = env_file(temp.path());

        update_uboot_env(&path, &snaps, "recovery").expect("update");

        let env = UbootEnv::open(&path).expect("open");
        assert_eq!(env.get("snap_mode"), Some(""));
        assert_eq!(env.get("recovery_type"), Some("factory_restore"));
        assert_eq!(env.get("recovery_core"), Some("core_1234.snap"));
        assert_eq!(env.get("recovery_kernel"), Some("pi2-kernel_22.snap"));
        assert_eq!(env.get("recovery_label"), Some("LABEL=recovery"));
    }

    #[test]
    fn ambiguous_snaps_leave_env_untouched() {
        let temp = TempDir::new().expect("temp dir");
        let snaps = temp.path().join("backup_snaps");
        fs::create_dir_all(&snaps).expect("mkdir");
        fs::write(snaps.join("core_1.snap"), b"").expect("write");
        fs::write(snaps.join("core_2.snap"), b"").expect("write");
        fs::write(snaps.join("pi2-kernel_22.snap"), b"").expect("write");
        let path = env_file(temp.path());
        let before = fs::read(&path).expect("read");

        let err = update_uboot_env(&path, &snaps, "recovery").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RecoveryError>(),
            Some(RecoveryError::LayoutAmbiguity { found: 2, .. })
        ));
        assert_eq!(fs::read(&path).expect("read"), before);
    }

    #[test]
    fn missing_kernel_is_ambiguous() {
        let temp = TempDir::new().expect("temp dir");
        fs::write(temp.path().join("core_1.snap"), b"").expect("write");
        let err = find_single_snap(temp.path(), "kernel").unwrap_err();
        assert!(err.to_string().contains("found 0"));
    }

    #[test]
    fn boot_partition_keys() {
        let temp = TempDir::new().expect("temp dir");
        let path = env_file(temp.path());
        let parts = Partitions {
            recovery_nr: 1,
            sysboot_nr: Some(2),
            ..Default::default()
        };
        set_boot_partition_keys(&path, &parts).expect("set");
        let env = UbootEnv::open(&path).expect("open");
        assert_eq!(env.get("mmcreco"), Some("1"));
        assert_eq!(env.get("mmcpart"), Some("2"));
        assert_eq!(env.get("bootenv"), Some("uboot.env"));
        assert!(env.get("snappy_boot").is_some_and(|s| s.contains("snap_mode")));
    }
}
