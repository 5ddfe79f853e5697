mod common;

use recovery_agent::boot::UbootEnv;
use recovery_agent::config::{Bootloader, PartitionTable, RecoveryConfig, RecoveryOs, RecoveryType};
use recovery_agent::paths::RecoveryPaths;
use recovery_agent::recovery::{Confirmation, Outcome, RecoveryOrchestrator, State, SystemServices};
use serial_test::serial;
use std::fs;
use tempfile::TempDir;

use common::{Answer, MIB, ScriptedHost, quick_wait, write_archive};

const GIB: u64 = 1024 * MIB;
const RECO_END: u64 = MIB + 768 * MIB - 1;

fn gpt_host() -> ScriptedHost {
    ScriptedHost::new("/dev/sda", 16 * GIB, "gpt")
        .with_partition(1, MIB, RECO_END, "fat32")
        .with_partition(2, RECO_END + 1, RECO_END + 64 * MIB, "fat32")
        .with_partition(3, RECO_END + 64 * MIB + 1, 16 * GIB - MIB - 1, "ext4")
        .with_label("recovery", 1)
        .with_label("system-boot", 2)
        .with_label("writable", 3)
}

fn grub_recovery_tree(paths: &RecoveryPaths) {
    fs::create_dir_all(paths.recovery_root.join("EFI/ubuntu")).expect("mkdir");
    write_archive(
        &paths.sysboot_tarball(),
        &[("EFI/ubuntu/grub.cfg", "set cmdline=\"console=tty1\"")],
    );
    write_archive(&paths.writable_tarball(), &[("system-data/etc/hostname", "core")]);
}

#[test]
#[serial]
fn grub_core_factory_install() {
    let temp = TempDir::new().expect("temp dir");
    let paths = RecoveryPaths::under(temp.path());
    grub_recovery_tree(&paths);
    let host = gpt_host();
    host.respond("efibootmgr -v", "BootCurrent: 0000\n");
    let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
    let services = SystemServices::new(&host, &config, &paths).with_device_wait(quick_wait());

    let mut orch = RecoveryOrchestrator::new(
        &services,
        Answer(Confirmation::Declined),
        &config,
        RecoveryType::FactoryInstall,
        RecoveryOs::UbuntuCore,
    );
    assert_eq!(orch.run().expect("run"), Outcome::Done);
    assert_eq!(orch.state(), State::Done);

    let cfg = fs::read_to_string(paths.sysboot_mnt.join("EFI/ubuntu/grub.cfg")).expect("grub.cfg");
    assert!(cfg.contains("set cmdline=\"console=tty1 $cloud_init_disabled\""));
    assert!(cfg.contains("menuentry \"Factory Restore\" {"));
    assert!(cfg.contains("search --no-floppy --set --label \"recovery\""));

    let root = paths.recovery_root.display().to_string();
    let calls = host.calls();
    let rw = calls.iter().position(|c| *c == format!("remount {root} rw"));
    let editenv = calls.iter().position(|c| c.starts_with("grub-editenv "));
    let ro = calls.iter().position(|c| *c == format!("remount {root} ro"));
    assert!(rw < editenv && editenv < ro, "grubenv edited outside rw window");
    assert!(calls.contains(&format!(
        "grub-editenv {root}/EFI/ubuntu/grubenv set recovery_type=factory_restore"
    )));

    let created: Vec<String> = host
        .commands_of("efibootmgr")
        .into_iter()
        .filter(|c| c.contains(" -c "))
        .collect();
    assert_eq!(
        created,
        vec![
            "efibootmgr -c -d /dev/sda -p 1 -l \\EFI\\BOOT\\BOOTX64.EFI -L factory_restore",
            "efibootmgr -c -d /dev/sda -p 2 -l \\EFI\\BOOT\\BOOTX64.EFI -L ubuntu_core",
        ]
    );

    assert_eq!(
        fs::read_to_string(paths.writable_mnt.join("system-data/etc/hostname")).expect("hostname"),
        "core\n"
    );
    assert!(paths.persisted_log(RecoveryOs::UbuntuCore).is_file());
    assert_eq!(
        host.calls().last().map(String::as_str),
        Some(format!("umount {}", paths.sysboot_mnt.display()).as_str())
    );
}

#[test]
fn broken_boot_entries_restart_before_anything_else() {
    let temp = TempDir::new().expect("temp dir");
    let paths = RecoveryPaths::under(temp.path());
    let host = gpt_host();
    host.respond("efibootmgr -v", "BootOrder: 0003\nBoot0003* ubuntu_core\tHD(2)\n");
    let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
    let services = SystemServices::new(&host, &config, &paths);

    let outcome = RecoveryOrchestrator::new(
        &services,
        Answer(Confirmation::Proceed),
        &config,
        RecoveryType::FactoryRestore,
        RecoveryOs::UbuntuCore,
    )
    .run()
    .expect("run");

    assert_eq!(outcome, Outcome::Restart);
    assert_eq!(outcome.exit_code(), 0x55);
    let efi = host.commands_of("efibootmgr");
    assert!(efi.contains(&"efibootmgr -b 0003 -B".to_string()));
    assert_eq!(efi.iter().filter(|c| c.contains(" -c ")).count(), 2);
    assert!(host.commands_of("parted").iter().all(|c| c.ends_with("print")));
    assert!(host.commands_of("mkfs.vfat").is_empty());
}

#[test]
fn declined_restore_leaves_disk_alone() {
    let temp = TempDir::new().expect("temp dir");
    let paths = RecoveryPaths::under(temp.path());
    let host = gpt_host();
    host.respond(
        "efibootmgr -v",
        "Boot0000* factory_restore\tHD(1)\nBoot0001* ubuntu_core\tHD(2)\n",
    );
    let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt);
    let before = host.partitions();
    let services = SystemServices::new(&host, &config, &paths);

    let outcome = RecoveryOrchestrator::new(
        &services,
        Answer(Confirmation::TimedOut),
        &config,
        RecoveryType::FactoryRestore,
        RecoveryOs::UbuntuCore,
    )
    .run()
    .expect("run");

    assert_eq!(outcome, Outcome::Aborted);
    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(host.partitions(), before);
    assert!(host.commands_of("mount").is_empty());
    assert!(host.commands_of("sgdisk").is_empty());
}

#[test]
#[serial]
fn uboot_restore_keeps_assertions_and_arms_env() {
    let temp = TempDir::new().expect("temp dir");
    let paths = RecoveryPaths::under(temp.path());
    let disk = 8 * GIB;
    let host = ScriptedHost::new("/dev/mmcblk0", disk, "msdos")
        .with_partition(5, 3 * MIB, 67 * MIB - 1, "fat32")
        .with_partition(6, 68 * MIB, 836 * MIB - 1, "fat32")
        .with_partition(7, 837 * MIB, disk - MIB - 1, "ext4")
        .with_label("system-boot", 5)
        .with_label("recovery", 6)
        .with_label("writable", 7);
    let mut config = RecoveryConfig::new(Bootloader::UBoot, PartitionTable::Mbr);
    config.configs.arch = "armhf".into();

    write_archive(&paths.sysboot_tarball(), &[("config.txt", "kernel=kernel.img")]);
    write_archive(&paths.writable_tarball(), &[("system-data/etc/hostname", "pi")]);
    fs::create_dir_all(&paths.sysboot_mnt).expect("mkdir");
    let mut env = UbootEnv::create(&paths.sysboot_uboot_env(), 4096).expect("env");
    env.set("snap_mode", "try");
    env.save().expect("save");
    fs::create_dir_all(&paths.backup_snaps).expect("mkdir");
    fs::write(paths.backup_snaps.join("core_16.snap"), b"").expect("snap");
    fs::write(paths.backup_snaps.join("pi2-kernel_22.snap"), b"").expect("snap");
    // signed material from the previous install
    let assertions = paths.assertions_on_writable();
    fs::create_dir_all(&assertions).expect("mkdir");
    fs::write(assertions.join("serial.assert"), "serial").expect("assert");

    let services = SystemServices::new(&host, &config, &paths).with_device_wait(quick_wait());
    let mut orch = RecoveryOrchestrator::new(
        &services,
        Answer(Confirmation::Proceed),
        &config,
        RecoveryType::FactoryRestore,
        RecoveryOs::UbuntuCore,
    );
    assert_eq!(orch.run().expect("run"), Outcome::Done);
    assert!(orch.visited().contains(&State::AssertionsBackedUp));

    assert_eq!(host.partition(7).map(|p| p.start), Some(836 * MIB));
    assert_eq!(
        fs::read_to_string(paths.sysboot_mnt.join("config.txt")).expect("config.txt"),
        "kernel=kernel.img\n"
    );
    assert_eq!(
        fs::read_to_string(paths.writable_mnt.join("system-data/etc/hostname")).expect("hostname"),
        "pi\n"
    );
    assert!(paths.assertion_backup.join("serial.assert").is_file());
    assert_eq!(
        fs::read_to_string(assertions.join("serial.assert")).expect("restored"),
        "serial"
    );

    let env = UbootEnv::open(&paths.sysboot_uboot_env()).expect("env");
    assert_eq!(env.get("snap_mode"), Some(""));
    assert_eq!(env.get("recovery_type"), Some("factory_restore"));
    assert_eq!(env.get("recovery_core"), Some("core_16.snap"));
    assert_eq!(env.get("recovery_kernel"), Some("pi2-kernel_22.snap"));
    assert_eq!(env.get("recovery_label"), Some("LABEL=recovery"));
    assert!(host.commands_of("efibootmgr").is_empty());
}

#[test]
fn headless_copies_recovery_to_other_disk() {
    let temp = TempDir::new().expect("temp dir");
    let paths = RecoveryPaths::under(temp.path());
    fs::create_dir_all(paths.recovery_root.join("EFI/ubuntu")).expect("mkdir");
    fs::create_dir_all(paths.recovery_root.join("recovery")).expect("mkdir");
    fs::write(paths.recovery_root.join("recovery/config.toml"), "[configs]\n").expect("write");

    let host = ScriptedHost::new("/dev/mmcblk0", 32 * GIB, "unknown")
        .with_label_at("recovery", "/dev/sda1");
    let config = RecoveryConfig::new(Bootloader::Grub, PartitionTable::Gpt)
        .with_recovery_device("/dev/mmcblk0");
    let services = SystemServices::new(&host, &config, &paths).with_device_wait(quick_wait());

    let mut orch = RecoveryOrchestrator::new(
        &services,
        Answer(Confirmation::Declined),
        &config,
        RecoveryType::HeadlessInstaller,
        RecoveryOs::UbuntuCore,
    );
    assert_eq!(orch.run().expect("run"), Outcome::Done);
    assert!(orch.visited().contains(&State::HeadlessCopyOnly));

    let parts = host.partitions();
    assert_eq!(parts.len(), 1);
    assert_eq!((parts[0].nr, parts[0].start), (1, 4 * MIB));
    assert_eq!(parts[0].end, (4 + 768) * MIB - 1);

    let calls = host.calls();
    assert!(calls.contains(&"mkfs.vfat -F 32 -n recovery /dev/mmcblk0p1".to_string()));
    assert!(calls.contains(&format!(
        "grub-editenv {}/EFI/ubuntu/grubenv set recovery_type=factory_install",
        paths.reco_copy_mnt.display()
    )));
    assert!(paths.reco_copy_mnt.join("recovery/config.toml").is_file());
    assert!(host.commands_of("sgdisk").is_empty());
    assert!(host.commands_of("mkfs.ext4").is_empty());
}
