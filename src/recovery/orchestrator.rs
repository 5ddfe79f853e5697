use anyhow::Result;

use super::confirm::UserPrompt;
use super::services::{BootService, PartitionService};
use crate::config::{Bootloader, RecoveryConfig, RecoveryOs, RecoveryType};
use crate::disk::Partitions;
use crate::error::RecoveryError;
use crate::logging;

/// Exit status asking the caller to reboot.
pub const RESTART_EXIT_CODE: i32 = 0x55;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Start,
    ConfigLoaded,
    PartitionsLocated,
    BootEntriesVerified,
    HeadlessCopyOnly,
    NormalFlow,
    Confirmed,
    AssertionsBackedUp,
    PartitionsRecreated,
    Mounted,
    DataRestored,
    BootConfigUpdated,
    Unmounted,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Done,
    /// Boot entries were repaired, the device must reboot first.
    Restart,
    /// The user declined or did not answer. Nothing was touched.
    Aborted,
}

impl Outcome {
    pub fn exit_code(self) -> i32 {
        match self {
            Outcome::Done | Outcome::Aborted => 0,
            Outcome::Restart => RESTART_EXIT_CODE,
        }
    }
}

/// Drives one recovery run from discovery to unmount.
pub struct RecoveryOrchestrator<'a, S, P> {
    services: &'a S,
    prompt: P,
    config: &'a RecoveryConfig,
    recovery_type: RecoveryType,
    os: RecoveryOs,
    state: State,
    visited: Vec<State>,
}

impl<'a, S, P> RecoveryOrchestrator<'a, S, P>
where
    S: PartitionService + BootService,
    P: UserPrompt,
{
    pub fn new(
        services: &'a S,
        prompt: P,
        config: &'a RecoveryConfig,
        recovery_type: RecoveryType,
        os: RecoveryOs,
    ) -> Self {
        Self {
            services,
            prompt,
            config,
            recovery_type,
            os,
            state: State::Start,
            visited: vec![State::Start],
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Every state entered so far, in order.
    pub fn visited(&self) -> &[State] {
        &self.visited
    }

    fn advance(&mut self, next: State) {
        info!("[{:?} -> {:?}]", self.state, next);
        self.state = next;
        self.visited.push(next);
    }

    pub fn run(&mut self) -> Result<Outcome> {
        let services = self.services;
        let label = self.config.label().to_string();
        info!(
            "recovery type {}, label {label}, os {}",
            self.recovery_type, self.os
        );
        self.advance(State::ConfigLoaded);

        let mut parts = services.get_partitions(self.recovery_type)?;
        debug!("{parts:?}");
        self.advance(State::PartitionsLocated);

        if self.config.configs.arch == "amd64" {
            match services.restore_boot_entries(&parts, self.recovery_type, self.os) {
                Err(e) if RecoveryError::is_repaired(&e) => {
                    warn!("{e}");
                    return Ok(Outcome::Restart);
                }
                other => other?,
            }
        }
        self.advance(State::BootEntriesVerified);

        if self.recovery_type == RecoveryType::HeadlessInstaller {
            self.advance(State::HeadlessCopyOnly);
            services.copy_recovery_part(&mut parts)?;
            self.advance(State::Done);
            return Ok(Outcome::Done);
        }
        self.advance(State::NormalFlow);

        if self.recovery_type == RecoveryType::FactoryRestore {
            let timeout = self.config.recovery.restore_confirm_timeout;
            let answer = self.prompt.confirm(timeout)?;
            if !answer.proceeds() {
                info!("factory restore not confirmed ({answer:?}), leaving the disk alone");
                return Ok(Outcome::Aborted);
            }
            self.advance(State::Confirmed);

            services.backup_assertions(&parts)?;
            self.advance(State::AssertionsBackedUp);
        }

        services.restore_parts(&mut parts, self.os)?;
        self.advance(State::PartitionsRecreated);

        if self.os.is_curtin() {
            // curtin mounts and configures the target by itself
            self.advance(State::Done);
            return Ok(Outcome::Done);
        }

        let writable = services.mount_writable(&parts)?;
        let sysboot = services.mount_sysboot(&parts)?;
        self.advance(State::Mounted);

        let persisted = logging::persist_to(&services.persisted_log(self.os))?;
        info!(
            "{} {} on {}",
            env!("CARGO_PKG_NAME"),
            env!("CARGO_PKG_VERSION"),
            chrono::Local::now().to_rfc3339()
        );
        if let Err(e) = self.configure_mounted(&parts, &label) {
            // reported here while the persisted log is still attached
            error!("{e:#}");
            return Err(e);
        }

        drop(persisted);
        writable.unmount()?;
        sysboot.unmount()?;
        self.advance(State::Unmounted);

        self.advance(State::Done);
        Ok(Outcome::Done)
    }

    /// Data and boot configuration, with writable and system-boot mounted.
    fn configure_mounted(&mut self, parts: &Partitions, label: &str) -> Result<()> {
        let services = self.services;
        if self.os.is_core() {
            services.seed_system(self.recovery_type, label)?;
        } else {
            services.update_fstab(parts)?;
        }
        if self.recovery_type == RecoveryType::FactoryRestore {
            services.restore_assertions()?;
        }
        self.advance(State::DataRestored);

        match self.config.configs.bootloader {
            Bootloader::UBoot => services.update_uboot(parts, self.recovery_type, label)?,
            Bootloader::Grub => {
                services.update_grub(self.os, label)?;
                if self.os.is_core() {
                    services.update_boot_entries(parts, self.os)?;
                } else {
                    services.grub_install(parts, self.os)?;
                }
            }
        }
        self.advance(State::BootConfigUpdated);

        Ok(())
    }
}
