use anyhow::{Context, Result, bail};
use nix::mount::{self, MsFlags};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::RecoveryError;

/// Tools whose non-zero exit is expected on some hardware and only logged.
pub const ALLOWED_FAILURES: &[&str] = &["fsck", "partprobe"];

#[derive(Debug, Clone, Default)]
pub struct CommandOutput {
    pub code: i32,
    pub stdout: String,
}

/// Every side effect on the machine goes through this trait.
pub trait Host {
    /// Spawn `program` and wait for it. Only a failure to spawn is an error.
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput>;

    fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()>;

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()>;

    fn remount(&self, target: &Path, read_only: bool) -> Result<()>;

    fn unmount(&self, target: &Path) -> Result<()>;

    fn exists(&self, path: &Path) -> bool {
        path.exists()
    }

    /// Run a command, a non-zero exit is fatal unless allow-listed.
    fn run(&self, program: &str, args: &[&str]) -> Result<()> {
        self.capture(program, args).map(|_| ())
    }

    /// Like [`Host::run`] but hands back stdout.
    fn capture(&self, program: &str, args: &[&str]) -> Result<String> {
        debug!("exec: {program} {}", args.join(" "));
        let out = self.execute(program, args)?;
        check_status(program, args, out.code)?;
        Ok(out.stdout)
    }
}

pub fn check_status(program: &str, args: &[&str], code: i32) -> Result<()> {
    if code == 0 {
        return Ok(());
    }
    let command = format!("{program} {}", args.join(" "));
    if ALLOWED_FAILURES.contains(&program) {
        warn!("`{command}` exited with status {code}, ignored");
        return Ok(());
    }
    Err(RecoveryError::ExternalTool { command, code }.into())
}

/// The real machine.
pub struct SystemHost;

impl Host for SystemHost {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stderr(Stdio::inherit())
            .output()
            .with_context(|| format!("failed to spawn {program}"))?;
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !stdout.is_empty() {
            trace!("{program}: {}", stdout.trim_end());
        }
        Ok(CommandOutput {
            code: output.status.code().unwrap_or(-1),
            stdout,
        })
    }

    fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()> {
        mount::mount::<str, Path, str, str>(
            Some(device),
            target,
            Some(fstype),
            MsFlags::empty(),
            None,
        )
        .with_context(|| format!("mounting {device} on {}", target.display()))
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        mount::mount::<Path, Path, str, str>(Some(source), target, None, MsFlags::MS_BIND, None)
            .with_context(|| format!("bind mounting {} on {}", source.display(), target.display()))
    }

    fn remount(&self, target: &Path, read_only: bool) -> Result<()> {
        let mut flags = MsFlags::MS_REMOUNT;
        if read_only {
            flags |= MsFlags::MS_RDONLY;
        }
        mount::mount::<str, Path, str, str>(None, target, None, flags, None).with_context(|| {
            format!(
                "remounting {} {}",
                target.display(),
                if read_only { "ro" } else { "rw" }
            )
        })
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        mount::umount(target).with_context(|| format!("unmounting {}", target.display()))
    }
}

/// Unmounts on drop, whichever way the caller leaves.
pub struct MountGuard<'a> {
    host: &'a dyn Host,
    target: PathBuf,
    mounted: bool,
}

impl<'a> MountGuard<'a> {
    pub fn mount(host: &'a dyn Host, device: &str, target: &Path, fstype: &str) -> Result<Self> {
        fs::create_dir_all(target)
            .with_context(|| format!("creating mount point {}", target.display()))?;
        host.mount(device, target, fstype)?;
        info!("mounted {device} on {}", target.display());
        Ok(Self {
            host,
            target: target.to_path_buf(),
            mounted: true,
        })
    }

    pub fn bind(host: &'a dyn Host, source: &Path, target: &Path) -> Result<Self> {
        fs::create_dir_all(target)
            .with_context(|| format!("creating mount point {}", target.display()))?;
        host.bind_mount(source, target)?;
        Ok(Self {
            host,
            target: target.to_path_buf(),
            mounted: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.target
    }

    /// Unmount now and report the error instead of logging it.
    pub fn unmount(mut self) -> Result<()> {
        self.mounted = false;
        self.host.unmount(&self.target)
    }
}

impl Drop for MountGuard<'_> {
    fn drop(&mut self) {
        if !self.mounted {
            return;
        }
        match self.host.unmount(&self.target) {
            Ok(()) => debug!("unmounted {}", self.target.display()),
            Err(e) => warn!("unmount {} failed: {e:#}", self.target.display()),
        }
    }
}

/// Bounded poll for a device node to show up after the table was re-read.
#[derive(Debug, Clone)]
pub struct DeviceWait {
    pub timeout: Duration,
    pub interval: Duration,
    cancel: Arc<AtomicBool>,
}

impl Default for DeviceWait {
    fn default() -> Self {
        Self::new(Duration::from_secs(10), Duration::from_millis(100))
    }
}

impl DeviceWait {
    pub fn new(timeout: Duration, interval: Duration) -> Self {
        Self {
            timeout,
            interval,
            cancel: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Setting the returned flag makes a pending [`DeviceWait::wait`] give up.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        self.cancel.clone()
    }

    pub fn wait(&self, host: &dyn Host, path: &Path) -> Result<()> {
        let deadline = Instant::now() + self.timeout;
        loop {
            if host.exists(path) {
                return Ok(());
            }
            if self.cancel.load(Ordering::Relaxed) {
                bail!("waiting for {} cancelled", path.display());
            }
            let now = Instant::now();
            if now >= deadline {
                bail!("{} did not appear within {:?}", path.display(), self.timeout);
            }
            thread::sleep(self.interval.min(deadline - now));
        }
    }
}
