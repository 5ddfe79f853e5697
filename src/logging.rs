use anyhow::{Context, Result};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::Mutex;

/// Second destination for log lines, set once writable is mounted.
static PERSISTED: Mutex<Option<File>> = Mutex::new(None);

/// Writes every log line to stderr and, when attached, to the persisted log.
pub struct Tee;

impl Write for Tee {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stderr().write_all(buf)?;
        if let Ok(mut sink) = PERSISTED.lock() {
            if let Some(file) = sink.as_mut() {
                // losing the copy on disk must not stop the run
                let _ = file.write_all(buf);
            }
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if let Ok(mut sink) = PERSISTED.lock() {
            if let Some(file) = sink.as_mut() {
                let _ = file.flush();
            }
        }
        io::stderr().flush()
    }
}

/// Default level info, file line number and time on every record.
pub fn init() {
    builder().init();
}

/// Installs the same logger for tests; later calls keep the first one.
#[cfg(test)]
pub(crate) fn init_for_tests() {
    let _ = builder().try_init();
}

fn builder() -> env_logger::Builder {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder
        .format(|buf, record| {
            let level_style = buf.default_level_style(record.level());
            writeln!(
                buf,
                "[{} {level_style}{}{level_style:#} {}:{}] {level_style}{}{level_style:#}",
                chrono::Local::now().format("%H:%M:%S"),
                record.level(),
                record.target(),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .target(env_logger::Target::Pipe(Box::new(Tee)));
    builder
}

/// Detaches the persisted log when dropped, so the filesystem under it can
/// be unmounted.
#[must_use = "the log is detached as soon as the guard is dropped"]
pub struct PersistGuard(());

impl Drop for PersistGuard {
    fn drop(&mut self) {
        if let Ok(mut sink) = PERSISTED.lock() {
            if let Some(mut file) = sink.take() {
                let _ = file.flush();
            }
        }
    }
}

/// Start appending log lines to `path` as well.
pub fn persist_to(path: &Path) -> Result<PersistGuard> {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
    }
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    if let Ok(mut sink) = PERSISTED.lock() {
        *sink = Some(file);
    }
    info!("persisting log to {}", path.display());
    Ok(PersistGuard(()))
}
