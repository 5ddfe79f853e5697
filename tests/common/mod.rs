#![allow(dead_code)]

use anyhow::Result;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::time::Duration;

use recovery_agent::host::{CommandOutput, DeviceWait, Host};
use recovery_agent::recovery::{Confirmation, UserPrompt};

pub const MIB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FakePart {
    pub nr: u32,
    pub start: u64,
    pub end: u64,
    pub fs: String,
}

struct Disk {
    size: u64,
    table: String,
    parts: Vec<FakePart>,
}

/// A host with one disk whose partition table follows the `parted`
/// commands it is given. `tar` archives are plain text, one `path=content`
/// line per file, unpacked into the `-C` directory.
pub struct ScriptedHost {
    disk_path: String,
    disk: RefCell<Disk>,
    labels: RefCell<HashMap<String, String>>,
    outputs: RefCell<Vec<(String, String)>>,
    calls: RefCell<Vec<String>>,
}

impl ScriptedHost {
    pub fn new(disk_path: &str, size: u64, table: &str) -> Self {
        Self {
            disk_path: disk_path.to_string(),
            disk: RefCell::new(Disk {
                size,
                table: table.to_string(),
                parts: Vec::new(),
            }),
            labels: RefCell::new(HashMap::new()),
            outputs: RefCell::new(Vec::new()),
            calls: RefCell::new(Vec::new()),
        }
    }

    pub fn with_partition(self, nr: u32, start: u64, end: u64, fs: &str) -> Self {
        self.disk.borrow_mut().parts.push(FakePart {
            nr,
            start,
            end,
            fs: fs.to_string(),
        });
        self
    }

    pub fn with_label(self, label: &str, nr: u32) -> Self {
        let path = self.part_path(nr);
        self.with_label_at(label, &path)
    }

    /// A label living on some other disk.
    pub fn with_label_at(self, label: &str, part_path: &str) -> Self {
        self.labels
            .borrow_mut()
            .insert(label.to_string(), part_path.to_string());
        self
    }

    /// Canned stdout for command lines starting with `prefix`.
    pub fn respond(&self, prefix: &str, stdout: &str) {
        self.outputs
            .borrow_mut()
            .push((prefix.to_string(), stdout.to_string()));
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.borrow().clone()
    }

    pub fn commands_of(&self, program: &str) -> Vec<String> {
        let prefix = format!("{program} ");
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(&prefix))
            .collect()
    }

    pub fn partitions(&self) -> Vec<FakePart> {
        let mut parts = self.disk.borrow().parts.clone();
        parts.sort_by_key(|p| p.nr);
        parts
    }

    pub fn partition(&self, nr: u32) -> Option<FakePart> {
        self.partitions().into_iter().find(|p| p.nr == nr)
    }

    fn part_path(&self, nr: u32) -> String {
        let sep = if self
            .disk_path
            .chars()
            .last()
            .is_some_and(|c| c.is_ascii_digit())
        {
            "p"
        } else {
            ""
        };
        format!("{}{sep}{nr}", self.disk_path)
    }

    fn print(&self) -> String {
        let disk = self.disk.borrow();
        let mut out = format!(
            "BYT;\n{}:{}B:scsi:512:512:{}:Fake Disk:;\n",
            self.disk_path, disk.size, disk.table
        );
        let mut parts = disk.parts.clone();
        parts.sort_by_key(|p| p.nr);
        for p in parts {
            out.push_str(&format!(
                "{}:{}B:{}B:{}B:{}::;\n",
                p.nr,
                p.start,
                p.end,
                p.end - p.start + 1,
                p.fs
            ));
        }
        out
    }

    fn parted(&self, args: &[&str]) -> CommandOutput {
        let mib_units = args.windows(2).any(|w| w == ["unit", "MiB"]);
        let mut disk = self.disk.borrow_mut();
        let mut i = 0;
        while i < args.len() {
            match args[i] {
                "mklabel" => {
                    disk.table = args[i + 1].to_string();
                    disk.parts.clear();
                    i += 2;
                }
                "rm" => {
                    let nr: u32 = args[i + 1].parse().unwrap_or(0);
                    disk.parts.retain(|p| p.nr != nr);
                    i += 2;
                }
                "mkpart" => {
                    let fs = args[i + 2].to_string();
                    let (start, end) = if mib_units {
                        let s: u64 = args[i + 3].parse().unwrap_or(0);
                        let e: u64 = args[i + 4].parse().unwrap_or(0);
                        (s * MIB, e * MIB - 1)
                    } else {
                        let s: u64 = args[i + 3].trim_end_matches('B').parse().unwrap_or(0);
                        let e: u64 = args[i + 4].trim_end_matches('B').parse().unwrap_or(0);
                        (s, e)
                    };
                    let nr = disk.parts.iter().map(|p| p.nr).max().unwrap_or(0) + 1;
                    disk.parts.push(FakePart { nr, start, end, fs });
                    i += 5;
                }
                _ => i += 1,
            }
        }
        drop(disk);
        let stdout = if args.contains(&"print") {
            self.print()
        } else {
            String::new()
        };
        CommandOutput { code: 0, stdout }
    }

    fn tar(&self, args: &[&str]) -> CommandOutput {
        let archive = args.iter().find(|a| a.ends_with(".tar.xz"));
        let dest = args
            .iter()
            .position(|a| *a == "-C")
            .and_then(|i| args.get(i + 1));
        let (Some(archive), Some(dest)) = (archive, dest) else {
            return CommandOutput {
                code: 2,
                stdout: String::new(),
            };
        };
        let content = fs::read_to_string(archive).unwrap_or_default();
        for line in content.lines() {
            if let Some((rel, body)) = line.split_once('=') {
                let out = Path::new(dest).join(rel);
                if let Some(dir) = out.parent() {
                    let _ = fs::create_dir_all(dir);
                }
                let _ = fs::write(out, format!("{body}\n"));
            }
        }
        CommandOutput::default()
    }
}

impl Host for ScriptedHost {
    fn execute(&self, program: &str, args: &[&str]) -> Result<CommandOutput> {
        let line = format!("{program} {}", args.join(" "));
        self.calls.borrow_mut().push(line.clone());
        match program {
            "findfs" => {
                let label = args[0].trim_start_matches("LABEL=");
                let path = self.labels.borrow().get(label).cloned();
                Ok(match path {
                    Some(path) => CommandOutput {
                        code: 0,
                        stdout: format!("{path}\n"),
                    },
                    None => CommandOutput {
                        code: 1,
                        stdout: String::new(),
                    },
                })
            }
            "parted" => Ok(self.parted(args)),
            "tar" => Ok(self.tar(args)),
            _ => Ok(self
                .outputs
                .borrow()
                .iter()
                .rev()
                .find(|(prefix, _)| line.starts_with(prefix.as_str()))
                .map(|(_, stdout)| CommandOutput {
                    code: 0,
                    stdout: stdout.clone(),
                })
                .unwrap_or_default()),
        }
    }

    fn mount(&self, device: &str, target: &Path, fstype: &str) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("mount {device} {} {fstype}", target.display()));
        Ok(())
    }

    fn bind_mount(&self, source: &Path, target: &Path) -> Result<()> {
        self.calls.borrow_mut().push(format!(
            "bind {} {}",
            source.display(),
            target.display()
        ));
        Ok(())
    }

    fn remount(&self, target: &Path, read_only: bool) -> Result<()> {
        let mode = if read_only { "ro" } else { "rw" };
        self.calls
            .borrow_mut()
            .push(format!("remount {} {mode}", target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> Result<()> {
        self.calls
            .borrow_mut()
            .push(format!("umount {}", target.display()));
        Ok(())
    }

    fn exists(&self, path: &Path) -> bool {
        path.starts_with("/dev") || path.exists()
    }
}

pub fn quick_wait() -> DeviceWait {
    DeviceWait::new(Duration::from_millis(50), Duration::from_millis(5))
}

/// Answers the confirmation without a terminal.
pub struct Answer(pub Confirmation);

impl UserPrompt for Answer {
    fn confirm(&mut self, _timeout: Duration) -> Result<Confirmation> {
        Ok(self.0)
    }
}

pub fn write_archive(path: &Path, files: &[(&str, &str)]) {
    if let Some(dir) = path.parent() {
        fs::create_dir_all(dir).expect("archive dir");
    }
    let body: String = files
        .iter()
        .map(|(rel, content)| format!("{rel}={content}\n"))
        .collect();
    fs::write(path, body).expect("write archive");
}
