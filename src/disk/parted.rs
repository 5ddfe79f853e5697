use anyhow::{Context, Result, anyhow, bail};

use super::types::Span;
use super::utils::parse_bytes;
use crate::host::Host;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartedEntry {
    pub nr: u32,
    pub span: Span,
    pub fs: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartedTable {
    pub disk_size: u64,
    /// `gpt`, `msdos` or `unknown`
    pub label: String,
    pub entries: Vec<PartedEntry>,
}

impl PartedTable {
    pub fn get(&self, nr: u32) -> Option<&PartedEntry> {
        self.entries.iter().find(|e| e.nr == nr)
    }

    pub fn last_nr(&self) -> Option<u32> {
        self.entries.iter().map(|e| e.nr).max()
    }
}

/// Parses `parted -ms <disk> unit B print`.
///
/// ```text
/// BYT;
/// /dev/sda:8589934592B:scsi:512:512:msdos:QEMU HARDDISK:;
/// 5:1048576B:68157439B:67108864B:fat32::lba;
/// ```
pub fn parse_print(output: &str) -> Result<PartedTable> {
    let mut table = PartedTable::default();
    let mut saw_disk = false;
    for line in output.lines() {
        let line = line.trim().trim_end_matches(';');
        if line.is_empty() || line == "BYT" {
            continue;
        }
        let fields: Vec<&str> = line.split(':').collect();
        if line.starts_with('/') {
            table.disk_size = fields
                .get(1)
                .and_then(|s| parse_bytes(s))
                .ok_or_else(|| anyhow!("bad disk line from parted: {line}"))?;
            table.label = fields.get(5).unwrap_or(&"unknown").to_string();
            saw_disk = true;
            continue;
        }
        let Ok(nr) = fields[0].parse::<u32>() else {
            continue;
        };
        if fields.len() < 4 {
            bail!("bad partition line from parted: {line}");
        }
        let start = parse_bytes(fields[1]);
        let end = parse_bytes(fields[2]);
        let (Some(start), Some(end)) = (start, end) else {
            bail!("partition {nr} offsets are not in bytes: {line}");
        };
        table.entries.push(PartedEntry {
            nr,
            span: Span::new(start, end),
            fs: fields.get(4).unwrap_or(&"").to_string(),
            name: fields.get(5).unwrap_or(&"").to_string(),
        });
    }
    if !saw_disk {
        bail!("parted output has no disk line");
    }
    Ok(table)
}

/// Thin driver around the `parted` binary for one disk.
pub struct Parted<'a> {
    host: &'a dyn Host,
    device: String,
}

impl<'a> Parted<'a> {
    pub fn new(host: &'a dyn Host, disk_path: &str) -> Self {
        // kpartx maps live under /dev/mapper but parted wants the backing loop device
        Self {
            host,
            device: disk_path.replace("mapper/", ""),
        }
    }

    pub fn device(&self) -> &str {
        &self.device
    }

    pub fn print(&self) -> Result<PartedTable> {
        let out = self
            .host
            .capture("parted", &["-ms", &self.device, "unit", "B", "print"])?;
        parse_print(&out).with_context(|| format!("reading partition table of {}", self.device))
    }

    pub fn rm(&self, nr: u32) -> Result<()> {
        info!("removing partition {nr} from {}", self.device);
        self.host
            .run("parted", &["-ms", &self.device, "rm", &nr.to_string()])
    }

    pub fn mklabel_gpt(&self) -> Result<()> {
        info!("writing empty gpt to {}", self.device);
        self.host
            .run("parted", &["-ms", &self.device, "mklabel", "gpt"])
    }

    /// `kind` is `primary` or `logical` on msdos, and the initial name on gpt.
    pub fn mkpart(&self, kind: &str, fs: &str, span: Span) -> Result<()> {
        let start = format!("{}B", span.start);
        let end = format!("{}B", span.end);
        info!(
            "creating {fs} partition on {} from {start} to {end}",
            self.device
        );
        self.host.run(
            "parted",
            &[
                "-a", "optimal", "-ms", &self.device, "--", "mkpart", kind, fs, &start, &end,
            ],
        )
    }

    pub fn name(&self, nr: u32, name: &str) -> Result<()> {
        self.host
            .run("parted", &["-ms", &self.device, "name", &nr.to_string(), name])
    }

    pub fn set_flag(&self, nr: u32, flag: &str) -> Result<()> {
        self.host
            .run("parted", &["-ms", &self.device, "set", &nr.to_string(), flag, "on"])
    }
}
