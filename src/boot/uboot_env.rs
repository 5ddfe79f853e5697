//! u-boot environment file: a little-endian CRC32 of the data area followed
//! by NUL separated `key=value` pairs, an empty pair, and zero padding up to
//! the fixed size of the file.

use anyhow::{Context, Result, anyhow, bail};
use crc::{CRC_32_ISO_HDLC, Crc};
use std::fs;
use std::path::{Path, PathBuf};

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const HEADER: usize = 4;

#[derive(Debug, Clone)]
pub struct UbootEnv {
    path: PathBuf,
    size: usize,
    vars: Vec<(String, String)>,
}

impl UbootEnv {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes =
            fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        Self::decode(path, &bytes)
    }

    pub fn create(path: &Path, size: usize) -> Result<Self> {
        if size <= HEADER + 1 {
            bail!("environment size {size} too small");
        }
        Ok(Self {
            path: path.to_path_buf(),
            size,
            vars: Vec::new(),
        })
    }

    fn decode(path: &Path, bytes: &[u8]) -> Result<Self> {
        if bytes.len() <= HEADER {
            bail!("{} is too short for a u-boot environment", path.display());
        }
        let (header, data) = bytes.split_at(HEADER);
        let stored = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
        let actual = CRC32.checksum(data);
        if stored != actual {
            bail!(
                "bad crc in {}: stored {stored:#010x}, computed {actual:#010x}",
                path.display()
            );
        }

        let mut vars = Vec::new();
        for raw in data.split(|b| *b == 0) {
            if raw.is_empty() {
                break;
            }
            let pair = String::from_utf8_lossy(raw);
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| anyhow!("malformed entry {pair:?} in {}", path.display()))?;
            vars.push((key.to_string(), value.to_string()));
        }

        Ok(Self {
            path: path.to_path_buf(),
            size: bytes.len(),
            vars,
        })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.vars
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, key: &str, value: &str) {
        match self.vars.iter_mut().find(|(k, _)| k == key) {
            Some(entry) => entry.1 = value.to_string(),
            None => self.vars.push((key.to_string(), value.to_string())),
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(self.size - HEADER);
        for (key, value) in &self.vars {
            data.extend_from_slice(key.as_bytes());
            data.push(b'=');
            data.extend_from_slice(value.as_bytes());
            data.push(0);
        }
        data.push(0);
        if data.len() > self.size - HEADER {
            bail!(
                "environment needs {} bytes but {} holds {}",
                data.len(),
                self.path.display(),
                self.size - HEADER
            );
        }
        data.resize(self.size - HEADER, 0);

        let mut out = CRC32.checksum(&data).to_le_bytes().to_vec();
        out.extend_from_slice(&data);
        Ok(out)
    }

    pub fn save(&self) -> Result<()> {
        let bytes = self.encode()?;
        fs::write(&self.path, bytes)
            .with_context(|| format!("Failed to write {}", self.path.display()))
    }
}
