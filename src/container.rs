//! Outer containers around pickle payloads
//!
//! joblib files may be zlib or gzip compressed; PyTorch checkpoints are zip
//! archives holding `data.pkl` plus one entry per tensor storage. Both are
//! unpacked with hard size limits so a small upload cannot expand into an
//! unbounded allocation.

use flate2::read::{GzDecoder, ZlibDecoder};
use std::borrow::Cow;
use std::io::{Cursor, Read};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ContainerError {
    #[error("decompressed payload exceeds {limit} bytes")]
    LimitExceeded { limit: u64 },

    #[error("unsupported compression: {0}")]
    UnsupportedCompression(&'static str),

    #[error("corrupt compressed stream: {0}")]
    Corrupt(String),

    #[error("not a zip archive: {0}")]
    NotZip(String),

    #[error("archive has no {0}")]
    MissingEntry(String),
}

/// Bounds applied while expanding compressed or archived payloads
#[derive(Debug, Clone, Copy)]
pub struct ExpansionLimits {
    /// Absolute cap on expanded bytes
    pub max_bytes: u64,
    /// Cap on expanded bytes as a multiple of the input size
    pub max_ratio: u64,
}

impl Default for ExpansionLimits {
    fn default() -> Self {
        Self {
            max_bytes: 1024 * 1024 * 1024,
            max_ratio: 200,
        }
    }
}

impl ExpansionLimits {
    /// Effective cap for an input of `input_len` bytes
    pub fn cap_for(&self, input_len: usize) -> u64 {
        let relative = (input_len as u64).saturating_mul(self.max_ratio).max(1024 * 1024);
        relative.min(self.max_bytes)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Zlib,
    Gzip,
}

/// Sniff the compression wrapper of a joblib file
pub fn joblib_compression(bytes: &[u8]) -> Result<Compression, ContainerError> {
    match bytes {
        [0x1f, 0x8b, ..] => Ok(Compression::Gzip),
        [0x78, b1, ..] if (0x78u16 * 256 + *b1 as u16) % 31 == 0 => Ok(Compression::Zlib),
        [0xfd, b'7', b'z', b'X', b'Z', 0x00, ..] => Err(ContainerError::UnsupportedCompression("xz")),
        [b'B', b'Z', b'h', ..] => Err(ContainerError::UnsupportedCompression("bz2")),
        [0x5d, 0x00, 0x00, ..] => Err(ContainerError::UnsupportedCompression("lzma")),
        [0x04, 0x22, 0x4d, 0x18, ..] => Err(ContainerError::UnsupportedCompression("lz4")),
        [b'Z', b'F', ..] => Err(ContainerError::UnsupportedCompression("legacy joblib zfile")),
        _ => Ok(Compression::None),
    }
}

/// The raw pickle stream inside a joblib file
pub fn joblib_payload(bytes: &[u8], limits: ExpansionLimits) -> Result<Cow<'_, [u8]>, ContainerError> {
    let cap = limits.cap_for(bytes.len());
    match joblib_compression(bytes)? {
        Compression::None => Ok(Cow::Borrowed(bytes)),
        Compression::Zlib => read_capped(ZlibDecoder::new(bytes), cap).map(Cow::Owned),
        Compression::Gzip => read_capped(GzDecoder::new(bytes), cap).map(Cow::Owned),
    }
}

fn read_capped(reader: impl Read, cap: u64) -> Result<Vec<u8>, ContainerError> {
    let mut out = Vec::new();
    reader
        .take(cap.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| ContainerError::Corrupt(e.to_string()))?;
    if out.len() as u64 > cap {
        return Err(ContainerError::LimitExceeded { limit: cap });
    }
    Ok(out)
}

/// Fully expanded PyTorch zip archive
#[derive(Debug, Default)]
pub struct TorchArchive {
    entries: Vec<(String, Vec<u8>)>,
}

impl TorchArchive {
    pub fn open(bytes: &[u8], limits: ExpansionLimits) -> Result<Self, ContainerError> {
        let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
            .map_err(|e| ContainerError::NotZip(e.to_string()))?;

        let cap = limits.cap_for(bytes.len());
        let mut total = 0u64;
        let mut entries = Vec::with_capacity(archive.len());
        for index in 0..archive.len() {
            let file = archive
                .by_index(index)
                .map_err(|e| ContainerError::NotZip(e.to_string()))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let remaining = cap.saturating_sub(total);
            let data = read_capped(file, remaining).map_err(|e| match e {
                ContainerError::LimitExceeded { .. } => ContainerError::LimitExceeded { limit: cap },
                other => other,
            })?;
            total += data.len() as u64;
            entries.push((name, data));
        }
        Ok(Self { entries })
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    pub fn entry(&self, name: &str) -> Option<&[u8]> {
        self.entries
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    /// Every file entry with its expanded bytes
    pub fn entries(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    /// Every pickle stream in the archive
    pub fn pickles(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.entries
            .iter()
            .filter(|(n, _)| n.ends_with(".pkl"))
            .map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    /// Whether the archive carries TorchScript sources
    pub fn has_code(&self) -> bool {
        self.names()
            .any(|n| n.starts_with("code/") || n.contains("/code/"))
    }

    /// The main object pickle and the archive prefix its storages live under
    pub fn data_pickle(&self) -> Result<(&str, &[u8]), ContainerError> {
        self.entries
            .iter()
            .filter_map(|(n, d)| {
                let prefix = match n.as_str() {
                    "data.pkl" => "",
                    other => other.strip_suffix("/data.pkl")?,
                };
                (!prefix.contains('/')).then_some((prefix, d.as_slice()))
            })
            .next()
            .ok_or_else(|| ContainerError::MissingEntry("data.pkl".to_string()))
    }

    /// Raw bytes of storage `key`
    pub fn storage(&self, prefix: &str, key: &str) -> Option<&[u8]> {
        let name = if prefix.is_empty() {
            format!("data/{}", key)
        } else {
            format!("{}/data/{}", prefix, key)
        };
        self.entry(&name)
    }
}
