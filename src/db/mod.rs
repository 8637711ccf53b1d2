//! Static patch database backed by a patch record file.
//!
//! The external patch editor writes a JSON document listing patched byte
//! runs of the program image:
//!
//! ```json
//! { "version": 1,
//!   "patches": [ { "address": 4096, "original": "AABBCCDD", "patched": "11223344" } ] }
//! ```
//!
//! The file is re-read on every visit so edits show up on the next poll.
//! File offsets come from the optional `file_offset` field, else from the
//! program image layout, else they equal the address (flat image).

pub mod image;

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use image::{ImageLayout, SectionInfo};

use crate::debug::{RawPatchedByte, StaticPatchSource, INVALID_FILE_OFFSET, VISIT_OK};

/// Current patch record file version
pub const RECORD_FILE_VERSION: u32 = 1;

/// Status code reported for a record file with an unknown version
pub const VISIT_BAD_VERSION: i32 = 2;

#[derive(Error, Debug)]
pub enum RecordDbError {
    #[error("Cannot read patch records {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Malformed patch records: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Patch record at {address:#x} is invalid: {reason}")]
    Record { address: u64, reason: String },
}

/// One patched run as written by the patch editor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchRecord {
    pub address: u64,
    /// Original bytes, hex encoded
    pub original: String,
    /// Patched bytes, hex encoded
    pub patched: String,
    /// File offset of the first byte; -1 marks bytes outside the file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_offset: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordFile {
    pub version: u32,
    #[serde(default)]
    pub patches: Vec<PatchRecord>,
}

impl Default for RecordFile {
    fn default() -> Self {
        Self {
            version: RECORD_FILE_VERSION,
            patches: Vec::new(),
        }
    }
}

impl RecordFile {
    pub fn read_from(path: &Path) -> Result<Self, RecordDbError> {
        let text = fs::read_to_string(path).map_err(|source| RecordDbError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn write_to(&self, path: &Path) -> Result<(), RecordDbError> {
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| RecordDbError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Record a patched run
    pub fn push(&mut self, address: u64, original: &[u8], patched: &[u8]) {
        self.patches.push(PatchRecord {
            address,
            original: hex::encode_upper(original),
            patched: hex::encode_upper(patched),
            file_offset: None,
        });
    }

    /// Expand every record into single patched bytes, sorted by address
    pub fn expand(&self, layout: Option<&ImageLayout>) -> Result<Vec<RawPatchedByte>, RecordDbError> {
        let mut bytes = Vec::new();
        for record in &self.patches {
            let invalid = |reason: String| RecordDbError::Record {
                address: record.address,
                reason,
            };
            let original = hex::decode(&record.original).map_err(|e| invalid(e.to_string()))?;
            let patched = hex::decode(&record.patched).map_err(|e| invalid(e.to_string()))?;
            if original.len() != patched.len() {
                return Err(invalid(format!(
                    "{} original vs {} patched bytes",
                    original.len(),
                    patched.len()
                )));
            }

            for (i, (o, p)) in original.iter().zip(&patched).enumerate() {
                let address = record
                    .address
                    .checked_add(i as u64)
                    .ok_or_else(|| invalid("run wraps the address space".into()))?;
                let file_offset = match (record.file_offset, layout) {
                    (Some(off), _) if off < 0 => off,
                    (Some(off), _) => off
                        .checked_add(i as i64)
                        .ok_or_else(|| invalid("file offset overflows".into()))?,
                    (None, Some(layout)) => layout.file_offset(address),
                    // Flat image: only addresses representable as an offset
                    (None, None) => i64::try_from(address).unwrap_or(INVALID_FILE_OFFSET),
                };
                bytes.push(RawPatchedByte {
                    address,
                    file_offset,
                    original: *o,
                    patched: *p,
                });
            }
        }
        // Stable: overlapping runs stay in file order for duplicate detection
        bytes.sort_by_key(|b| b.address);
        Ok(bytes)
    }
}

/// Static patch source reading a [`RecordFile`] from disk
pub struct RecordDb {
    path: PathBuf,
    layout: Option<ImageLayout>,
}

impl RecordDb {
    pub fn new(path: impl Into<PathBuf>, layout: Option<ImageLayout>) -> Self {
        Self {
            path: path.into(),
            layout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn layout(&self) -> Option<&ImageLayout> {
        self.layout.as_ref()
    }
}

impl StaticPatchSource for RecordDb {
    fn visit_patched_bytes(
        &self,
        start: u64,
        end: u64,
        visitor: &mut dyn FnMut(&RawPatchedByte),
    ) -> Result<i32, String> {
        let file = RecordFile::read_from(&self.path).map_err(|e| e.to_string())?;
        if file.version != RECORD_FILE_VERSION {
            log::warn!(
                "Patch record file {} has version {} (expected {})",
                self.path.display(),
                file.version,
                RECORD_FILE_VERSION
            );
            return Ok(VISIT_BAD_VERSION);
        }

        let bytes = file.expand(self.layout.as_ref()).map_err(|e| e.to_string())?;
        for byte in bytes.iter().filter(|b| b.address >= start && b.address < end) {
            visitor(byte);
        }
        Ok(VISIT_OK)
    }
}
