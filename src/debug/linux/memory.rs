//! Memory - tracee memory access through `/proc/<pid>/mem`
//!
//! Reads go through a page cache so repeated inspection of the same area
//! does not hit procfs; writes bypass it, and callers invalidate the
//! written range afterwards.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};

use thiserror::Error;

const PAGE_SIZE: u64 = 0x1000;

/// Memory operation errors
#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to read memory at {address:#x}: {reason}")]
    ReadFailed { address: u64, reason: String },

    #[error("Failed to write memory at {address:#x}: {reason}")]
    WriteFailed { address: u64, reason: String },
}

/// Memory manager for reading/writing tracee memory
pub struct MemoryManager {
    target_pid: u32,
    /// Cached page contents, keyed by page base address
    pages: HashMap<u64, Vec<u8>>,
}

impl MemoryManager {
    pub fn new(pid: u32) -> Self {
        Self {
            target_pid: pid,
            pages: HashMap::new(),
        }
    }

    fn mem_path(&self) -> String {
        format!("/proc/{}/mem", self.target_pid)
    }

    /// Read memory, served from the page cache when possible
    pub fn read(&mut self, address: u64, size: usize) -> Result<Vec<u8>, MemoryError> {
        let mut out = Vec::with_capacity(size);
        let mut cursor = address;
        let end = address.saturating_add(size as u64);

        while cursor < end {
            let page = cursor & !(PAGE_SIZE - 1);
            let bytes = self.cached_page(page)?;
            let from = (cursor - page) as usize;
            let to = ((end - page).min(PAGE_SIZE)) as usize;
            if from >= bytes.len() {
                return Err(MemoryError::ReadFailed {
                    address: cursor,
                    reason: "short read".into(),
                });
            }
            let to = to.min(bytes.len());
            out.extend_from_slice(&bytes[from..to]);
            cursor = page + to as u64;
        }

        Ok(out)
    }

    fn cached_page(&mut self, page: u64) -> Result<&Vec<u8>, MemoryError> {
        if !self.pages.contains_key(&page) {
            let mut buffer = vec![0u8; PAGE_SIZE as usize];
            let n = self.read_uncached(page, &mut buffer)?;
            buffer.truncate(n);
            self.pages.insert(page, buffer);
        }
        self.pages.get(&page).ok_or(MemoryError::ReadFailed {
            address: page,
            reason: "page cache miss".into(),
        })
    }

    fn read_uncached(&self, address: u64, buffer: &mut [u8]) -> Result<usize, MemoryError> {
        let fail = |e: std::io::Error| MemoryError::ReadFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = File::open(self.mem_path()).map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;
        file.read(buffer).map_err(fail)
    }

    /// Write memory to the tracee. Does not touch the page cache.
    pub fn write(&self, address: u64, data: &[u8]) -> Result<usize, MemoryError> {
        let fail = |e: std::io::Error| MemoryError::WriteFailed {
            address,
            reason: e.to_string(),
        };

        let mut file = OpenOptions::new()
            .write(true)
            .open(self.mem_path())
            .map_err(fail)?;
        file.seek(SeekFrom::Start(address)).map_err(fail)?;
        file.write(data).map_err(fail)
    }

    /// Drop cached pages overlapping `[address, address + length)`
    pub fn invalidate(&mut self, address: u64, length: usize) {
        if length == 0 {
            return;
        }
        let first = address & !(PAGE_SIZE - 1);
        let last = address.saturating_add(length as u64 - 1) & !(PAGE_SIZE - 1);
        self.pages.retain(|&page, _| page < first || page > last);
    }

    /// Drop every cached page
    pub fn clear(&mut self) {
        self.pages.clear();
    }

    pub fn cached_pages(&self) -> usize {
        self.pages.len()
    }
}
