//! Patch module - byte edits, consolidated regions and the snapshot cache.
//!
//! Pipeline: static database -> [`scanner`] -> [`consolidate`] -> [`cache`].

pub mod cache;
pub mod consolidate;
pub mod groups;
pub mod scanner;

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use cache::PatchCache;
pub use consolidate::consolidate;
pub use scanner::{scan_static_patches, ScanError, ScanOutcome};

/// A single patched byte, as read from the static database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteEdit {
    pub address: u64,
    pub original_byte: u8,
    pub patched_byte: u8,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RegionError {
    #[error("Empty patch region at {0:#x}")]
    Empty(u64),

    #[error("Length mismatch at {address:#x}: {original} original vs {patched} patched bytes")]
    LengthMismatch {
        address: u64,
        original: usize,
        patched: usize,
    },

    #[error("Patch region at {address:#x} with {len} bytes wraps the address space")]
    Overflow { address: u64, len: usize },
}

/// A maximal contiguous run of patched bytes.
///
/// Fields are private: a region is checked once on construction and never
/// changes afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawRegion", into = "RawRegion")]
pub struct PatchRegion {
    start_address: u64,
    original_bytes: Vec<u8>,
    patched_bytes: Vec<u8>,
}

impl PatchRegion {
    pub fn new(
        start_address: u64,
        original_bytes: Vec<u8>,
        patched_bytes: Vec<u8>,
    ) -> Result<Self, RegionError> {
        if original_bytes.len() != patched_bytes.len() {
            return Err(RegionError::LengthMismatch {
                address: start_address,
                original: original_bytes.len(),
                patched: patched_bytes.len(),
            });
        }
        if patched_bytes.is_empty() {
            return Err(RegionError::Empty(start_address));
        }
        if start_address
            .checked_add(patched_bytes.len() as u64 - 1)
            .is_none()
        {
            return Err(RegionError::Overflow {
                address: start_address,
                len: patched_bytes.len(),
            });
        }
        Ok(Self {
            start_address,
            original_bytes,
            patched_bytes,
        })
    }

    pub fn start_address(&self) -> u64 {
        self.start_address
    }

    /// One past the last patched address, saturating at the top of memory
    pub fn end_address(&self) -> u64 {
        self.start_address
            .saturating_add(self.patched_bytes.len() as u64)
    }

    pub fn len(&self) -> usize {
        self.patched_bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patched_bytes.is_empty()
    }

    pub fn original_bytes(&self) -> &[u8] {
        &self.original_bytes
    }

    pub fn patched_bytes(&self) -> &[u8] {
        &self.patched_bytes
    }

    /// `(address, patched byte)` pairs in address order
    pub fn patched_iter(&self) -> impl Iterator<Item = (u64, u8)> + '_ {
        self.patched_bytes
            .iter()
            .enumerate()
            .map(move |(i, b)| (self.start_address + i as u64, *b))
    }
}

impl fmt::Display for PatchRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:#x} [{} bytes] {} -> {}",
            self.start_address,
            self.len(),
            hex::encode_upper(&self.original_bytes),
            hex::encode_upper(&self.patched_bytes)
        )
    }
}

/// On-disk form of a region: byte runs as hex strings
#[derive(Serialize, Deserialize)]
struct RawRegion {
    address: u64,
    original: String,
    patched: String,
}

impl TryFrom<RawRegion> for PatchRegion {
    type Error = String;

    fn try_from(raw: RawRegion) -> Result<Self, Self::Error> {
        let original = hex::decode(&raw.original).map_err(|e| e.to_string())?;
        let patched = hex::decode(&raw.patched).map_err(|e| e.to_string())?;
        PatchRegion::new(raw.address, original, patched).map_err(|e| e.to_string())
    }
}

impl From<PatchRegion> for RawRegion {
    fn from(region: PatchRegion) -> Self {
        Self {
            address: region.start_address,
            original: hex::encode_upper(&region.original_bytes),
            patched: hex::encode_upper(&region.patched_bytes),
        }
    }
}

/// Immutable point-in-time view of every known patch region
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchSnapshot {
    regions: Arc<[PatchRegion]>,
}

impl PatchSnapshot {
    pub fn new(regions: Vec<PatchRegion>) -> Self {
        Self {
            regions: regions.into(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn regions(&self) -> &[PatchRegion] {
        &self.regions
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }

    /// Total number of patched bytes across all regions
    pub fn total_bytes(&self) -> usize {
        self.regions.iter().map(PatchRegion::len).sum()
    }

    /// Do both snapshots share the same region storage?
    pub fn same_as(&self, other: &PatchSnapshot) -> bool {
        Arc::ptr_eq(&self.regions, &other.regions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_region_rejects_mismatch() {
        let err = PatchRegion::new(0x10, vec![1, 2], vec![3]).unwrap_err();
        assert_eq!(
            err,
            RegionError::LengthMismatch {
                address: 0x10,
                original: 2,
                patched: 1
            }
        );
        assert_eq!(
            PatchRegion::new(0x10, vec![], vec![]).unwrap_err(),
            RegionError::Empty(0x10)
        );
    }

    #[test]
    fn test_region_rejects_wraparound() {
        assert!(PatchRegion::new(u64::MAX, vec![1], vec![2]).is_ok());
        assert!(PatchRegion::new(u64::MAX, vec![1, 2], vec![3, 4]).is_err());
    }

    #[test]
    fn test_region_display() {
        let region = PatchRegion::new(0x1000, vec![0xAA, 0xBB], vec![0x11, 0x22]).unwrap();
        assert_eq!(region.to_string(), "0x1000 [2 bytes] AABB -> 1122");
        assert_eq!(region.end_address(), 0x1002);
    }

    #[test]
    fn test_region_json_uses_hex() {
        let region = PatchRegion::new(16, vec![0xAA], vec![0x90]).unwrap();
        let json = serde_json::to_string(&region).unwrap();
        assert_eq!(json, r#"{"address":16,"original":"AA","patched":"90"}"#);

        let back: PatchRegion = serde_json::from_str(&json).unwrap();
        assert_eq!(back, region);

        let bad = r#"{"address":16,"original":"AA","patched":""}"#;
        assert!(serde_json::from_str::<PatchRegion>(bad).is_err());
    }

    #[test]
    fn test_snapshot_clone_shares_storage() {
        let snap = PatchSnapshot::new(vec![PatchRegion::new(1, vec![0], vec![1]).unwrap()]);
        let copy = snap.clone();
        assert!(snap.same_as(&copy));
        assert_eq!(copy.total_bytes(), 1);
    }
}
