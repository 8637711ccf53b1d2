//! Scanner - enumerates the static patch database into byte edits.

use thiserror::Error;

use super::ByteEdit;
use crate::debug::{RawPatchedByte, StaticPatchSource, VISIT_OK};

/// Static patch enumeration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ScanError {
    #[error("visit_patched_bytes() returned unexpected result: error code ({0})")]
    Status(i32),

    #[error("Patch database unavailable: {0}")]
    Source(String),
}

/// Result of one scan of the static database
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScanOutcome {
    /// Accepted edits, in ascending address order
    pub edits: Vec<ByteEdit>,
    /// Edits dropped for an invalid file offset
    pub skipped: usize,
    /// Repeated reports of the previous address
    pub duplicates: usize,
}

impl ScanOutcome {
    pub fn total_bytes(&self) -> usize {
        self.edits.len()
    }

    fn accept(&mut self, raw: &RawPatchedByte) {
        if !raw.has_file_offset() {
            self.skipped += 1;
            log::debug!(
                "fpos invalid ({}) at {:#x} -- patch skipped",
                raw.file_offset,
                raw.address
            );
            return;
        }

        if self.edits.last().map(|e| e.address) == Some(raw.address) {
            self.duplicates += 1;
            log::warn!(
                "Same address encountered while visiting patches: {:#x}",
                raw.address
            );
            return;
        }

        self.edits.push(ByteEdit {
            address: raw.address,
            original_byte: raw.original,
            patched_byte: raw.patched,
        });
    }
}

/// Enumerate every statically patched byte of the image.
///
/// Skipped edits never become the "previous address", so an invalid
/// entry between two valid neighbours splits their run.
///
/// The visited range is `[0, u64::MAX)`: a byte at `u64::MAX` is never
/// reported.
pub fn scan_static_patches(source: &dyn StaticPatchSource) -> Result<ScanOutcome, ScanError> {
    let mut outcome = ScanOutcome::default();

    let code = source
        .visit_patched_bytes(0, u64::MAX, &mut |raw: &RawPatchedByte| outcome.accept(raw))
        .map_err(ScanError::Source)?;
    if code != VISIT_OK {
        return Err(ScanError::Status(code));
    }

    if outcome.skipped > 0 || outcome.duplicates > 0 {
        log::info!(
            "Scanned {} patched bytes ({} skipped, {} duplicate)",
            outcome.total_bytes(),
            outcome.skipped,
            outcome.duplicates
        );
    }
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::sim::SimPatchDb;
    use crate::debug::INVALID_FILE_OFFSET;

    fn raw(address: u64, file_offset: i64) -> RawPatchedByte {
        RawPatchedByte {
            address,
            file_offset,
            original: 0xCC,
            patched: 0x90,
        }
    }

    #[test]
    fn test_sentinel_is_skipped_and_counted() {
        let db = SimPatchDb::new();
        db.push_raw(raw(10, 10));
        db.push_raw(raw(11, INVALID_FILE_OFFSET));
        db.push_raw(raw(12, 12));

        let outcome = scan_static_patches(&db).unwrap();
        let addrs: Vec<u64> = outcome.edits.iter().map(|e| e.address).collect();
        assert_eq!(addrs, vec![10, 12]);
        assert_eq!(outcome.skipped, 1);
        assert_eq!(outcome.duplicates, 0);
    }

    #[test]
    fn test_duplicate_address_counted_once() {
        let db = SimPatchDb::new();
        db.push_raw(raw(10, 10));
        db.push_raw(raw(10, 10));
        db.push_raw(raw(11, 11));

        let outcome = scan_static_patches(&db).unwrap();
        assert_eq!(outcome.total_bytes(), 2);
        assert_eq!(outcome.duplicates, 1);
    }

    #[test]
    fn test_bad_status_is_error() {
        let db = SimPatchDb::new();
        db.patch(0x10, &[1], &[2]);
        db.set_status(Ok(-3));
        assert_eq!(scan_static_patches(&db), Err(ScanError::Status(-3)));

        db.set_status(Err("gone".into()));
        assert_eq!(
            scan_static_patches(&db),
            Err(ScanError::Source("gone".into()))
        );
    }

    #[test]
    fn test_empty_database() {
        let db = SimPatchDb::new();
        let outcome = scan_static_patches(&db).unwrap();
        assert!(outcome.edits.is_empty());
    }

    #[test]
    fn test_top_byte_not_visited() {
        let db = SimPatchDb::new();
        db.push_raw(raw(u64::MAX - 1, 0x10));
        db.push_raw(raw(u64::MAX, 0x11));

        let outcome = scan_static_patches(&db).unwrap();
        let addrs: Vec<u64> = outcome.edits.iter().map(|e| e.address).collect();
        assert_eq!(addrs, vec![u64::MAX - 1]);
    }
}
