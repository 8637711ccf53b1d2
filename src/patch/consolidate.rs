//! Consolidator - merges single-byte edits into contiguous regions.

use super::{ByteEdit, PatchRegion};

/// Run buffers for the region being built
#[derive(Default)]
struct Run {
    start: u64,
    original: Vec<u8>,
    patched: Vec<u8>,
}

impl Run {
    fn flush(&mut self, regions: &mut Vec<PatchRegion>) {
        if self.patched.is_empty() {
            return;
        }
        let original = std::mem::take(&mut self.original);
        let patched = std::mem::take(&mut self.patched);
        match PatchRegion::new(self.start, original, patched) {
            Ok(region) => regions.push(region),
            Err(e) => log::error!("Dropping patch run: {}", e),
        }
    }
}

/// Merge address-ordered edits into maximal contiguous regions.
///
/// Input must already be in ascending address order; this is one linear
/// pass with no sorting.
pub fn consolidate(edits: &[ByteEdit]) -> Vec<PatchRegion> {
    let mut regions = Vec::new();
    let mut run = Run::default();
    let mut last: Option<u64> = None;

    for edit in edits {
        let contiguous = matches!(last, Some(prev) if prev.checked_add(1) == Some(edit.address));
        if !contiguous {
            run.flush(&mut regions);
            run.start = edit.address;
        }
        run.original.push(edit.original_byte);
        run.patched.push(edit.patched_byte);
        last = Some(edit.address);
    }
    run.flush(&mut regions);

    regions
}

#[cfg(test)]
mod tests {
    use super::*;

    fn edits(addrs: &[u64]) -> Vec<ByteEdit> {
        addrs
            .iter()
            .map(|&address| ByteEdit {
                address,
                original_byte: (address & 0xFF) as u8,
                patched_byte: !((address & 0xFF) as u8),
            })
            .collect()
    }

    #[test]
    fn test_empty_input() {
        assert!(consolidate(&[]).is_empty());
    }

    #[test]
    fn test_contiguous_run_is_one_region() {
        let input = edits(&[0x400, 0x401, 0x402, 0x403, 0x404]);
        let regions = consolidate(&input);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_address(), 0x400);
        assert_eq!(regions[0].len(), 5);
        assert_eq!(regions[0].original_bytes(), &[0x00, 0x01, 0x02, 0x03, 0x04]);
        assert_eq!(regions[0].patched_bytes(), &[0xFF, 0xFE, 0xFD, 0xFC, 0xFB]);
    }

    #[test]
    fn test_gap_splits_runs() {
        let regions = consolidate(&edits(&[10, 11, 12, 50, 51]));
        let shape: Vec<(u64, usize)> = regions
            .iter()
            .map(|r| (r.start_address(), r.len()))
            .collect();
        assert_eq!(shape, vec![(10, 3), (50, 2)]);
    }

    #[test]
    fn test_single_bytes_stay_separate() {
        let regions = consolidate(&edits(&[1, 3, 5]));
        assert_eq!(regions.len(), 3);
        assert!(regions.iter().all(|r| r.len() == 1));
    }

    #[test]
    fn test_address_zero_starts_a_run() {
        let regions = consolidate(&edits(&[0, 1]));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].start_address(), 0);
        assert_eq!(regions[0].len(), 2);
    }

    #[test]
    fn test_top_of_address_space() {
        let regions = consolidate(&edits(&[u64::MAX - 1, u64::MAX]));
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].len(), 2);
    }
}
