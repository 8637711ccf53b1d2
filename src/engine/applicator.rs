//! Patch Applicator - writes cached patch regions into a suspended debuggee.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use thiserror::Error;

use crate::debug::LiveTarget;
use crate::patch::groups::PatchGroup;
use crate::patch::{PatchCache, PatchRegion};

/// Reasons an apply pass did nothing
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyError {
    #[error("patching currently disabled")]
    Disabled,

    #[error("debugger is not currently on")]
    DebuggerNotAttached,

    #[error("target is running, not suspended")]
    NotSuspended,
}

/// A region that was not fully written
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionShortfall {
    pub start_address: u64,
    pub expected: usize,
    pub written: usize,
}

/// Totals for one apply pass
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyReport {
    /// Regions with at least one byte written
    pub regions_applied: usize,
    pub bytes_written: usize,
    pub shortfalls: Vec<RegionShortfall>,
}

impl ApplyReport {
    pub fn is_complete(&self) -> bool {
        self.shortfalls.is_empty()
    }
}

pub struct Applicator {
    cache: Arc<PatchCache>,
    enabled: AtomicBool,
}

impl Applicator {
    pub fn new(cache: Arc<PatchCache>, enabled: bool) -> Self {
        Self {
            cache,
            enabled: AtomicBool::new(enabled),
        }
    }

    pub fn cache(&self) -> &Arc<PatchCache> {
        &self.cache
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }

    /// Write every region of the current snapshot into `target`.
    ///
    /// The snapshot is read once; regions cached after that are left for
    /// the next pass. The target is never resumed here.
    pub fn apply_all(&self, target: &mut dyn LiveTarget) -> Result<ApplyReport, ApplyError> {
        self.check_preconditions(target)?;

        let _apply = self.cache.begin_apply();
        let snapshot = self.cache.read();
        if snapshot.is_empty() {
            log::info!("No patched bytes currently in database, nothing to do!");
            return Ok(ApplyReport::default());
        }

        let report = apply_regions(target, snapshot.regions());
        log::info!(
            "[{}] total patches applied / [{}] total bytes modified!",
            report.regions_applied,
            report.bytes_written
        );
        Ok(report)
    }

    /// Write the regions of one patch group into `target`
    pub fn apply_group(
        &self,
        target: &mut dyn LiveTarget,
        name: &str,
        group: &PatchGroup,
    ) -> Result<ApplyReport, ApplyError> {
        self.check_preconditions(target)?;
        if !group.enabled {
            log::info!("Patch group [{}] is disabled, nothing to do!", name);
            return Ok(ApplyReport::default());
        }

        let report = apply_regions(target, &group.regions);
        log::info!(
            "Group [{}]: [{}] patches applied / [{}] bytes modified",
            name,
            report.regions_applied,
            report.bytes_written
        );
        Ok(report)
    }

    fn check_preconditions(&self, target: &dyn LiveTarget) -> Result<(), ApplyError> {
        if !self.is_enabled() {
            log::info!("Not applying patches to current process - patching currently disabled.");
            return Err(ApplyError::Disabled);
        }
        if !target.is_debugger_attached() {
            log::warn!("Cannot apply patch - debugger is not currently on!");
            return Err(ApplyError::DebuggerNotAttached);
        }
        if target.is_debugger_busy() {
            log::error!("Cannot apply patch - target is not suspended!");
            return Err(ApplyError::NotSuspended);
        }
        Ok(())
    }
}

fn apply_regions(target: &mut dyn LiveTarget, regions: &[PatchRegion]) -> ApplyReport {
    let mut report = ApplyReport::default();

    for region in regions {
        let written = apply_region(target, region);
        if written > 0 {
            report.regions_applied += 1;
            target.invalidate_memory_cache(region.start_address(), region.len());
        }
        report.bytes_written += written;

        if written < region.len() {
            log::warn!(
                "Patch at {:#x} partially applied; details: {} of {} bytes written",
                region.start_address(),
                written,
                region.len()
            );
            report.shortfalls.push(RegionShortfall {
                start_address: region.start_address(),
                expected: region.len(),
                written,
            });
        }
    }

    report
}

fn apply_region(target: &mut dyn LiveTarget, region: &PatchRegion) -> usize {
    let mut written = 0;
    for (address, value) in region.patched_iter() {
        match target.write_byte(address, value) {
            0 => log::error!(
                "Error encountered while applying byte patch to memory!; details: write failed at {:#x}",
                address
            ),
            n => written += n.min(1),
        }
    }
    written
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug::sim::SimTarget;
    use crate::patch::PatchSnapshot;

    fn cache_with(regions: Vec<PatchRegion>) -> Arc<PatchCache> {
        let cache = Arc::new(PatchCache::new());
        cache.write(PatchSnapshot::new(regions));
        cache
    }

    fn region(start: u64, patched: &[u8]) -> PatchRegion {
        PatchRegion::new(start, vec![0; patched.len()], patched.to_vec()).unwrap()
    }

    fn suspended() -> SimTarget {
        let mut target = SimTarget::new();
        assert!(target.suspend_target());
        target
    }

    #[test]
    fn test_writes_every_region() {
        let applicator = Applicator::new(
            cache_with(vec![region(0x10, &[1, 2]), region(0x40, &[3])]),
            true,
        );
        let mut target = suspended();

        let report = applicator.apply_all(&mut target).unwrap();
        assert_eq!(report.regions_applied, 2);
        assert_eq!(report.bytes_written, 3);
        assert!(report.is_complete());
        assert_eq!(target.peek_range(0x10, 2), vec![Some(1), Some(2)]);
        assert_eq!(target.peek(0x40), Some(3));
    }

    #[test]
    fn test_partial_failure_continues() {
        let applicator = Applicator::new(cache_with(vec![region(0x10, &[1, 2, 3])]), true);
        let mut target = SimTarget::new().fail_writes_at(0x11);
        target.suspend_target();

        let report = applicator.apply_all(&mut target).unwrap();
        assert_eq!(report.bytes_written, 2);
        assert_eq!(
            report.shortfalls,
            vec![RegionShortfall {
                start_address: 0x10,
                expected: 3,
                written: 2
            }]
        );
        assert_eq!(target.peek(0x12), Some(3));
    }

    #[test]
    fn test_invalidates_host_view() {
        let applicator = Applicator::new(cache_with(vec![region(0x10, &[0x90])]), true);
        let mut target = SimTarget::new().with_memory(0x10, &[0xCC]);
        assert_eq!(target.read_view(0x10), Some(0xCC));
        target.suspend_target();

        applicator.apply_all(&mut target).unwrap();
        assert_eq!(target.read_view(0x10), Some(0x90));
    }

    #[test]
    fn test_invalidates_whole_region_after_partial_write() {
        let applicator = Applicator::new(cache_with(vec![region(0x10, &[7, 8, 9])]), true);
        let mut target = SimTarget::new()
            .with_memory(0x10, &[1, 2, 3])
            .fail_writes_at(0x11);
        // Bytes written after the failed one must not stay stale
        assert_eq!(target.read_view(0x12), Some(3));
        target.suspend_target();

        let report = applicator.apply_all(&mut target).unwrap();
        assert_eq!(report.bytes_written, 2);
        assert_eq!(target.read_view(0x10), Some(7));
        assert_eq!(target.read_view(0x11), Some(2));
        assert_eq!(target.read_view(0x12), Some(9));
    }

    #[test]
    fn test_rejections() {
        let applicator = Applicator::new(cache_with(vec![region(0x10, &[1])]), false);
        let mut target = suspended();
        assert_eq!(applicator.apply_all(&mut target), Err(ApplyError::Disabled));

        applicator.set_enabled(true);
        let mut detached = SimTarget::detached();
        assert_eq!(
            applicator.apply_all(&mut detached),
            Err(ApplyError::DebuggerNotAttached)
        );

        let mut running = SimTarget::new();
        assert_eq!(
            applicator.apply_all(&mut running),
            Err(ApplyError::NotSuspended)
        );
        assert_eq!(running.write_calls() + detached.write_calls(), 0);
        // The applicator never resumes on its own
        assert_eq!(target.resume_calls(), 0);
    }

    #[test]
    fn test_empty_cache() {
        let applicator = Applicator::new(Arc::new(PatchCache::new()), true);
        let mut target = suspended();
        assert_eq!(applicator.apply_all(&mut target), Ok(ApplyReport::default()));
    }

    #[test]
    fn test_apply_group() {
        let applicator = Applicator::new(Arc::new(PatchCache::new()), true);
        let mut group = PatchGroup::new(true);
        group.regions.push(region(0x80, &[7, 8]));
        let mut target = suspended();

        let report = applicator.apply_group(&mut target, "g", &group).unwrap();
        assert_eq!(report.bytes_written, 2);

        group.enabled = false;
        let report = applicator.apply_group(&mut target, "g", &group).unwrap();
        assert_eq!(report, ApplyReport::default());
    }
}
