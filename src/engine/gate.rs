//! Process Lifecycle Gate
//!
//! Drives `Detached -> Starting -> SuspendedForPatch -> Running` on every
//! process start. Whatever the applicator does, the target is resumed
//! exactly once per start; a failed suspend means the process runs
//! unpatched.

use super::applicator::{ApplyError, ApplyReport, Applicator};
use crate::debug::{LiveTarget, ProcessStart};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GateState {
    #[default]
    Detached,
    Starting,
    SuspendedForPatch,
    Running,
}

/// What happened during one gated start
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateOutcome {
    /// Address the patches were applied at
    pub patch_point: u64,
    /// Did the suspend succeed?
    pub suspended: bool,
    /// Applicator result; `None` when it was never invoked
    pub result: Option<Result<ApplyReport, ApplyError>>,
}

impl GateOutcome {
    pub fn regions_applied(&self) -> usize {
        match &self.result {
            Some(Ok(report)) => report.regions_applied,
            _ => 0,
        }
    }

    pub fn bytes_written(&self) -> usize {
        match &self.result {
            Some(Ok(report)) => report.bytes_written,
            _ => 0,
        }
    }
}

pub struct LifecycleGate {
    state: GateState,
    applicator: Applicator,
    /// Configured patch point; the entry address when unset
    primary_patch_address: Option<u64>,
    starts: usize,
}

impl LifecycleGate {
    pub fn new(applicator: Applicator) -> Self {
        Self {
            state: GateState::Detached,
            applicator,
            primary_patch_address: None,
            starts: 0,
        }
    }

    pub fn set_primary_patch_address(&mut self, address: Option<u64>) {
        self.primary_patch_address = address;
    }

    pub fn state(&self) -> GateState {
        self.state
    }

    pub fn applicator(&self) -> &Applicator {
        &self.applicator
    }

    /// Number of process starts handled so far
    pub fn starts(&self) -> usize {
        self.starts
    }

    /// Handle the host's "process start" notification
    pub fn on_process_start(
        &mut self,
        event: &ProcessStart,
        target: &mut dyn LiveTarget,
    ) -> GateOutcome {
        self.starts += 1;
        self.state = GateState::Starting;
        let patch_point = self.primary_patch_address.unwrap_or(event.entry_address);
        log::info!(
            "Process start hook snagged (pid={} tid={} image={} base={:#x} size={:#x}) -- applying patches at {:#x}...",
            event.pid,
            event.thread_id,
            event.image_name,
            event.base,
            event.size,
            patch_point
        );

        let (suspended, result) = self.patch_suspended(target);
        GateOutcome {
            patch_point,
            suspended,
            result,
        }
    }

    /// Apply the cached patches to an already running process
    pub fn apply_now(&mut self, target: &mut dyn LiveTarget) -> Option<Result<ApplyReport, ApplyError>> {
        if !target.is_debugger_attached() {
            log::warn!("Cannot apply patch - debugger is not currently on!");
            return Some(Err(ApplyError::DebuggerNotAttached));
        }
        let (_, result) = self.patch_suspended(target);
        result
    }

    pub fn on_process_exit(&mut self) {
        log::debug!("Process exited, gate detached");
        self.state = GateState::Detached;
    }

    fn patch_suspended(
        &mut self,
        target: &mut dyn LiveTarget,
    ) -> (bool, Option<Result<ApplyReport, ApplyError>>) {
        if !target.suspend_target() {
            log::error!("Could not apply patches, could not suspend process!");
            self.resume(target);
            return (false, None);
        }

        self.state = GateState::SuspendedForPatch;
        let result = self.applicator.apply_all(target);
        self.resume(target);
        (true, Some(result))
    }

    fn resume(&mut self, target: &mut dyn LiveTarget) {
        target.resume_target();
        self.state = GateState::Running;
    }
}
