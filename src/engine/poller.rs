//! Background Poller - keeps the patch cache in sync with the static database.
//!
//! One named thread runs a cycle, then waits on a channel with
//! `recv_timeout(interval)`. A `Kill` message (or dropping every sender)
//! wakes the wait immediately and ends the thread.

use std::panic::{self, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::debug::{DebugStatus, StaticPatchSource};
use crate::patch::{consolidate, scan_static_patches, PatchCache, PatchSnapshot, ScanError};

/// Default wait between two poll cycles
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(700);

#[derive(Debug, Clone)]
pub struct PollerConfig {
    /// Thread name, used for logging
    pub name: String,
    pub interval: Duration,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            name: "PatchMonitoring".into(),
            interval: DEFAULT_POLL_INTERVAL,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// A live, possibly patched image is being debugged
    DebuggerActive,
    /// Another refresh or an apply pass holds the writer token
    Contended,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Skipped(SkipReason),
    Refreshed { regions: usize, bytes: usize },
    Failed(ScanError),
}

/// Run one poll cycle against `cache`
pub fn poll_once(
    cache: &PatchCache,
    source: &dyn StaticPatchSource,
    status: &dyn DebugStatus,
) -> PollOutcome {
    // Never harvest from a live image: it already carries the patches
    if status.is_debugger_attached() || status.is_debugger_busy() {
        return PollOutcome::Skipped(SkipReason::DebuggerActive);
    }

    let Some(_refresh) = cache.try_begin_refresh() else {
        return PollOutcome::Skipped(SkipReason::Contended);
    };

    let outcome = match scan_static_patches(source) {
        Ok(outcome) => outcome,
        Err(e) => {
            log::error!("Exception encountered while visiting patched bytes; details: {}", e);
            return PollOutcome::Failed(e);
        }
    };

    let snapshot = PatchSnapshot::new(consolidate(&outcome.edits));
    let (regions, bytes) = (snapshot.len(), snapshot.total_bytes());
    let previous = cache.write(snapshot);
    if previous.is_empty() && regions > 0 {
        log::info!("Byte patch buffer populated!");
    }
    log::trace!("Patch cache refreshed: {} regions, {} bytes", regions, bytes);

    PollOutcome::Refreshed { regions, bytes }
}

enum PollerSignal {
    Trigger,
    Kill,
}

/// Spawns the polling thread
pub struct Poller;

impl Poller {
    pub fn spawn(
        config: PollerConfig,
        cache: Arc<PatchCache>,
        source: Arc<dyn StaticPatchSource>,
        status: Arc<dyn DebugStatus>,
    ) -> std::io::Result<PollerHandle> {
        let (tx, rx) = mpsc::channel();
        let name = config.name.clone();
        let interval = config.interval;

        log::info!("Starting patch monitoring thread... [name={}]", name);
        let thread = thread::Builder::new().name(name.clone()).spawn(move || {
            loop {
                let cycle = panic::catch_unwind(AssertUnwindSafe(|| {
                    poll_once(&cache, source.as_ref(), status.as_ref())
                }));
                if cycle.is_err() {
                    log::error!("Unknown error while polling patched bytes [name={}]", config.name);
                }

                match rx.recv_timeout(interval) {
                    Ok(PollerSignal::Trigger) | Err(RecvTimeoutError::Timeout) => continue,
                    Ok(PollerSignal::Kill) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            log::info!("Thread killed! [name={}]", config.name);
        })?;

        Ok(PollerHandle {
            name,
            tx,
            thread: Some(thread),
        })
    }
}

/// Owner handle of a running poller. Dropping it kills the thread.
pub struct PollerHandle {
    name: String,
    tx: Sender<PollerSignal>,
    thread: Option<JoinHandle<()>>,
}

impl PollerHandle {
    /// Run a cycle now instead of waiting out the interval
    pub fn trigger(&self) {
        if self.thread.is_some() {
            let _ = self.tx.send(PollerSignal::Trigger);
        }
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Stop the thread and wait for it. Later calls do nothing.
    pub fn kill(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        log::info!("Killing thread... [name={}]", self.name);
        let _ = self.tx.send(PollerSignal::Kill);
        if thread.join().is_err() {
            log::error!("Poller thread panicked [name={}]", self.name);
        }
    }
}

impl Drop for PollerHandle {
    fn drop(&mut self) {
        self.kill();
    }
}
