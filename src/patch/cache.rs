//! Patch Cache - the shared, wholesale-replaced snapshot of patch regions.
//!
//! Two locks, never nested:
//! - `snapshot` guards the current [`PatchSnapshot`] handle and is held only
//!   for a clone or a swap,
//! - `refresh` is the writer token. The poller takes it with `try_lock` and
//!   holds it across a scan; the applicator takes it for one apply pass, so
//!   a refresh never overlaps an in-flight apply.

use std::sync::{Mutex, MutexGuard, TryLockError};

use super::PatchSnapshot;

/// Held by the poller while it rebuilds the snapshot
pub struct RefreshGuard<'a> {
    _token: MutexGuard<'a, ()>,
}

/// Held by the applicator for the duration of one pass
pub struct ApplyGuard<'a> {
    _token: MutexGuard<'a, ()>,
}

#[derive(Debug, Default)]
pub struct PatchCache {
    snapshot: Mutex<PatchSnapshot>,
    refresh: Mutex<()>,
}

impl PatchCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current snapshot. Later writes do not affect the returned value.
    pub fn read(&self) -> PatchSnapshot {
        // A poisoned lock still holds a complete snapshot
        self.snapshot
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the snapshot wholesale, returning the previous one
    pub fn write(&self, snapshot: PatchSnapshot) -> PatchSnapshot {
        let mut current = self.snapshot.lock().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, snapshot)
    }

    /// Non-blocking attempt to become the refresher
    pub fn try_begin_refresh(&self) -> Option<RefreshGuard<'_>> {
        match self.refresh.try_lock() {
            Ok(token) => Some(RefreshGuard { _token: token }),
            Err(TryLockError::Poisoned(e)) => Some(RefreshGuard {
                _token: e.into_inner(),
            }),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    /// Block until no refresh is in flight, then hold off new ones
    pub fn begin_apply(&self) -> ApplyGuard<'_> {
        let token = self.refresh.lock().unwrap_or_else(|e| e.into_inner());
        ApplyGuard { _token: token }
    }
}
