//! Common types shared between the engine and debugger hosts.

use std::sync::atomic::{AtomicBool, Ordering};

use super::DebugStatus;

/// File offset reported for addresses that have no backing file bytes.
pub const INVALID_FILE_OFFSET: i64 = -1;

/// One statically patched byte as reported by the patch database
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawPatchedByte {
    /// Virtual address in the static image
    pub address: u64,
    /// Offset in the backing file, or [`INVALID_FILE_OFFSET`]
    pub file_offset: i64,
    /// Byte value before patching
    pub original: u8,
    /// Byte value after patching
    pub patched: u8,
}

impl RawPatchedByte {
    pub fn has_file_offset(&self) -> bool {
        self.file_offset != INVALID_FILE_OFFSET
    }
}

/// "Process has started" notification delivered by the host debugger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessStart {
    /// Process ID
    pub pid: u32,
    /// Thread that reported the start
    pub thread_id: u32,
    /// Entry point of the started image
    pub entry_address: u64,
    /// Image name (executable path or module name)
    pub image_name: String,
    /// Load base of the image
    pub base: u64,
    /// Mapped size of the image
    pub size: u64,
}

/// Debug session status flags shared with background threads.
///
/// Hosts whose live handle is tied to one thread (ptrace) publish their
/// state here so the poller can read it without touching the handle.
#[derive(Debug, Default)]
pub struct SessionFlags {
    attached: AtomicBool,
    busy: AtomicBool,
}

impl SessionFlags {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_attached(&self, attached: bool) {
        self.attached.store(attached, Ordering::SeqCst);
        if !attached {
            self.busy.store(false, Ordering::SeqCst);
        }
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::SeqCst);
    }
}

impl DebugStatus for SessionFlags {
    fn is_debugger_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }

    fn is_debugger_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }
}
