//! Debug module - Host debugger interfaces.
//!
//! The engine never talks to a debugger directly. Hosts implement:
//! - [`StaticPatchSource`]: the static "patched bytes" database
//! - [`DebugStatus`]: attach/busy queries, readable from any thread
//! - [`LiveTarget`]: suspend/resume and memory writes on the debuggee

pub mod sim;
pub mod types;

#[cfg(target_os = "linux")]
pub mod linux;

#[cfg(target_os = "linux")]
pub use linux::PtraceTarget as PlatformTarget;

pub use types::{ProcessStart, RawPatchedByte, SessionFlags, INVALID_FILE_OFFSET};

/// Status code returned by a patch visit that ran to completion
pub const VISIT_OK: i32 = 0;

/// Static patch database: every patched byte of the on-disk image.
pub trait StaticPatchSource: Send + Sync {
    /// Visit patched bytes in `[start, end)` in ascending address order.
    ///
    /// Returns the host status code; anything other than [`VISIT_OK`]
    /// means the enumeration did not complete.
    fn visit_patched_bytes(
        &self,
        start: u64,
        end: u64,
        visitor: &mut dyn FnMut(&RawPatchedByte),
    ) -> Result<i32, String>;
}

/// Debugger session state queries
pub trait DebugStatus: Send + Sync {
    /// Is a debugger attached to a live process?
    fn is_debugger_attached(&self) -> bool;

    /// Is the target executing (as opposed to suspended)?
    fn is_debugger_busy(&self) -> bool;
}

/// Live debuggee handle
pub trait LiveTarget: DebugStatus {
    /// Suspend the target. Returns false if it could not be suspended.
    fn suspend_target(&mut self) -> bool;

    /// Let the target continue
    fn resume_target(&mut self);

    /// Write one byte of debuggee memory, returning the number written
    fn write_byte(&mut self, address: u64, value: u8) -> usize;

    /// Drop any host-side cached view of `[address, address + length)`
    fn invalidate_memory_cache(&mut self, address: u64, length: usize);
}

impl<T: DebugStatus + ?Sized> DebugStatus for std::sync::Arc<T> {
    fn is_debugger_attached(&self) -> bool {
        (**self).is_debugger_attached()
    }

    fn is_debugger_busy(&self) -> bool {
        (**self).is_debugger_busy()
    }
}
