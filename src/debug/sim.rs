//! Simulated host - in-memory debuggee and patch database.
//!
//! Used by the test suite and by embedders that want to drive the engine
//! without a real debugger.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use super::types::{RawPatchedByte, SessionFlags};
use super::{DebugStatus, LiveTarget, StaticPatchSource, VISIT_OK};

/// Hook invoked after every successful simulated write
pub type WriteHook = Box<dyn FnMut(u64, u8) + Send + Sync>;

/// In-memory debuggee
pub struct SimTarget {
    /// Live process memory
    memory: BTreeMap<u64, u8>,
    /// Host-side cached view of memory, stale until invalidated
    view_cache: HashMap<u64, u8>,
    /// Addresses whose writes always fail
    failing: HashSet<u64>,
    /// Make `suspend_target` fail
    suspend_fails: bool,
    flags: Arc<SessionFlags>,
    write_hook: Option<WriteHook>,
    suspend_calls: usize,
    resume_calls: usize,
    write_calls: usize,
}

impl SimTarget {
    /// A running, attached target with empty memory
    pub fn new() -> Self {
        let flags = Arc::new(SessionFlags::new());
        flags.set_attached(true);
        flags.set_busy(true);
        Self {
            memory: BTreeMap::new(),
            view_cache: HashMap::new(),
            failing: HashSet::new(),
            suspend_fails: false,
            flags,
            write_hook: None,
            suspend_calls: 0,
            resume_calls: 0,
            write_calls: 0,
        }
    }

    /// A target with no debugger attached
    pub fn detached() -> Self {
        let target = Self::new();
        target.flags.set_attached(false);
        target
    }

    /// Load `bytes` at `address`
    pub fn with_memory(mut self, address: u64, bytes: &[u8]) -> Self {
        for (i, b) in bytes.iter().enumerate() {
            self.memory.insert(address + i as u64, *b);
        }
        self
    }

    pub fn fail_writes_at(mut self, address: u64) -> Self {
        self.failing.insert(address);
        self
    }

    pub fn fail_suspend(mut self) -> Self {
        self.suspend_fails = true;
        self
    }

    pub fn on_write(mut self, hook: WriteHook) -> Self {
        self.write_hook = Some(hook);
        self
    }

    /// Shared status flags, as handed to the poller
    pub fn flags(&self) -> Arc<SessionFlags> {
        Arc::clone(&self.flags)
    }

    /// Read live memory directly
    pub fn peek(&self, address: u64) -> Option<u8> {
        self.memory.get(&address).copied()
    }

    pub fn peek_range(&self, address: u64, len: usize) -> Vec<Option<u8>> {
        (0..len as u64).map(|i| self.peek(address + i)).collect()
    }

    /// Read through the host's memory view cache
    pub fn read_view(&mut self, address: u64) -> Option<u8> {
        if let Some(b) = self.view_cache.get(&address) {
            return Some(*b);
        }
        let b = self.peek(address)?;
        self.view_cache.insert(address, b);
        Some(b)
    }

    /// Snapshot of the whole memory image
    pub fn memory(&self) -> &BTreeMap<u64, u8> {
        &self.memory
    }

    pub fn suspend_calls(&self) -> usize {
        self.suspend_calls
    }

    pub fn resume_calls(&self) -> usize {
        self.resume_calls
    }

    pub fn write_calls(&self) -> usize {
        self.write_calls
    }
}

impl Default for SimTarget {
    fn default() -> Self {
        Self::new()
    }
}

impl DebugStatus for SimTarget {
    fn is_debugger_attached(&self) -> bool {
        self.flags.is_debugger_attached()
    }

    fn is_debugger_busy(&self) -> bool {
        self.flags.is_debugger_busy()
    }
}

impl LiveTarget for SimTarget {
    fn suspend_target(&mut self) -> bool {
        self.suspend_calls += 1;
        if self.suspend_fails || !self.is_debugger_attached() {
            return false;
        }
        self.flags.set_busy(false);
        true
    }

    fn resume_target(&mut self) {
        self.resume_calls += 1;
        if self.is_debugger_attached() {
            self.flags.set_busy(true);
        }
    }

    fn write_byte(&mut self, address: u64, value: u8) -> usize {
        self.write_calls += 1;
        if self.failing.contains(&address) {
            return 0;
        }
        self.memory.insert(address, value);
        if let Some(hook) = self.write_hook.as_mut() {
            hook(address, value);
        }
        1
    }

    fn invalidate_memory_cache(&mut self, address: u64, length: usize) {
        for i in 0..length as u64 {
            self.view_cache.remove(&(address + i));
        }
    }
}

/// In-memory static patch database
pub struct SimPatchDb {
    records: Mutex<Vec<RawPatchedByte>>,
    status: Mutex<Result<i32, String>>,
}

impl SimPatchDb {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            status: Mutex::new(Ok(VISIT_OK)),
        }
    }

    /// Record a patch of `original` -> `patched` starting at `address`
    pub fn patch(&self, address: u64, original: &[u8], patched: &[u8]) {
        let mut records = self.records.lock().unwrap_or_else(|e| e.into_inner());
        for (i, (o, p)) in original.iter().zip(patched).enumerate() {
            let address = address + i as u64;
            records.push(RawPatchedByte {
                address,
                file_offset: address as i64,
                original: *o,
                patched: *p,
            });
        }
        records.sort_by_key(|r| r.address);
    }

    /// Push a raw record as-is, without re-sorting
    pub fn push_raw(&self, record: RawPatchedByte) {
        self.records
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(record);
    }

    pub fn clear(&self) {
        self.records.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }

    /// Make subsequent visits return `status`
    pub fn set_status(&self, status: Result<i32, String>) {
        *self.status.lock().unwrap_or_else(|e| e.into_inner()) = status;
    }
}

impl Default for SimPatchDb {
    fn default() -> Self {
        Self::new()
    }
}

impl StaticPatchSource for SimPatchDb {
    fn visit_patched_bytes(
        &self,
        start: u64,
        end: u64,
        visitor: &mut dyn FnMut(&RawPatchedByte),
    ) -> Result<i32, String> {
        let status = self.status.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let code = status?;
        if code != VISIT_OK {
            return Ok(code);
        }
        let records = self.records.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for record in records.iter().filter(|r| r.address >= start && r.address < end) {
            visitor(record);
        }
        Ok(VISIT_OK)
    }
}
