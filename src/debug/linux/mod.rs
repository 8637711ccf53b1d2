//! Linux host - runs a program under ptrace and exposes it as a [`LiveTarget`].
//!
//! The tracee is spawned with `PTRACE_TRACEME`. Its first exec stop and
//! every later `PTRACE_EVENT_EXEC` are reported as process starts; the
//! tracee stays stopped until the caller resumes it. Static addresses are
//! rebased for position independent images using `/proc/<pid>/maps`.

pub mod memory;

use std::fs;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::Arc;

use nix::sys::ptrace::{self, Event, Options};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::Pid;
use thiserror::Error;

use self::memory::MemoryManager;
use super::types::{ProcessStart, SessionFlags};
use super::{DebugStatus, LiveTarget};
use crate::db::ImageLayout;

#[derive(Error, Debug)]
pub enum TargetError {
    #[error("Failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("ptrace error: {0}")]
    Ptrace(#[from] nix::Error),

    #[error("Target already exited")]
    Exited,
}

/// What the tracee did since the last call to [`PtraceTarget::wait_event`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetEvent {
    /// A new image was exec'd; the tracee is stopped
    Started(ProcessStart),
    /// Normal exit with status code
    Exited(i32),
    /// Killed by a signal
    Signaled(Signal),
}

/// Where the main image sits in the tracee's address space
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct ImageMapping {
    base: u64,
    size: u64,
}

pub struct PtraceTarget {
    pid: Pid,
    program: String,
    memory: MemoryManager,
    flags: Arc<SessionFlags>,
    /// Tracee is in a ptrace stop
    stopped: bool,
    /// Seen the initial exec stop
    exec_seen: bool,
    alive: bool,
    /// Signals caught while waiting for a suspend, in arrival order
    pending_signals: Vec<Signal>,
    /// Added to static addresses before touching memory
    load_bias: u64,
}

impl PtraceTarget {
    /// Spawn `program` stopped under ptrace. Call [`wait_event`](Self::wait_event)
    /// to receive its start.
    pub fn spawn(
        program: &Path,
        args: &[String],
        flags: Arc<SessionFlags>,
    ) -> Result<Self, TargetError> {
        let name = program.display().to_string();
        log::info!("Spawning {} {:?}", name, args);

        let mut command = Command::new(program);
        command.args(args);
        // SAFETY: traceme is async-signal-safe and touches no parent state
        unsafe {
            command.pre_exec(|| ptrace::traceme().map_err(std::io::Error::from));
        }
        let child = command.spawn().map_err(|source| TargetError::Spawn {
            program: name.clone(),
            source,
        })?;

        let pid = child.id();
        flags.set_attached(true);
        flags.set_busy(true);

        Ok(Self {
            pid: Pid::from_raw(pid as i32),
            program: name,
            memory: MemoryManager::new(pid),
            flags,
            stopped: false,
            exec_seen: false,
            alive: true,
            pending_signals: Vec::new(),
            load_bias: 0,
        })
    }

    pub fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    pub fn flags(&self) -> &Arc<SessionFlags> {
        &self.flags
    }

    pub fn load_bias(&self) -> u64 {
        self.load_bias
    }

    /// Run the tracee until the next start or exit, forwarding other signals
    pub fn wait_event(&mut self) -> Result<TargetEvent, TargetError> {
        if !self.alive {
            return Err(TargetError::Exited);
        }
        if self.stopped {
            self.resume_target();
        }

        loop {
            match waitpid(self.pid, None)? {
                WaitStatus::Stopped(_, Signal::SIGTRAP) if !self.exec_seen => {
                    self.exec_seen = true;
                    ptrace::setoptions(
                        self.pid,
                        Options::PTRACE_O_TRACEEXEC | Options::PTRACE_O_EXITKILL,
                    )?;
                    return Ok(TargetEvent::Started(self.on_stop_for_start()));
                }
                WaitStatus::PtraceEvent(_, _, event) if event == Event::PTRACE_EVENT_EXEC as i32 => {
                    return Ok(TargetEvent::Started(self.on_stop_for_start()));
                }
                WaitStatus::PtraceEvent(..) => {
                    ptrace::cont(self.pid, None)?;
                }
                WaitStatus::Stopped(_, signal) => {
                    log::trace!("Forwarding {} to pid {}", signal, self.pid);
                    ptrace::cont(self.pid, Some(signal))?;
                }
                WaitStatus::Exited(_, code) => {
                    self.on_gone();
                    log::info!("Process {} exited with code {}", self.pid, code);
                    return Ok(TargetEvent::Exited(code));
                }
                WaitStatus::Signaled(_, signal, _) => {
                    self.on_gone();
                    log::info!("Process {} killed by {}", self.pid, signal);
                    return Ok(TargetEvent::Signaled(signal));
                }
                _ => {}
            }
        }
    }

    /// Read tracee memory at a static address, through the page cache
    pub fn read_memory(&mut self, address: u64, size: usize) -> Option<Vec<u8>> {
        match self.memory.read(address.wrapping_add(self.load_bias), size) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                log::debug!("{}", e);
                None
            }
        }
    }

    fn on_stop_for_start(&mut self) -> ProcessStart {
        self.stopped = true;
        self.flags.set_busy(false);
        self.memory.clear();

        let exe = fs::read_link(format!("/proc/{}/exe", self.pid))
            .unwrap_or_else(|_| PathBuf::from(&self.program));
        let mapping = read_image_mapping(self.pid(), &exe).unwrap_or_default();
        let layout = match ImageLayout::from_file(&exe) {
            Ok(layout) => Some(layout),
            Err(e) => {
                log::warn!("Cannot parse {}: {}", exe.display(), e);
                None
            }
        };

        self.load_bias = match &layout {
            Some(layout) if layout.is_pie => mapping.base.wrapping_sub(layout.image_base),
            _ => 0,
        };
        if self.load_bias != 0 {
            log::debug!("PIE image, load bias {:#x}", self.load_bias);
        }

        ProcessStart {
            pid: self.pid(),
            thread_id: self.pid(),
            entry_address: layout
                .as_ref()
                .map(|l| l.entry_point.wrapping_add(self.load_bias))
                .unwrap_or(mapping.base),
            image_name: exe.display().to_string(),
            base: mapping.base,
            size: mapping.size,
        }
    }

    fn on_gone(&mut self) {
        self.alive = false;
        self.stopped = false;
        self.flags.set_attached(false);
    }
}

impl DebugStatus for PtraceTarget {
    fn is_debugger_attached(&self) -> bool {
        self.flags.is_debugger_attached()
    }

    fn is_debugger_busy(&self) -> bool {
        self.flags.is_debugger_busy()
    }
}

impl LiveTarget for PtraceTarget {
    fn suspend_target(&mut self) -> bool {
        if !self.alive {
            return false;
        }
        if self.stopped {
            return true;
        }

        if let Err(e) = kill(self.pid, Signal::SIGSTOP) {
            log::error!("Cannot stop pid {}: {}", self.pid, e);
            return false;
        }
        loop {
            match waitpid(self.pid, None) {
                Ok(WaitStatus::Stopped(_, Signal::SIGSTOP)) => break,
                Ok(WaitStatus::Stopped(_, signal)) => {
                    // Delivered on resume
                    self.pending_signals.push(signal);
                    let _ = ptrace::cont(self.pid, None);
                }
                Ok(WaitStatus::Exited(..)) | Ok(WaitStatus::Signaled(..)) => {
                    self.on_gone();
                    return false;
                }
                Ok(WaitStatus::PtraceEvent(..)) => {
                    let _ = ptrace::cont(self.pid, None);
                }
                Ok(_) => {}
                Err(e) => {
                    log::error!("waitpid failed for pid {}: {}", self.pid, e);
                    return false;
                }
            }
        }

        self.stopped = true;
        self.flags.set_busy(false);
        true
    }

    fn resume_target(&mut self) {
        if !self.alive || !self.stopped {
            return;
        }
        let (first, requeue) = split_pending(&mut self.pending_signals);
        match ptrace::cont(self.pid, first) {
            Ok(()) => {
                self.stopped = false;
                self.flags.set_busy(true);
                for signal in requeue {
                    if let Err(e) = kill(self.pid, signal) {
                        log::warn!("Cannot re-send {} to pid {}: {}", signal, self.pid, e);
                    }
                }
            }
            Err(e) => {
                log::error!("Cannot resume pid {}: {}", self.pid, e);
                self.pending_signals = first.into_iter().chain(requeue).collect();
            }
        }
    }

    fn write_byte(&mut self, address: u64, value: u8) -> usize {
        let live = address.wrapping_add(self.load_bias);
        match self.memory.write(live, &[value]) {
            Ok(n) => n,
            Err(e) => {
                log::debug!("{}", e);
                0
            }
        }
    }

    fn invalidate_memory_cache(&mut self, address: u64, length: usize) {
        self.memory.invalidate(address.wrapping_add(self.load_bias), length);
    }
}

impl Drop for PtraceTarget {
    fn drop(&mut self) {
        if self.alive {
            let _ = kill(self.pid, Signal::SIGKILL);
            let _ = waitpid(self.pid, None);
            self.on_gone();
        }
    }
}

/// First pending signal goes with the resume, the rest are re-sent
fn split_pending(pending: &mut Vec<Signal>) -> (Option<Signal>, Vec<Signal>) {
    if pending.is_empty() {
        return (None, Vec::new());
    }
    let rest = pending.split_off(1);
    (pending.pop(), rest)
}

/// Lowest start and highest end of the mappings backed by `exe`
fn read_image_mapping(pid: u32, exe: &Path) -> Option<ImageMapping> {
    let maps = fs::read_to_string(format!("/proc/{}/maps", pid)).ok()?;
    parse_image_mapping(&maps, &exe.to_string_lossy())
}

fn parse_image_mapping(maps: &str, exe: &str) -> Option<ImageMapping> {
    let mut range: Option<(u64, u64)> = None;

    for line in maps.lines() {
        let mut fields = line.split_whitespace();
        let Some(span) = fields.next() else { continue };
        // perms, offset, dev, inode, then the path
        if fields.nth(4) != Some(exe) {
            continue;
        }
        let Some((start, end)) = span.split_once('-') else { continue };
        let (Ok(start), Ok(end)) = (u64::from_str_radix(start, 16), u64::from_str_radix(end, 16)) else {
            continue;
        };
        range = Some(match range {
            Some((lo, hi)) => (lo.min(start), hi.max(end)),
            None => (start, end),
        });
    }

    range.map(|(base, end)| ImageMapping {
        base,
        size: end - base,
    })
}
