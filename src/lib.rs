//! Autopatch - reapplies statically recorded byte patches to debugged processes.
//!
//! A background poller keeps a snapshot of every patched byte region of the
//! program image; on each process start the lifecycle gate suspends the
//! debuggee, writes the snapshot into it and resumes it.

pub mod app;
pub mod db;
pub mod debug;
pub mod engine;
pub mod patch;
pub mod ui;
