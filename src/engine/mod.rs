//! Engine module - moves cached patches into live processes.
//!
//! - [`poller`]: background refresh of the patch cache
//! - [`applicator`]: writes a snapshot into a suspended target
//! - [`gate`]: process start state machine around the applicator

pub mod applicator;
pub mod gate;
pub mod poller;

pub use applicator::{ApplyError, ApplyReport, Applicator, RegionShortfall};
pub use gate::{GateOutcome, GateState, LifecycleGate};
pub use poller::{poll_once, PollOutcome, Poller, PollerConfig, PollerHandle, SkipReason};
