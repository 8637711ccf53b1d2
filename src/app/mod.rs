//! App module - session context, settings and commands
//!
//! Shared by the one-shot subcommands and the REPL.

pub mod commands;
pub mod context;
pub mod settings;

pub use commands::{parse_address, parse_command, CommandTable, Invocation, ParsedCommand};
pub use context::{Session, SessionConfig};
pub use settings::{Settings, SettingsError};
