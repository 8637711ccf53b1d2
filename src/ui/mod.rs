//! UI module - Command Line Interface
//!
//! Provides the reedline-based REPL and colored report printing.

pub mod cli;
