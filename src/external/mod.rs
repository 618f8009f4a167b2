//! External tool abstractions
//!
//! Trait-based wrappers around external processes, so callers can be tested
//! with mock implementations.

pub mod command;

pub use command::{run_blocking, CommandError, CommandResult, CommandRunner, ProcessCommandRunner};
