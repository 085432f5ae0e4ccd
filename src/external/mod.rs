//! External tool abstractions
//!
//! Trait-based abstraction over external command execution so quality gates
//! can be exercised with scripted outcomes in tests.

pub mod command;

pub use command::{CommandError, CommandExecutor, CommandOutput, ProcessCommandExecutor};
