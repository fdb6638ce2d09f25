//! Drydock migration CLI library
//!
//! Argument parsing and subcommand handlers for the `migrate` binary, kept
//! in a library so they can be tested without spawning a process.

pub mod cli;
pub mod commands;

pub use cli::{Cli, Commands};
