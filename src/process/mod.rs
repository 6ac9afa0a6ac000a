//! Subprocess execution for external command-line tools

pub mod runner;

pub use runner::{CommandRunner, ProcessRunner};
