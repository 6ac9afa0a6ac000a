//! Core functionality for folder access, document sessions, file operations, and configuration

pub mod config;
pub mod document;
pub mod file_system;
pub mod grants;
pub mod watcher;
