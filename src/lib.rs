//! Folio - local document persistence and versioning
//!
//! Reads and writes user documents in folders outside the application's own
//! storage, keeps open documents in sync with disk, and records version
//! history through an external version-control tool.

pub mod app;
pub mod core;
pub mod error;
pub mod process;
pub mod versioning;

pub use app::Workspace;
pub use error::{FolioError, Result};
