//! Warden Core - Shared functionality for the warden gateway crates
//!
//! Paths, server configuration and small formatting helpers used by the
//! daemon, the shim and the CLI.

pub mod config;
pub mod format;
pub mod paths;

pub use config::ServerConfig;
pub use paths::Paths;
