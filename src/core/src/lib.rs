//! Firebox Core - shared error and configuration types.
//!
//! Used by the conversion pipeline, the launch orchestrator and the CLI.

pub mod config;
pub mod error;

// Re-export commonly used types
pub use config::{parse_size_bytes, BuildConfig, EphemeralStorage, LaunchConfig};
pub use error::{BoxError, Result};

/// Firebox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
