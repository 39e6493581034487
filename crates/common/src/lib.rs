//! ForensicVM Common Library
//!
//! Shared types, identity resolution and the error taxonomy used by the
//! ForensicVM console.

pub mod error;
pub mod identity;
pub mod types;

// Re-export commonly used types
pub use error::{Error, Result, TunnelStage};
pub use identity::resolve;
pub use types::*;

/// ForensicVM console version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".forensicvm")
}

/// Default console configuration path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.json")
}

/// Default SSH private key used for the tunnel sessions
pub fn default_key_path() -> std::path::PathBuf {
    default_store_path().join("mykey")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME")
            .or_else(|| std::env::var_os("USERPROFILE"))
            .map(std::path::PathBuf::from)
    }
}
