//! Meshplane Common Library
//!
//! Shared types, persistence, and key handling for the meshplane control plane.

pub mod crypto;
pub mod db;
pub mod error;
pub mod types;

// Re-export commonly used types
pub use crypto::{hash_api_key, mint_api_key, sha256_hex, MintedKey};
pub use db::Database;
pub use error::{Error, Result};
pub use types::*;

/// Meshplane version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default store path
pub fn default_store_path() -> std::path::PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join(".meshplane")
}

/// Default config file path
pub fn default_config_path() -> std::path::PathBuf {
    default_store_path().join("config.toml")
}

/// Home directory helper
mod dirs {
    pub fn home_dir() -> Option<std::path::PathBuf> {
        std::env::var_os("HOME").map(std::path::PathBuf::from)
    }
}
