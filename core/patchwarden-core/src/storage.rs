//! Storage path management for patchwarden.
//!
//! Production code uses `StoragePaths::resolve()` which honours
//! `PATCHWARDEN_HOME` and otherwise points to the platform config directory.
//! Tests use `StoragePaths::with_root(temp_dir)` for isolation.

use std::path::{Path, PathBuf};

use crate::error::{PatchError, Result};

/// Environment variable overriding the storage root.
pub const HOME_ENV: &str = "PATCHWARDEN_HOME";

#[derive(Debug, Clone)]
pub struct StoragePaths {
    root: PathBuf,
}

impl StoragePaths {
    /// Resolves the root from `PATCHWARDEN_HOME`, then the platform config dir.
    pub fn resolve() -> Result<Self> {
        if let Some(root) = std::env::var_os(HOME_ENV).filter(|value| !value.is_empty()) {
            return Ok(Self::with_root(PathBuf::from(root)));
        }
        dirs::config_dir()
            .map(|dir| Self::with_root(dir.join("patchwarden")))
            .ok_or_else(|| PatchError::StorageUnavailable("no config directory".to_string()))
    }

    pub fn with_root(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path to settings.json (persisted patch flags).
    pub fn settings_file(&self) -> PathBuf {
        self.root.join("settings.json")
    }

    /// Path to patchwarden.toml (optional configuration).
    pub fn config_file(&self) -> PathBuf {
        self.root.join("patchwarden.toml")
    }

    /// Path the interception backend writes its debug log to.
    pub fn interception_log_file(&self) -> PathBuf {
        self.root.join("logs").join("interception.log")
    }
}
