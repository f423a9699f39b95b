//! Runtime configuration loading.
//!
//! Everything is optional; a missing `patchwarden.toml` yields defaults.
//!
//! ```toml
//! [coordinator]
//! ready_poll_ms = 20
//! ordering_poll_ms = 1
//! debug_patch_id = "patchwarden.interception-log"
//! auto_enable_persistent = true
//!
//! [collector]
//! rescan_interval_secs = 10
//! periodic_interval_secs = 60
//!
//! [storage]
//! root = "/var/lib/patchwarden"
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::builtin::INTERCEPTION_LOG_PATCH_ID;
use crate::error::{PatchError, Result};
use crate::storage::StoragePaths;

#[derive(Debug, Clone, Deserialize, Default)]
pub struct PatchwardenConfig {
    #[serde(default)]
    pub coordinator: CoordinatorConfig,
    #[serde(default)]
    pub collector: CollectorConfig,
    #[serde(default)]
    pub storage: StorageSection,
}

impl PatchwardenConfig {
    /// Storage paths, honouring `[storage] root` over the environment.
    pub fn storage_paths(&self) -> Result<StoragePaths> {
        match &self.storage.root {
            Some(root) => Ok(StoragePaths::with_root(root.clone())),
            None => StoragePaths::resolve(),
        }
    }

    /// Coordinator section with the interception log defaulting under the storage root.
    pub fn coordinator_config(&self) -> Result<CoordinatorConfig> {
        let mut coordinator = self.coordinator.clone();
        if coordinator.interception_log_file.is_none() {
            coordinator.interception_log_file = Some(self.storage_paths()?.interception_log_file());
        }
        Ok(coordinator)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Cadence of the readiness poll during activation.
    pub ready_poll_ms: u64,
    /// Cadence of the wait for the debug-logging patch.
    pub ordering_poll_ms: u64,
    /// Identity that must finish activating before any other patch.
    pub debug_patch_id: String,
    /// Replay persisted-active identities at startup.
    pub auto_enable_persistent: bool,
    /// Where the interception backend writes its debug log.
    pub interception_log_file: Option<PathBuf>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            ready_poll_ms: 20,
            ordering_poll_ms: 1,
            debug_patch_id: INTERCEPTION_LOG_PATCH_ID.to_string(),
            auto_enable_persistent: true,
            interception_log_file: None,
        }
    }
}

impl CoordinatorConfig {
    pub fn ready_poll(&self) -> Duration {
        Duration::from_millis(self.ready_poll_ms.max(1))
    }

    pub fn ordering_poll(&self) -> Duration {
        Duration::from_millis(self.ordering_poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CollectorConfig {
    /// Delay before retrying a scan that hit a concurrent modification.
    pub rescan_interval_secs: u64,
    /// Optional cadence for periodic rescans after bootstrap.
    pub periodic_interval_secs: Option<u64>,
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            rescan_interval_secs: 10,
            periodic_interval_secs: None,
        }
    }
}

impl CollectorConfig {
    pub fn rescan_interval(&self) -> Duration {
        Duration::from_secs(self.rescan_interval_secs)
    }

    pub fn periodic_interval(&self) -> Option<Duration> {
        self.periodic_interval_secs
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct StorageSection {
    #[serde(default)]
    pub root: Option<PathBuf>,
}

/// Loads configuration from `path`, or from the default location.
pub fn load_config(path: Option<PathBuf>) -> Result<PatchwardenConfig> {
    let config_path = match path {
        Some(path) => path,
        None => StoragePaths::resolve()?.config_file(),
    };

    if !config_path.exists() {
        return Ok(PatchwardenConfig::default());
    }

    let content =
        fs_err::read_to_string(&config_path).map_err(|source| PatchError::ConfigRead {
            path: config_path.clone(),
            source,
        })?;
    toml::from_str::<PatchwardenConfig>(&content).map_err(|err| PatchError::ConfigMalformed {
        path: config_path,
        details: err.to_string(),
    })
}
