//! Persisted patch settings.
//!
//! Stores, per identity, whether the patch should be active on the next load,
//! plus the global debug-log flag. This store is the only input of the
//! startup replay.
//!
//! # File Format
//!
//! ```json
//! {
//!   "version": 1,
//!   "debug_log": false,
//!   "patches": {
//!     "scene-view.grid": { "active": true, "changed_at": "2026-01-01T00:00:00Z" }
//!   }
//! }
//! ```
//!
//! # Defensive Design
//!
//! - Missing or empty file: empty store
//! - Corrupt JSON or unknown version: empty store, logged
//! - Writes go through a temp file + rename so a crash never leaves a partial file

use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::{PatchError, Result};

const SETTINGS_VERSION: u32 = 1;

/// Persisted state of one identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchSetting {
    pub active: bool,
    pub changed_at: DateTime<Utc>,
}

/// Key-value persistence consulted by the coordinator.
pub trait SettingsStore: Send + Sync {
    /// Persisted flag for `id`, if one was ever written.
    fn persisted_state(&self, id: &str) -> Option<bool>;

    fn persisted_active(&self, id: &str) -> bool {
        self.persisted_state(id).unwrap_or(false)
    }

    fn set_persisted_active(&self, id: &str, active: bool) -> Result<()>;

    fn debug_log_enabled(&self) -> bool;

    fn set_debug_log_enabled(&self, enabled: bool) -> Result<()>;

    /// Removes every per-identity flag; `reset_all` also resets the debug flag.
    fn clear(&self, reset_all: bool) -> Result<()>;

    /// Every persisted identity, sorted by id.
    fn entries(&self) -> Vec<(String, PatchSetting)>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SettingsFile {
    version: u32,
    #[serde(default)]
    debug_log: bool,
    #[serde(default)]
    patches: BTreeMap<String, PatchSetting>,
}

impl Default for SettingsFile {
    fn default() -> Self {
        SettingsFile {
            version: SETTINGS_VERSION,
            debug_log: false,
            patches: BTreeMap::new(),
        }
    }
}

impl SettingsFile {
    fn set_active(&mut self, id: &str, active: bool) {
        self.patches.insert(
            id.to_string(),
            PatchSetting {
                active,
                changed_at: Utc::now(),
            },
        );
    }

    fn clear(&mut self, reset_all: bool) {
        self.patches.clear();
        if reset_all {
            self.debug_log = false;
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// In-memory store
// ═══════════════════════════════════════════════════════════════════════════════

/// Process-local store. Counts writes so callers can observe no-op transitions.
#[derive(Default)]
pub struct MemorySettings {
    data: Mutex<SettingsFile>,
    writes: AtomicUsize,
}

impl MemorySettings {
    pub fn new() -> Self {
        Self::default()
    }

    fn data(&self) -> MutexGuard<'_, SettingsFile> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of mutating calls so far.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }
}

impl SettingsStore for MemorySettings {
    fn persisted_state(&self, id: &str) -> Option<bool> {
        self.data().patches.get(id).map(|setting| setting.active)
    }

    fn set_persisted_active(&self, id: &str, active: bool) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data().set_active(id, active);
        Ok(())
    }

    fn debug_log_enabled(&self) -> bool {
        self.data().debug_log
    }

    fn set_debug_log_enabled(&self, enabled: bool) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data().debug_log = enabled;
        Ok(())
    }

    fn clear(&self, reset_all: bool) -> Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.data().clear(reset_all);
        Ok(())
    }

    fn entries(&self) -> Vec<(String, PatchSetting)> {
        self.data()
            .patches
            .iter()
            .map(|(id, setting)| (id.clone(), setting.clone()))
            .collect()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// File-backed store
// ═══════════════════════════════════════════════════════════════════════════════

/// JSON-file store; every mutation is written through.
pub struct FileSettings {
    path: PathBuf,
    data: Mutex<SettingsFile>,
}

impl FileSettings {
    /// Loads `path`, degrading to an empty store on missing or unusable content.
    pub fn load(path: &Path) -> Result<Self> {
        let data = if path.exists() {
            let content =
                fs_err::read_to_string(path).map_err(|source| PatchError::SettingsRead {
                    path: path.to_path_buf(),
                    source,
                })?;
            parse_settings(path, &content)
        } else {
            SettingsFile::default()
        };

        Ok(Self {
            path: path.to_path_buf(),
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn data(&self) -> MutexGuard<'_, SettingsFile> {
        self.data.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mutate(&self, apply: impl FnOnce(&mut SettingsFile)) -> Result<()> {
        let mut data = self.data();
        apply(&mut data);
        save_settings(&self.path, &data)
    }
}

fn parse_settings(path: &Path, content: &str) -> SettingsFile {
    if content.trim().is_empty() {
        tracing::warn!(path = %path.display(), "Empty settings file, using defaults");
        return SettingsFile::default();
    }

    match serde_json::from_str::<SettingsFile>(content) {
        Ok(file) if file.version == SETTINGS_VERSION => file,
        Ok(file) => {
            tracing::warn!(
                path = %path.display(),
                version = file.version,
                expected = SETTINGS_VERSION,
                "Unsupported settings version, using defaults"
            );
            SettingsFile::default()
        }
        Err(err) => {
            tracing::warn!(
                path = %path.display(),
                error = %err,
                "Failed to parse settings file, using defaults"
            );
            SettingsFile::default()
        }
    }
}

fn save_settings(path: &Path, data: &SettingsFile) -> Result<()> {
    let write_err = |source: std::io::Error| PatchError::SettingsWrite {
        path: path.to_path_buf(),
        source,
    };

    let content = serde_json::to_string_pretty(data).map_err(|source| PatchError::Json {
        context: "serialize settings".to_string(),
        source,
    })?;

    let parent = path.parent().ok_or_else(|| PatchError::SettingsMalformed {
        path: path.to_path_buf(),
        details: "settings path has no parent directory".to_string(),
    })?;
    fs_err::create_dir_all(parent).map_err(write_err)?;

    let mut temp_file = NamedTempFile::new_in(parent).map_err(write_err)?;
    temp_file.write_all(content.as_bytes()).map_err(write_err)?;
    temp_file.flush().map_err(write_err)?;
    temp_file.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

impl SettingsStore for FileSettings {
    fn persisted_state(&self, id: &str) -> Option<bool> {
        self.data().patches.get(id).map(|setting| setting.active)
    }

    fn set_persisted_active(&self, id: &str, active: bool) -> Result<()> {
        self.mutate(|data| data.set_active(id, active))
    }

    fn debug_log_enabled(&self) -> bool {
        self.data().debug_log
    }

    fn set_debug_log_enabled(&self, enabled: bool) -> Result<()> {
        self.mutate(|data| data.debug_log = enabled)
    }

    fn clear(&self, reset_all: bool) -> Result<()> {
        self.mutate(|data| data.clear(reset_all))
    }

    fn entries(&self) -> Vec<(String, PatchSetting)> {
        self.data()
            .patches
            .iter()
            .map(|(id, setting)| (id.clone(), setting.clone()))
            .collect()
    }
}
