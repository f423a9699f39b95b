//! Error types for patchwarden operations.
//!
//! Patch failures never surface as errors from the coordinator; they are
//! contained and logged. These types cover the collaborator seams
//! (interception backend, settings, configuration).

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Interception Backend Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Failures reported by an [`Interceptor`](crate::interception::Interceptor) backend.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum InterceptError {
    /// The target cannot be intercepted by the underlying mechanism.
    #[error("Interception not supported for {target}: {reason}")]
    Unsupported { target: String, reason: String },

    /// Redirect bookkeeping changed while it was being enumerated.
    #[error("Redirect table was modified during enumeration")]
    CollectionModified,

    /// Any other failure while installing a redirect.
    #[error("Interception failed for {target}: {message}")]
    Failed { target: String, message: String },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Internal Error
// ═══════════════════════════════════════════════════════════════════════════════

/// All errors that can occur at patchwarden's collaborator boundaries.
#[derive(Debug, thiserror::Error)]
pub enum PatchError {
    // ─────────────────────────────────────────────────────────────────────
    // Runtime Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("No tokio runtime available to drive patch activation")]
    NoRuntime,

    // ─────────────────────────────────────────────────────────────────────
    // Settings Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Settings read failed: {path}: {source}")]
    SettingsRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings write failed: {path}: {source}")]
    SettingsWrite {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Settings file malformed: {path}: {details}")]
    SettingsMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Configuration Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("Configuration read failed: {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    #[error("Storage location unavailable: {0}")]
    StorageUnavailable(String),

    // ─────────────────────────────────────────────────────────────────────
    // I/O Errors
    // ─────────────────────────────────────────────────────────────────────
    #[error("I/O error: {context}: {source}")]
    Io {
        context: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {context}: {source}")]
    Json {
        context: String,
        #[source]
        source: serde_json::Error,
    },
}

/// Convenience type alias for Results using PatchError.
pub type Result<T> = std::result::Result<T, PatchError>;
