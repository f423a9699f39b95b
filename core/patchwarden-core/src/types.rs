//! Shared DTOs for patch bookkeeping.
//! Prefer additive changes; hosts render these in their own UI.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Reference to a method in the host process that can be intercepted.
///
/// Two references are the same target when both the declaring type and the
/// method name match.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodRef {
    pub declaring_type: String,
    pub name: String,
}

impl MethodRef {
    pub fn new(declaring_type: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            declaring_type: declaring_type.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MethodRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.declaring_type, self.name)
    }
}

/// The four replacement-logic roles a unit can fill for a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotKind {
    /// Runs before the original body; may skip it.
    Before,
    /// Runs after the original body.
    After,
    /// Replaces the original body.
    Rewrite,
    /// Runs when the original body raised.
    OnException,
}

impl SlotKind {
    pub const ALL: [SlotKind; 4] = [
        SlotKind::Before,
        SlotKind::After,
        SlotKind::Rewrite,
        SlotKind::OnException,
    ];
}

impl fmt::Display for SlotKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SlotKind::Before => write!(f, "before"),
            SlotKind::After => write!(f, "after"),
            SlotKind::Rewrite => write!(f, "rewrite"),
            SlotKind::OnException => write!(f, "on-exception"),
        }
    }
}

/// Result of an enable request once its activation has settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnableOutcome {
    /// Every target was attempted and the identity is now active.
    Enabled,
    /// The identity was already active; nothing was applied.
    AlreadyActive,
    /// Another activation for this identity is in flight.
    AlreadyActivating,
    /// `on_will_enable` returned false.
    Vetoed,
    /// No registration exists for the identity.
    Unknown,
    /// A disable arrived before activation finished; partial redirects were removed.
    Cancelled,
    /// A unit failed as a whole; partial redirects were removed.
    Failed,
}

/// Result of a disable request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisableOutcome {
    /// Redirects were removed and the identity is now inactive.
    Disabled,
    /// Only an in-flight activation was cancelled.
    Cancelled,
    /// The identity was already inactive.
    AlreadyInactive,
    /// No registration exists for the identity.
    Unknown,
}

/// How a registration is driven.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PatchKind {
    /// Units applied by the coordinator.
    Provider,
    /// Redirects owned by some other mechanism, tracked by an adapter.
    Managed,
}

/// Snapshot of one registration for display.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PatchSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
    pub kind: PatchKind,
    pub active: bool,
    pub waiting: bool,
    pub persistent: bool,
    pub persisted_active: bool,
    #[serde(default)]
    pub file_path: Option<PathBuf>,
}
