//! In-process interception backend.
//!
//! Keeps the redirect table in memory without touching any code. Hosts use it
//! where no native backend is loaded; tests use its fault injection
//! (unsupported targets, failing targets, concurrent modification) to drive
//! the coordinator's containment paths.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use super::{Interceptor, RedirectEntry, RedirectInfo, SlotSet};
use crate::error::InterceptError;
use crate::types::MethodRef;

/// One successful `apply_redirect` call, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedRedirect {
    pub owner: String,
    pub target: MethodRef,
}

#[derive(Default)]
struct MemoryState {
    redirects: IndexMap<MethodRef, RedirectInfo>,
    unsupported: HashMap<MethodRef, String>,
    failing: HashMap<MethodRef, String>,
    panicking: HashSet<MethodRef>,
    pending_modifications: usize,
    history: Vec<AppliedRedirect>,
    debug_enabled: bool,
    debug_log_file: Option<PathBuf>,
}

enum Fault {
    None,
    Unsupported(String),
    Failed(String),
    Panic,
}

#[derive(Default)]
pub struct MemoryInterceptor {
    state: Mutex<MemoryState>,
}

impl MemoryInterceptor {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes every later `apply_redirect` on `target` fail as unsupported.
    pub fn mark_unsupported(&self, target: MethodRef, reason: impl Into<String>) {
        self.lock().unsupported.insert(target, reason.into());
    }

    /// Makes every later `apply_redirect` on `target` fail generically.
    pub fn fail_on(&self, target: MethodRef, message: impl Into<String>) {
        self.lock().failing.insert(target, message.into());
    }

    /// Makes every later `apply_redirect` on `target` panic.
    pub fn panic_on(&self, target: MethodRef) {
        self.lock().panicking.insert(target);
    }

    /// The next `passes` calls to `list_redirected_methods` report a
    /// concurrent modification.
    pub fn simulate_modification(&self, passes: usize) {
        self.lock().pending_modifications = passes;
    }

    pub fn history(&self) -> Vec<AppliedRedirect> {
        self.lock().history.clone()
    }

    /// Infallible view of the redirects on `target`.
    pub fn redirects(&self, target: &MethodRef) -> RedirectInfo {
        self.lock()
            .redirects
            .get(target)
            .cloned()
            .unwrap_or_default()
    }

    /// Total redirects installed by `owner` across all targets.
    pub fn count_owned_by(&self, owner: &str) -> usize {
        self.lock()
            .redirects
            .values()
            .map(|info| info.count_owned_by(owner))
            .sum()
    }

    pub fn debug_logging(&self) -> (bool, Option<PathBuf>) {
        let state = self.lock();
        (state.debug_enabled, state.debug_log_file.clone())
    }
}

impl Interceptor for MemoryInterceptor {
    fn apply_redirect(
        &self,
        owner: &str,
        target: &MethodRef,
        slots: &SlotSet,
    ) -> Result<(), InterceptError> {
        let fault = {
            let mut state = self.lock();
            let fault = if state.panicking.contains(target) {
                Fault::Panic
            } else if let Some(message) = state.failing.get(target) {
                Fault::Failed(message.clone())
            } else if let Some(reason) = state.unsupported.get(target) {
                Fault::Unsupported(reason.clone())
            } else {
                Fault::None
            };

            if matches!(fault, Fault::None) {
                let info = state.redirects.entry(target.clone()).or_default();
                for (kind, handle) in slots.iter() {
                    info.entries_mut(kind).push(RedirectEntry {
                        owner: owner.to_string(),
                        slot: handle.clone(),
                    });
                }
                state.history.push(AppliedRedirect {
                    owner: owner.to_string(),
                    target: target.clone(),
                });
            }
            fault
        };

        match fault {
            Fault::None => Ok(()),
            Fault::Unsupported(reason) => Err(InterceptError::Unsupported {
                target: target.to_string(),
                reason,
            }),
            Fault::Failed(message) => Err(InterceptError::Failed {
                target: target.to_string(),
                message,
            }),
            Fault::Panic => panic!("interception backend crashed while patching {target}"),
        }
    }

    fn remove_all_redirects(&self, owner: &str) {
        let mut state = self.lock();
        for info in state.redirects.values_mut() {
            info.before.retain(|entry| entry.owner != owner);
            info.after.retain(|entry| entry.owner != owner);
            info.rewrite.retain(|entry| entry.owner != owner);
            info.on_exception.retain(|entry| entry.owner != owner);
        }
        state.redirects.retain(|_, info| !info.is_empty());
    }

    fn list_redirected_methods(&self) -> Result<Vec<MethodRef>, InterceptError> {
        let mut state = self.lock();
        if state.pending_modifications > 0 {
            state.pending_modifications -= 1;
            return Err(InterceptError::CollectionModified);
        }
        Ok(state.redirects.keys().cloned().collect())
    }

    fn list_redirects_for(&self, method: &MethodRef) -> Result<RedirectInfo, InterceptError> {
        Ok(self.redirects(method))
    }

    fn set_debug_logging(&self, enabled: bool, log_file: Option<&Path>) {
        let mut state = self.lock();
        state.debug_enabled = enabled;
        state.debug_log_file = log_file.map(Path::to_path_buf);
    }
}
