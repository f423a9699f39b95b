//! Contract with the method-interception backend.
//!
//! The coordinator never rewrites code itself. It hands targets and slot
//! handles to an [`Interceptor`] and only relies on the four operations
//! below plus an optional debug-log switch.

pub mod memory;

use std::any::Any;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::error::InterceptError;
use crate::types::{MethodRef, SlotKind};

pub use memory::{AppliedRedirect, MemoryInterceptor};

/// Replacement logic bound into one slot.
///
/// The payload is opaque to the coordinator; a backend downcasts it to the
/// callable type it knows how to invoke. Handles compare equal when they
/// share the same payload allocation.
#[derive(Clone)]
pub struct SlotHandle {
    name: Arc<str>,
    logic: Arc<dyn Any + Send + Sync>,
}

impl SlotHandle {
    pub fn new<T: Any + Send + Sync>(name: impl Into<String>, logic: T) -> Self {
        Self {
            name: Arc::from(name.into()),
            logic: Arc::new(logic),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the payload if it has type `T`.
    pub fn logic<T: Any>(&self) -> Option<&T> {
        self.logic.downcast_ref::<T>()
    }
}

impl PartialEq for SlotHandle {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.logic, &other.logic)
    }
}

impl Eq for SlotHandle {}

impl fmt::Debug for SlotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SlotHandle").field(&self.name).finish()
    }
}

/// Up to one handle per [`SlotKind`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SlotSet {
    pub before: Option<SlotHandle>,
    pub after: Option<SlotHandle>,
    pub rewrite: Option<SlotHandle>,
    pub on_exception: Option<SlotHandle>,
}

impl SlotSet {
    pub fn get(&self, kind: SlotKind) -> Option<&SlotHandle> {
        match kind {
            SlotKind::Before => self.before.as_ref(),
            SlotKind::After => self.after.as_ref(),
            SlotKind::Rewrite => self.rewrite.as_ref(),
            SlotKind::OnException => self.on_exception.as_ref(),
        }
    }

    pub fn set(&mut self, kind: SlotKind, handle: SlotHandle) {
        let slot = match kind {
            SlotKind::Before => &mut self.before,
            SlotKind::After => &mut self.after,
            SlotKind::Rewrite => &mut self.rewrite,
            SlotKind::OnException => &mut self.on_exception,
        };
        *slot = Some(handle);
    }

    pub fn with(mut self, kind: SlotKind, handle: SlotHandle) -> Self {
        self.set(kind, handle);
        self
    }

    /// Filled slots in [`SlotKind::ALL`] order.
    pub fn iter(&self) -> impl Iterator<Item = (SlotKind, &SlotHandle)> {
        SlotKind::ALL
            .into_iter()
            .filter_map(move |kind| self.get(kind).map(|handle| (kind, handle)))
    }

    pub fn is_empty(&self) -> bool {
        self.iter().next().is_none()
    }
}

/// One installed redirect on a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RedirectEntry {
    /// Identity that installed the redirect.
    pub owner: String,
    pub slot: SlotHandle,
}

/// Every redirect currently installed on one target, grouped by slot kind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RedirectInfo {
    pub before: Vec<RedirectEntry>,
    pub after: Vec<RedirectEntry>,
    pub rewrite: Vec<RedirectEntry>,
    pub on_exception: Vec<RedirectEntry>,
}

impl RedirectInfo {
    pub fn entries(&self, kind: SlotKind) -> &[RedirectEntry] {
        match kind {
            SlotKind::Before => &self.before,
            SlotKind::After => &self.after,
            SlotKind::Rewrite => &self.rewrite,
            SlotKind::OnException => &self.on_exception,
        }
    }

    pub fn entries_mut(&mut self, kind: SlotKind) -> &mut Vec<RedirectEntry> {
        match kind {
            SlotKind::Before => &mut self.before,
            SlotKind::After => &mut self.after,
            SlotKind::Rewrite => &mut self.rewrite,
            SlotKind::OnException => &mut self.on_exception,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (SlotKind, &RedirectEntry)> {
        SlotKind::ALL.into_iter().flat_map(move |kind| {
            self.entries(kind)
                .iter()
                .map(move |entry| (kind, entry))
        })
    }

    /// Number of redirects installed by `owner`.
    pub fn count_owned_by(&self, owner: &str) -> usize {
        self.iter().filter(|(_, entry)| entry.owner == owner).count()
    }

    pub fn is_empty(&self) -> bool {
        SlotKind::ALL
            .into_iter()
            .all(|kind| self.entries(kind).is_empty())
    }
}

/// Operations consumed from the interception library.
///
/// Implementors must be callable from blocking worker threads; the
/// coordinator invokes `apply_redirect` and the enumeration calls from
/// `spawn_blocking` tasks.
pub trait Interceptor: Send + Sync + 'static {
    /// Installs every filled slot of `slots` on `target`, owned by `owner`.
    fn apply_redirect(
        &self,
        owner: &str,
        target: &MethodRef,
        slots: &SlotSet,
    ) -> Result<(), InterceptError>;

    /// Removes every redirect installed by `owner`, on any target.
    fn remove_all_redirects(&self, owner: &str);

    /// Every target that currently carries at least one redirect.
    ///
    /// May fail with [`InterceptError::CollectionModified`] when redirects are
    /// added or removed concurrently.
    fn list_redirected_methods(&self) -> Result<Vec<MethodRef>, InterceptError>;

    /// Redirects installed on `method`.
    fn list_redirects_for(&self, method: &MethodRef) -> Result<RedirectInfo, InterceptError>;

    /// Switches the backend's own debug logging.
    fn set_debug_logging(&self, _enabled: bool, _log_file: Option<&Path>) {}
}
