//! Adapters for redirects that some other mechanism installed.
//!
//! The collector synthesizes one [`IndependentAdapter`] per foreign redirect
//! owner so those redirects can be listed, disabled and persisted exactly
//! like provider-based patches.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use indexmap::IndexMap;

use crate::interception::{Interceptor, SlotHandle, SlotSet};
use crate::types::{MethodRef, SlotKind};

/// Suffix on a redirect owner that marks it as driven by a registered
/// declaration. The collector never builds adapters for such owners.
pub const MANAGED_MARKER: &str = ".managed";

pub fn is_managed_owner(owner: &str) -> bool {
    owner.ends_with(MANAGED_MARKER)
}

/// A registration that installs and removes its own redirects.
pub trait ManagedPatch: Send + Sync {
    fn id(&self) -> &str;

    fn name(&self) -> &str {
        self.id()
    }

    fn is_active(&self) -> bool;

    fn enable(&self);

    fn disable(&self);
}

/// Redirects observed under one foreign owner identity.
pub struct IndependentAdapter {
    id: String,
    interceptor: Arc<dyn Interceptor>,
    observed: Mutex<IndexMap<MethodRef, Vec<(SlotKind, SlotHandle)>>>,
    installed: AtomicBool,
}

impl IndependentAdapter {
    pub fn new(id: impl Into<String>, interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            id: id.into(),
            interceptor,
            observed: Mutex::new(IndexMap::new()),
            installed: AtomicBool::new(true),
        }
    }

    fn observed(&self) -> MutexGuard<'_, IndexMap<MethodRef, Vec<(SlotKind, SlotHandle)>>> {
        self.observed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Records one observed redirect. Returns false if it was already known.
    ///
    /// Observing a redirect means it is installed right now.
    pub fn record(&self, method: MethodRef, kind: SlotKind, handle: SlotHandle) -> bool {
        self.installed.store(true, Ordering::SeqCst);
        let mut observed = self.observed();
        let slots = observed.entry(method).or_default();
        if slots.iter().any(|(k, h)| *k == kind && *h == handle) {
            return false;
        }
        slots.push((kind, handle));
        true
    }

    pub fn targets(&self) -> Vec<MethodRef> {
        self.observed().keys().cloned().collect()
    }

    /// Slot kinds currently redirecting `method` for this owner.
    pub fn slot_kinds(&self, method: &MethodRef) -> Vec<SlotKind> {
        self.observed()
            .get(method)
            .map(|slots| slots.iter().map(|(kind, _)| *kind).collect())
            .unwrap_or_default()
    }

    fn reinstall(&self) {
        let observed = self.observed().clone();
        for (method, slots) in observed {
            for (kind, handle) in slots {
                let set = SlotSet::default().with(kind, handle);
                if let Err(err) = self.interceptor.apply_redirect(&self.id, &method, &set) {
                    tracing::warn!(
                        id = %self.id,
                        target = %method,
                        slot = %kind,
                        error = %err,
                        "Failed to reinstall independent redirect"
                    );
                }
            }
        }
    }
}

impl ManagedPatch for IndependentAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn is_active(&self) -> bool {
        self.installed.load(Ordering::SeqCst)
    }

    /// No-op while the external redirects are installed; after a disable,
    /// the recorded slots are applied again under this identity.
    fn enable(&self) {
        if self.installed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.reinstall();
    }

    fn disable(&self) {
        self.interceptor.remove_all_redirects(&self.id);
        self.installed.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interception::MemoryInterceptor;

    fn setup() -> (Arc<MemoryInterceptor>, IndependentAdapter, MethodRef, SlotHandle) {
        let backend = Arc::new(MemoryInterceptor::new());
        let target = MethodRef::new("Hierarchy", "OnGUI");
        let handle = SlotHandle::new("prefix", ());
        backend
            .apply_redirect(
                "external",
                &target,
                &SlotSet::default().with(SlotKind::Before, handle.clone()),
            )
            .unwrap();
        let adapter = IndependentAdapter::new("external", backend.clone());
        adapter.record(target.clone(), SlotKind::Before, handle.clone());
        (backend, adapter, target, handle)
    }

    #[test]
    fn test_managed_marker() {
        assert!(is_managed_owner("grid.managed"));
        assert!(!is_managed_owner("grid"));
    }

    #[test]
    fn test_record_deduplicates() {
        let (_, adapter, target, handle) = setup();
        assert!(!adapter.record(target.clone(), SlotKind::Before, handle.clone()));
        assert!(adapter.record(target.clone(), SlotKind::After, handle));
        assert_eq!(
            adapter.slot_kinds(&target),
            vec![SlotKind::Before, SlotKind::After]
        );
        assert_eq!(adapter.targets(), vec![target]);
    }

    #[test]
    fn test_enable_is_noop_while_installed() {
        let (backend, adapter, target, _) = setup();
        adapter.enable();
        assert_eq!(backend.redirects(&target).before.len(), 1);
        assert!(adapter.is_active());
    }

    #[test]
    fn test_disable_removes_and_enable_reinstalls() {
        let (backend, adapter, target, handle) = setup();

        adapter.disable();
        assert!(!adapter.is_active());
        assert!(backend.redirects(&target).is_empty());

        adapter.enable();
        assert!(adapter.is_active());
        let info = backend.redirects(&target);
        assert_eq!(info.before.len(), 1);
        assert_eq!(info.before[0].owner, "external");
        assert_eq!(info.before[0].slot, handle);
    }
}
