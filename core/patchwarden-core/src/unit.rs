//! Patch units: one set of slot handles applied to one or more targets.

use std::sync::{Arc, Mutex, PoisonError};

use crate::interception::{SlotHandle, SlotSet};
use crate::types::{MethodRef, SlotKind};

/// A self-describing bundle of targets and the replacement logic bound to them.
///
/// Implementors should:
/// - Keep `collect_targets` free of side effects; the result is cached
/// - Return `false` from `ready_to_load` while a target is still being defined
pub trait PatchUnit: Send + Sync {
    /// Name used in diagnostics.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Pushes every method this unit intercepts, in application order.
    fn collect_targets(&self, targets: &mut Vec<MethodRef>);

    /// Whether the targets can be intercepted right now.
    fn ready_to_load(&self) -> bool {
        true
    }

    /// Replacement logic for each slot this unit fills.
    fn slots(&self) -> SlotSet;
}

/// A unit together with its lazily computed target list.
///
/// The list is computed on first request and kept until [`clear_cache`]
/// is called. An empty result is not cached.
///
/// [`clear_cache`]: CachedUnit::clear_cache
pub struct CachedUnit {
    unit: Box<dyn PatchUnit>,
    targets: Mutex<Option<Arc<[MethodRef]>>>,
}

impl CachedUnit {
    pub fn new(unit: Box<dyn PatchUnit>) -> Self {
        Self {
            unit,
            targets: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        self.unit.name()
    }

    pub fn target_methods(&self) -> Arc<[MethodRef]> {
        let mut cached = self.targets.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(targets) = cached.as_ref() {
            return Arc::clone(targets);
        }

        let mut list = Vec::new();
        self.unit.collect_targets(&mut list);
        let targets: Arc<[MethodRef]> = Arc::from(list);
        if !targets.is_empty() {
            *cached = Some(Arc::clone(&targets));
        }
        targets
    }

    pub fn clear_cache(&self) {
        *self.targets.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn ready_to_load(&self) -> bool {
        self.unit.ready_to_load()
    }

    pub fn slots(&self) -> SlotSet {
        self.unit.slots()
    }
}

type ReadyFn = Arc<dyn Fn() -> bool + Send + Sync>;

/// A unit assembled from explicit targets and slot handles.
///
/// ```rust,ignore
/// let unit = StaticUnit::new("hide-toolbar")
///     .target(MethodRef::new("Toolbar", "OnGUI"))
///     .before(SlotHandle::new("skip", skip_toolbar as fn() -> bool));
/// ```
#[derive(Clone)]
pub struct StaticUnit {
    name: String,
    targets: Vec<MethodRef>,
    slots: SlotSet,
    ready: Option<ReadyFn>,
}

impl StaticUnit {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            targets: Vec::new(),
            slots: SlotSet::default(),
            ready: None,
        }
    }

    pub fn target(mut self, method: MethodRef) -> Self {
        self.targets.push(method);
        self
    }

    pub fn slot(mut self, kind: SlotKind, handle: SlotHandle) -> Self {
        self.slots.set(kind, handle);
        self
    }

    pub fn before(self, handle: SlotHandle) -> Self {
        self.slot(SlotKind::Before, handle)
    }

    pub fn after(self, handle: SlotHandle) -> Self {
        self.slot(SlotKind::After, handle)
    }

    pub fn rewrite(self, handle: SlotHandle) -> Self {
        self.slot(SlotKind::Rewrite, handle)
    }

    pub fn on_exception(self, handle: SlotHandle) -> Self {
        self.slot(SlotKind::OnException, handle)
    }

    /// Gates loading on `ready`, polled by the coordinator.
    pub fn ready_when(mut self, ready: impl Fn() -> bool + Send + Sync + 'static) -> Self {
        self.ready = Some(Arc::new(ready));
        self
    }

    pub fn boxed(self) -> Box<dyn PatchUnit> {
        Box::new(self)
    }
}

impl PatchUnit for StaticUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn collect_targets(&self, targets: &mut Vec<MethodRef>) {
        targets.extend(self.targets.iter().cloned());
    }

    fn ready_to_load(&self) -> bool {
        self.ready.as_ref().map_or(true, |ready| ready())
    }

    fn slots(&self) -> SlotSet {
        self.slots.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    struct CountingUnit {
        calls: Arc<AtomicUsize>,
        produce: bool,
    }

    impl PatchUnit for CountingUnit {
        fn collect_targets(&self, targets: &mut Vec<MethodRef>) {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.produce {
                targets.push(MethodRef::new("Menu", "Build"));
            }
        }

        fn slots(&self) -> SlotSet {
            SlotSet::default()
        }
    }

    #[test]
    fn test_targets_are_cached_until_cleared() {
        let calls = Arc::new(AtomicUsize::new(0));
        let unit = CachedUnit::new(Box::new(CountingUnit {
            calls: Arc::clone(&calls),
            produce: true,
        }));

        assert_eq!(unit.target_methods().len(), 1);
        assert_eq!(unit.target_methods().len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        unit.clear_cache();
        unit.target_methods();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_empty_target_list_is_recomputed() {
        let calls = Arc::new(AtomicUsize::new(0));
        let unit = CachedUnit::new(Box::new(CountingUnit {
            calls: Arc::clone(&calls),
            produce: false,
        }));

        assert!(unit.target_methods().is_empty());
        assert!(unit.target_methods().is_empty());
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_default_name_is_type_name() {
        let unit = CountingUnit {
            calls: Arc::new(AtomicUsize::new(0)),
            produce: false,
        };
        assert!(unit.name().ends_with("CountingUnit"));
    }

    #[test]
    fn test_static_unit_readiness_defaults_to_true() {
        let unit = StaticUnit::new("plain");
        assert!(unit.ready_to_load());
    }

    #[test]
    fn test_static_unit_ready_when_is_polled() {
        let ready = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ready);
        let unit = StaticUnit::new("gated").ready_when(move || flag.load(Ordering::SeqCst));

        assert!(!unit.ready_to_load());
        ready.store(true, Ordering::SeqCst);
        assert!(unit.ready_to_load());
    }

    #[test]
    fn test_static_unit_binds_slots() {
        let unit = StaticUnit::new("slots")
            .target(MethodRef::new("A", "b"))
            .before(SlotHandle::new("prefix", ()))
            .on_exception(SlotHandle::new("finalizer", ()));
        let slots = unit.slots();
        assert!(slots.before.is_some());
        assert!(slots.after.is_none());
        assert!(slots.on_exception.is_some());
    }
}
