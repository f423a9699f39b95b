#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use patchwarden_core::{
    Coordinator, MemoryInterceptor, MemorySettings, MethodRef, PatchProvider, PatchUnit,
    SettingsStore, SlotHandle, StaticUnit,
};

type UnitFactory = Box<dyn Fn(&mut Vec<Box<dyn PatchUnit>>) + Send + Sync>;

/// Configurable provider that counts its lifecycle hooks.
pub struct TestPatch {
    id: String,
    persistent: bool,
    active_by_default: bool,
    units: UnitFactory,
    pub populated: AtomicUsize,
    pub enabled: AtomicUsize,
    pub disabled: AtomicUsize,
}

impl TestPatch {
    pub fn new(
        id: &str,
        units: impl Fn(&mut Vec<Box<dyn PatchUnit>>) + Send + Sync + 'static,
    ) -> Self {
        Self {
            id: id.to_string(),
            persistent: true,
            active_by_default: false,
            units: Box::new(units),
            populated: AtomicUsize::new(0),
            enabled: AtomicUsize::new(0),
            disabled: AtomicUsize::new(0),
        }
    }

    /// One unit with a before-slot on `target`.
    pub fn single(id: &str, target: MethodRef) -> Self {
        let name = id.to_string();
        Self::new(id, move |units| {
            units.push(
                StaticUnit::new(name.clone())
                    .target(target.clone())
                    .before(before(&name))
                    .boxed(),
            );
        })
    }

    /// Like [`TestPatch::single`], but only ready once `ready` is set.
    pub fn gated(id: &str, target: MethodRef, ready: Arc<AtomicBool>) -> Self {
        let name = id.to_string();
        Self::new(id, move |units| {
            let ready = Arc::clone(&ready);
            units.push(
                StaticUnit::new(name.clone())
                    .target(target.clone())
                    .before(before(&name))
                    .ready_when(move || ready.load(Ordering::SeqCst))
                    .boxed(),
            );
        })
    }

    pub fn not_persistent(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub fn active_by_default(mut self) -> Self {
        self.active_by_default = true;
        self
    }

    pub fn arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn enabled_count(&self) -> usize {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn disabled_count(&self) -> usize {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn populated_count(&self) -> usize {
        self.populated.load(Ordering::SeqCst)
    }
}

impl PatchProvider for TestPatch {
    fn id(&self) -> &str {
        &self.id
    }

    fn persistent(&self) -> bool {
        self.persistent
    }

    fn active_by_default(&self) -> bool {
        self.active_by_default
    }

    fn populate_units(&self, units: &mut Vec<Box<dyn PatchUnit>>) {
        self.populated.fetch_add(1, Ordering::SeqCst);
        (self.units)(units);
    }

    fn on_enabled(&self) {
        self.enabled.fetch_add(1, Ordering::SeqCst);
    }

    fn on_disabled(&self) {
        self.disabled.fetch_add(1, Ordering::SeqCst);
    }
}

pub fn before(name: &str) -> SlotHandle {
    SlotHandle::new(name.to_string(), ())
}

pub fn method(declaring_type: &str, name: &str) -> MethodRef {
    MethodRef::new(declaring_type, name)
}

pub fn memory_coordinator() -> (Coordinator, Arc<MemoryInterceptor>, Arc<MemorySettings>) {
    let backend = Arc::new(MemoryInterceptor::new());
    let settings = Arc::new(MemorySettings::new());
    let coordinator = Coordinator::new(backend.clone(), settings.clone()).unwrap();
    (coordinator, backend, settings)
}

pub fn persisted(settings: &dyn SettingsStore, ids: &[&str]) {
    for id in ids {
        settings.set_persisted_active(id, true).unwrap();
    }
}
