//! Patch providers group related units under one identity.

use std::sync::{Arc, Mutex, PoisonError};

use crate::coordinator::{Activation, Coordinator};
use crate::interception::SlotSet;
use crate::types::DisableOutcome;
use crate::unit::{CachedUnit, PatchUnit};

/// A group of patch units enabled and disabled together.
///
/// Implementors should:
/// - Return a process-unique, stable `id`
/// - Keep lifecycle hooks cheap; they run on the caller's task
/// - Return `false` from `on_will_enable` to veto before anything is applied
pub trait PatchProvider: Send + Sync {
    /// Unique identity (e.g., "scene-view.grid").
    fn id(&self) -> &str;

    fn display_name(&self) -> &str {
        self.id()
    }

    fn description(&self) -> Option<&str> {
        None
    }

    /// Whether the enabled state survives a restart.
    fn persistent(&self) -> bool {
        true
    }

    /// Enabled at startup when no persisted state exists yet.
    fn active_by_default(&self) -> bool {
        false
    }

    /// Owner name under which redirects are installed.
    fn owner_id(&self) -> String {
        self.id().to_string()
    }

    /// Declaring type, used to look up the provider's source file.
    fn type_name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Pushes every unit of this provider, in application order.
    fn populate_units(&self, units: &mut Vec<Box<dyn PatchUnit>>);

    fn on_registered(&self) {}

    fn on_will_enable(&self) -> bool {
        true
    }

    fn on_enabled(&self) {}

    fn on_disabled(&self) {}
}

/// A unit with its slot handles resolved at registration.
#[derive(Clone)]
pub(crate) struct BoundUnit {
    pub(crate) unit: Arc<CachedUnit>,
    pub(crate) slots: SlotSet,
}

/// Registry-side state for one provider: the provider plus its cached units.
pub(crate) struct ProviderEntry {
    pub(crate) provider: Arc<dyn PatchProvider>,
    /// Backend owner the provider's redirects are applied under.
    pub(crate) owner: String,
    units: Mutex<Option<Arc<[BoundUnit]>>>,
}

impl ProviderEntry {
    pub(crate) fn new(provider: Arc<dyn PatchProvider>) -> Self {
        Self {
            owner: provider.owner_id(),
            provider,
            units: Mutex::new(None),
        }
    }

    /// Units in application order; populated once and kept until invalidated.
    pub(crate) fn units(&self) -> Arc<[BoundUnit]> {
        let mut cached = self.units.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(units) = cached.as_ref() {
            return Arc::clone(units);
        }

        let mut raw = Vec::new();
        self.provider.populate_units(&mut raw);
        let bound: Arc<[BoundUnit]> = raw
            .into_iter()
            .map(|unit| {
                let unit = Arc::new(CachedUnit::new(unit));
                let slots = unit.slots();
                BoundUnit { unit, slots }
            })
            .collect();
        if !bound.is_empty() {
            *cached = Some(Arc::clone(&bound));
        }
        bound
    }

    /// Drops the cached units and their cached targets.
    pub(crate) fn invalidate(&self) {
        let previous = self
            .units
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(units) = previous {
            for bound in units.iter() {
                bound.unit.clear_cache();
            }
        }
    }

    pub(crate) fn all_units_ready_to_load(&self) -> bool {
        self.units().iter().all(|bound| bound.unit.ready_to_load())
    }
}

/// Capability surface for one registered identity.
///
/// Every call delegates to the owning [`Coordinator`] by identity, so a
/// handle stays valid across enable/disable cycles.
#[derive(Clone)]
pub struct PatchHandle {
    coordinator: Coordinator,
    id: String,
}

impl PatchHandle {
    pub(crate) fn new(coordinator: Coordinator, id: String) -> Self {
        Self { coordinator, id }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_active(&self) -> bool {
        self.coordinator.is_active(&self.id)
    }

    pub fn is_waiting_for_load(&self) -> bool {
        self.coordinator.is_waiting_for_load(&self.id)
    }

    pub fn enable(&self) -> Activation {
        self.coordinator.enable(&self.id)
    }

    pub fn disable(&self) -> DisableOutcome {
        self.coordinator.disable(&self.id)
    }
}
