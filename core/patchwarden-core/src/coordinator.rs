//! The patch lifecycle coordinator.
//!
//! Owns the registry of identities and drives every enable/disable
//! transition:
//!
//! ```text
//! Unregistered → Registered(inactive) → Activating → Registered(active)
//!                        ↑                   │              │
//!                        └──── disable ──────┴──────────────┘
//! ```
//!
//! # Activation
//!
//! [`Coordinator::enable`] checks and vetoes synchronously, marks the identity
//! as waiting, then spawns the activation:
//!
//! 1. Poll the provider's readiness every `ready_poll` until all units are ready.
//! 2. If debug logging is on and the debug patch is persisted active, wait
//!    every `ordering_poll` until the debug patch is no longer activating.
//! 3. Apply every target of every unit on a blocking worker. Per-target
//!    failures are logged and skipped; a unit that fails as a whole rolls
//!    back the identity.
//! 4. Commit: record the active owner, fire `on_enabled`, persist.
//!
//! [`Coordinator::disable`] cancels the waiting token. The activation observes
//! it at its next poll or target and removes whatever it already applied.
//! Until that task has finished, the identity is settling: a new activation
//! for it waits for the rollback before touching the backend.
//!
//! # Locking
//!
//! All registry, waiting and active bookkeeping sits behind one mutex.
//! Provider hooks, settings writes and backend calls run with it released.

use std::collections::HashMap;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use indexmap::IndexMap;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::adapter::ManagedPatch;
use crate::config::CoordinatorConfig;
use crate::error::{InterceptError, PatchError, Result};
use crate::interception::Interceptor;
use crate::locate::SourceLocator;
use crate::provider::{BoundUnit, PatchHandle, PatchProvider, ProviderEntry};
use crate::settings::SettingsStore;
use crate::types::{DisableOutcome, EnableOutcome, PatchKind, PatchSummary};

#[derive(Clone)]
enum Registration {
    Provider(Arc<ProviderEntry>),
    Managed(Arc<dyn ManagedPatch>),
}

struct Waiting {
    ticket: u64,
    token: CancellationToken,
    /// Closes when the activation task has finished, rollback included.
    done: watch::Receiver<()>,
}

/// Waits until the sender side of an activation's `done` channel is dropped.
async fn settled(mut done: watch::Receiver<()>) {
    while done.changed().await.is_ok() {}
}

#[derive(Default)]
struct Registry {
    entries: IndexMap<String, Registration>,
    /// Active provider identities and the owner their redirects were applied under.
    active: HashMap<String, String>,
    waiting: HashMap<String, Waiting>,
    /// Cancelled activations that may still be rolling back.
    settling: HashMap<String, watch::Receiver<()>>,
    file_paths: HashMap<String, PathBuf>,
}

struct Inner {
    interceptor: Arc<dyn Interceptor>,
    settings: Arc<dyn SettingsStore>,
    locator: Option<Arc<dyn SourceLocator>>,
    config: CoordinatorConfig,
    runtime: Handle,
    registry: Mutex<Registry>,
    backend_debug: Mutex<Option<bool>>,
    next_ticket: AtomicU64,
}

pub struct CoordinatorBuilder {
    interceptor: Arc<dyn Interceptor>,
    settings: Arc<dyn SettingsStore>,
    locator: Option<Arc<dyn SourceLocator>>,
    config: CoordinatorConfig,
    runtime: Option<Handle>,
}

impl CoordinatorBuilder {
    pub fn locator(mut self, locator: Arc<dyn SourceLocator>) -> Self {
        self.locator = Some(locator);
        self
    }

    pub fn config(mut self, config: CoordinatorConfig) -> Self {
        self.config = config;
        self
    }

    /// Runtime activations are spawned on. Defaults to the current runtime.
    pub fn runtime(mut self, runtime: Handle) -> Self {
        self.runtime = Some(runtime);
        self
    }

    pub fn build(self) -> Result<Coordinator> {
        let runtime = match self.runtime {
            Some(runtime) => runtime,
            None => Handle::try_current().map_err(|_| PatchError::NoRuntime)?,
        };
        Ok(Coordinator {
            inner: Arc::new(Inner {
                interceptor: self.interceptor,
                settings: self.settings,
                locator: self.locator,
                config: self.config,
                runtime,
                registry: Mutex::new(Registry::default()),
                backend_debug: Mutex::new(None),
                next_ticket: AtomicU64::new(1),
            }),
        })
    }
}

/// Future for one enable request; resolves once the activation settles.
///
/// Dropping it detaches the activation, which keeps running.
#[derive(Debug)]
pub struct Activation {
    state: ActivationState,
}

#[derive(Debug)]
enum ActivationState {
    Settled(Option<EnableOutcome>),
    Running(JoinHandle<EnableOutcome>),
}

impl Activation {
    fn settled(outcome: EnableOutcome) -> Self {
        Self {
            state: ActivationState::Settled(Some(outcome)),
        }
    }

    fn running(handle: JoinHandle<EnableOutcome>) -> Self {
        Self {
            state: ActivationState::Running(handle),
        }
    }

    pub fn is_finished(&self) -> bool {
        match &self.state {
            ActivationState::Settled(_) => true,
            ActivationState::Running(handle) => handle.is_finished(),
        }
    }
}

impl Future for Activation {
    type Output = EnableOutcome;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<EnableOutcome> {
        match &mut self.get_mut().state {
            ActivationState::Settled(outcome) => {
                Poll::Ready(outcome.take().unwrap_or(EnableOutcome::AlreadyActivating))
            }
            ActivationState::Running(handle) => Pin::new(handle).poll(cx).map(|result| {
                result.unwrap_or_else(|err| {
                    error!(error = %err, "Patch activation task ended abnormally");
                    EnableOutcome::Failed
                })
            }),
        }
    }
}

/// Central registry and state machine for patch identities.
///
/// Cheap to clone; clones share one registry.
#[derive(Clone)]
pub struct Coordinator {
    inner: Arc<Inner>,
}

impl Coordinator {
    pub fn builder(
        interceptor: Arc<dyn Interceptor>,
        settings: Arc<dyn SettingsStore>,
    ) -> CoordinatorBuilder {
        CoordinatorBuilder {
            interceptor,
            settings,
            locator: None,
            config: CoordinatorConfig::default(),
            runtime: None,
        }
    }

    pub fn new(
        interceptor: Arc<dyn Interceptor>,
        settings: Arc<dyn SettingsStore>,
    ) -> Result<Self> {
        Self::builder(interceptor, settings).build()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.inner.registry()
    }

    pub fn interceptor(&self) -> &Arc<dyn Interceptor> {
        &self.inner.interceptor
    }

    pub fn settings(&self) -> &Arc<dyn SettingsStore> {
        &self.inner.settings
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.inner.config
    }

    pub(crate) fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    /// Whether redirects under `owner` belong to a registered provider,
    /// including one that is still activating.
    pub(crate) fn provider_owns(&self, owner: &str) -> bool {
        let registry = self.registry();
        if registry.active.values().any(|active| active == owner) {
            return true;
        }
        registry.entries.values().any(|registration| match registration {
            Registration::Provider(entry) => entry.owner == owner,
            Registration::Managed(_) => false,
        })
    }

    // ─────────────────────────────────────────────────────────────────────
    // Registration
    // ─────────────────────────────────────────────────────────────────────

    /// Registers a provider. Returns false if its identity is empty or taken.
    pub fn register(&self, provider: Arc<dyn PatchProvider>) -> bool {
        let id = provider.id().to_string();
        if id.is_empty() {
            warn!(
                type_name = provider.type_name(),
                "Patch provider has no id and will be ignored"
            );
            return false;
        }

        let needs_path = {
            let registry = self.registry();
            if registry.entries.contains_key(&id) {
                debug!(id = %id, "Patch already registered");
                return false;
            }
            !registry.file_paths.contains_key(&id)
        };

        let file_path = if needs_path {
            self.inner
                .locator
                .as_ref()
                .and_then(|locator| locator.locate(provider.type_name()))
        } else {
            None
        };

        let entry = Arc::new(ProviderEntry::new(Arc::clone(&provider)));
        let unit_count = entry.units().len();

        {
            let mut registry = self.registry();
            if registry.entries.contains_key(&id) {
                return false;
            }
            registry
                .entries
                .insert(id.clone(), Registration::Provider(entry));
            if let Some(path) = file_path {
                registry.file_paths.entry(id.clone()).or_insert(path);
            }
        }

        debug!(id = %id, units = unit_count, "Patch provider registered");
        provider.on_registered();
        true
    }

    /// Registers a self-managing patch. Unless persisted active, it is
    /// disabled right away.
    pub fn register_managed(&self, patch: Arc<dyn ManagedPatch>) -> bool {
        let id = patch.id().to_string();
        if id.is_empty() {
            warn!("Managed patch has no id and will be ignored");
            return false;
        }

        {
            let mut registry = self.registry();
            if registry.entries.contains_key(&id) {
                return false;
            }
            registry
                .entries
                .insert(id.clone(), Registration::Managed(Arc::clone(&patch)));
        }

        debug!(id = %id, "Managed patch registered");
        if !self.inner.settings.persisted_active(&id) && patch.is_active() {
            patch.disable();
        }
        true
    }

    /// Disables and forgets an identity.
    pub fn unregister(&self, id: &str) -> bool {
        self.disable(id);
        let mut registry = self.registry();
        registry.file_paths.remove(id);
        registry.entries.shift_remove(id).is_some()
    }

    /// Drops a provider's cached units; the next enable recomputes them.
    pub fn invalidate_units(&self, id: &str) -> bool {
        match self.registration(id) {
            Some(Registration::Provider(entry)) => {
                entry.invalidate();
                true
            }
            _ => false,
        }
    }

    fn registration(&self, id: &str) -> Option<Registration> {
        self.registry().entries.get(id).cloned()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Transitions
    // ─────────────────────────────────────────────────────────────────────

    /// Starts enabling `id`. Idempotent for active or activating identities.
    pub fn enable(&self, id: &str) -> Activation {
        self.sync_backend_debug();

        let registration = {
            let registry = self.registry();
            if registry.active.contains_key(id) {
                return Activation::settled(EnableOutcome::AlreadyActive);
            }
            if registry.waiting.contains_key(id) {
                return Activation::settled(EnableOutcome::AlreadyActivating);
            }
            registry.entries.get(id).cloned()
        };

        match registration {
            None => {
                if self.allow_debug_logs() {
                    warn!(id = %id, "Can not enable patch: patch is unknown");
                }
                Activation::settled(EnableOutcome::Unknown)
            }
            Some(Registration::Managed(patch)) => {
                if patch.is_active() {
                    return Activation::settled(EnableOutcome::AlreadyActive);
                }
                patch.enable();
                self.inner.persist(id, true);
                info!(id = %id, "Managed patch enabled");
                Activation::settled(EnableOutcome::Enabled)
            }
            Some(Registration::Provider(entry)) => self.start_activation(id, entry),
        }
    }

    fn start_activation(&self, id: &str, entry: Arc<ProviderEntry>) -> Activation {
        if entry.units().is_empty() && self.allow_debug_logs() {
            warn!(id = %id, "Patch did not return any units");
        }

        if !entry.provider.on_will_enable() {
            debug!(id = %id, "Patch vetoed activation");
            return Activation::settled(EnableOutcome::Vetoed);
        }

        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let (done_tx, done) = watch::channel(());
        let previous = {
            let mut registry = self.registry();
            if registry.active.contains_key(id) {
                return Activation::settled(EnableOutcome::AlreadyActive);
            }
            if registry.waiting.contains_key(id) {
                return Activation::settled(EnableOutcome::AlreadyActivating);
            }
            registry.waiting.insert(
                id.to_string(),
                Waiting {
                    ticket,
                    token: token.clone(),
                    done,
                },
            );
            registry.settling.remove(id)
        };

        let inner = Arc::clone(&self.inner);
        let id = id.to_string();
        let handle = self.inner.runtime.spawn(async move {
            let _done = done_tx;
            if let Some(previous) = previous {
                debug!(id = %id, "Waiting for cancelled activation to settle");
                settled(previous).await;
            }
            inner.activate(id, entry, ticket, token).await
        });
        Activation::running(handle)
    }

    /// Disables `id`, cancelling an in-flight activation if there is one.
    pub fn disable(&self, id: &str) -> DisableOutcome {
        self.sync_backend_debug();

        let (cancelled, registration, owner) = {
            let mut registry = self.registry();
            let cancelled = match registry.waiting.remove(id) {
                Some(waiting) => {
                    waiting.token.cancel();
                    registry.settling.insert(id.to_string(), waiting.done);
                    true
                }
                None => false,
            };
            let registration = registry.entries.get(id).cloned();
            let owner = registry.active.remove(id);
            (cancelled, registration, owner)
        };

        match registration {
            None => {
                if self.allow_debug_logs() {
                    warn!(id = %id, "Can not disable patch: patch is unknown");
                }
                DisableOutcome::Unknown
            }
            Some(Registration::Provider(entry)) => match owner {
                Some(owner) => {
                    self.inner.interceptor.remove_all_redirects(&owner);
                    entry.provider.on_disabled();
                    self.inner.persist(id, false);
                    info!(id = %id, "Patch disabled");
                    DisableOutcome::Disabled
                }
                None if cancelled => {
                    debug!(id = %id, "Cancelled pending patch activation");
                    DisableOutcome::Cancelled
                }
                None => DisableOutcome::AlreadyInactive,
            },
            Some(Registration::Managed(patch)) => {
                if !patch.is_active() {
                    return DisableOutcome::AlreadyInactive;
                }
                patch.disable();
                self.inner.persist(id, false);
                info!(id = %id, "Managed patch disabled");
                DisableOutcome::Disabled
            }
        }
    }

    /// Disables every active identity. With `reset_persistence` false, each
    /// one keeps its persisted active flag so it resumes on the next load.
    pub fn disable_all(&self, reset_persistence: bool) -> usize {
        info!(reset_persistence, "Disabling all patches");
        let active: Vec<String> = self
            .ids()
            .into_iter()
            .filter(|id| self.is_active(id))
            .collect();

        let mut disabled = 0;
        for id in active {
            if self.disable(&id) != DisableOutcome::Disabled {
                continue;
            }
            disabled += 1;
            if !reset_persistence {
                self.inner.persist(&id, true);
            }
        }
        disabled
    }

    /// Enables every identity whose persisted flag is active, in registration
    /// order with the debug patch first. Identities never persisted follow
    /// their provider's `active_by_default`.
    pub fn replay_persisted(&self) -> Vec<Activation> {
        if !self.inner.config.auto_enable_persistent {
            return Vec::new();
        }

        let registrations: Vec<(String, Registration)> = self
            .registry()
            .entries
            .iter()
            .map(|(id, registration)| (id.clone(), registration.clone()))
            .collect();

        let mut candidates: Vec<String> = registrations
            .into_iter()
            .filter(|(id, registration)| match self.inner.settings.persisted_state(id) {
                Some(active) => active,
                None => match registration {
                    Registration::Provider(entry) => entry.provider.active_by_default(),
                    Registration::Managed(_) => false,
                },
            })
            .map(|(id, _)| id)
            .collect();

        let debug_id = &self.inner.config.debug_patch_id;
        if let Some(pos) = candidates.iter().position(|id| id == debug_id) {
            let debug = candidates.remove(pos);
            candidates.insert(0, debug);
        }

        candidates
            .into_iter()
            .map(|id| {
                debug!(id = %id, "Re-enabling previously active patch");
                self.enable(&id)
            })
            .collect()
    }

    // ─────────────────────────────────────────────────────────────────────
    // Host commands
    // ─────────────────────────────────────────────────────────────────────

    pub fn clear_settings_cache(&self) {
        if let Err(err) = self.inner.settings.clear(true) {
            warn!(error = %err, "Failed to clear patch settings");
        }
    }

    pub fn disable_all_patches(&self) -> usize {
        self.disable_all(true)
    }

    pub fn allow_debug_logs(&self) -> bool {
        self.inner.settings.debug_log_enabled()
    }

    pub fn set_allow_debug_logs(&self, enabled: bool) {
        if let Err(err) = self.inner.settings.set_debug_log_enabled(enabled) {
            warn!(error = %err, "Failed to persist debug log flag");
        }
        self.sync_backend_debug();
    }

    // ─────────────────────────────────────────────────────────────────────
    // Queries
    // ─────────────────────────────────────────────────────────────────────

    pub fn is_active(&self, id: &str) -> bool {
        let registration = {
            let registry = self.registry();
            if registry.active.contains_key(id) {
                return true;
            }
            registry.entries.get(id).cloned()
        };
        match registration {
            Some(Registration::Managed(patch)) => patch.is_active(),
            _ => false,
        }
    }

    pub fn is_waiting_for_load(&self, id: &str) -> bool {
        self.registry().waiting.contains_key(id)
    }

    pub fn is_registered(&self, id: &str) -> bool {
        self.registry().entries.contains_key(id)
    }

    pub fn is_persistent_enabled(&self, id: &str) -> bool {
        self.inner.settings.persisted_active(id)
    }

    pub fn file_path(&self, id: &str) -> Option<PathBuf> {
        self.registry().file_paths.get(id).cloned()
    }

    /// Registered identities in registration order.
    pub fn ids(&self) -> Vec<String> {
        self.registry().entries.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.registry().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn handle(&self, id: &str) -> Option<PatchHandle> {
        self.is_registered(id)
            .then(|| PatchHandle::new(self.clone(), id.to_string()))
    }

    pub fn summaries(&self) -> Vec<PatchSummary> {
        let registrations: Vec<(String, Registration, Option<PathBuf>)> = {
            let registry = self.registry();
            registry
                .entries
                .iter()
                .map(|(id, registration)| {
                    (
                        id.clone(),
                        registration.clone(),
                        registry.file_paths.get(id).cloned(),
                    )
                })
                .collect()
        };

        registrations
            .into_iter()
            .map(|(id, registration, file_path)| {
                let (name, description, kind, persistent) = match &registration {
                    Registration::Provider(entry) => (
                        entry.provider.display_name().to_string(),
                        entry.provider.description().map(str::to_string),
                        PatchKind::Provider,
                        entry.provider.persistent(),
                    ),
                    Registration::Managed(patch) => {
                        (patch.name().to_string(), None, PatchKind::Managed, true)
                    }
                };
                PatchSummary {
                    active: self.is_active(&id),
                    waiting: self.is_waiting_for_load(&id),
                    persisted_active: self.inner.settings.persisted_active(&id),
                    id,
                    name,
                    description,
                    kind,
                    persistent,
                    file_path,
                }
            })
            .collect()
    }

    /// Pushes the debug flag to the backend when it changed.
    fn sync_backend_debug(&self) {
        let enabled = self.inner.settings.debug_log_enabled();
        let mut last = self
            .inner
            .backend_debug
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *last == Some(enabled) {
            return;
        }
        *last = Some(enabled);

        let log_file = self.inner.config.interception_log_file.as_deref();
        if enabled {
            if let Some(path) = log_file {
                if let Some(parent) = path.parent() {
                    if let Err(err) = fs_err::create_dir_all(parent) {
                        warn!(error = %err, "Failed to create interception log directory");
                    }
                }
                info!(path = %path.display(), "Set interception debug log path");
            }
        }
        self.inner
            .interceptor
            .set_debug_logging(enabled, log_file.filter(|_| enabled));
    }
}

impl Inner {
    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn persist(&self, id: &str, active: bool) {
        if let Err(err) = self.settings.set_persisted_active(id, active) {
            warn!(id = %id, error = %err, "Failed to persist patch state");
        }
    }

    fn must_wait_for_debug_patch(&self, id: &str) -> bool {
        let debug_id = self.config.debug_patch_id.as_str();
        id != debug_id
            && self.settings.debug_log_enabled()
            && self.settings.persisted_active(debug_id)
            && self.registry().waiting.contains_key(debug_id)
    }

    /// Removes the waiting entry if it still belongs to this activation.
    fn release_ticket(&self, id: &str, ticket: u64) {
        let mut registry = self.registry();
        if registry.waiting.get(id).is_some_and(|w| w.ticket == ticket) {
            registry.waiting.remove(id);
        }
    }

    fn roll_back(&self, id: &str, owner: &str) {
        self.interceptor.remove_all_redirects(owner);
        debug!(id = %id, owner = %owner, "Rolled back partial patch");
    }

    async fn activate(
        self: Arc<Self>,
        id: String,
        entry: Arc<ProviderEntry>,
        ticket: u64,
        token: CancellationToken,
    ) -> EnableOutcome {
        loop {
            if token.is_cancelled() {
                return EnableOutcome::Cancelled;
            }
            if entry.all_units_ready_to_load() {
                break;
            }
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(self.config.ready_poll()) => {}
            }
        }

        while self.must_wait_for_debug_patch(&id) {
            if token.is_cancelled() {
                return EnableOutcome::Cancelled;
            }
            tokio::time::sleep(self.config.ordering_poll()).await;
        }
        if token.is_cancelled() {
            return EnableOutcome::Cancelled;
        }

        let owner = entry.owner.clone();
        let name = entry.provider.display_name().to_string();
        if self.settings.debug_log_enabled() {
            info!(id = %id, "Applying patch");
        }

        for bound in entry.units().iter().cloned() {
            let unit_name = bound.unit.name().to_string();
            let applied = tokio::task::spawn_blocking({
                let interceptor = Arc::clone(&self.interceptor);
                let owner = owner.clone();
                let name = name.clone();
                let token = token.clone();
                move || apply_unit(interceptor.as_ref(), &owner, &name, &bound, &token)
            })
            .await;

            if let Err(err) = applied {
                error!(id = %id, unit = %unit_name, error = %err, "Patching failed");
                self.roll_back(&id, &owner);
                self.release_ticket(&id, ticket);
                return EnableOutcome::Failed;
            }
            if token.is_cancelled() {
                self.roll_back(&id, &owner);
                return EnableOutcome::Cancelled;
            }
        }

        {
            let mut registry = self.registry();
            if token.is_cancelled() {
                drop(registry);
                self.roll_back(&id, &owner);
                return EnableOutcome::Cancelled;
            }
            registry.waiting.remove(&id);
            registry.active.insert(id.clone(), owner);
        }

        entry.provider.on_enabled();
        if entry.provider.persistent() {
            self.persist(&id, true);
        }
        info!(id = %id, "Patch enabled");
        EnableOutcome::Enabled
    }
}

/// Applies one unit's slots to each of its targets. Runs on a blocking worker.
fn apply_unit(
    interceptor: &dyn Interceptor,
    owner: &str,
    name: &str,
    bound: &BoundUnit,
    token: &CancellationToken,
) {
    let targets = bound.unit.target_methods();
    for target in targets.iter() {
        if token.is_cancelled() {
            break;
        }
        match interceptor.apply_redirect(owner, target, &bound.slots) {
            Ok(()) => debug!(patch = %name, target = %target, "Applied redirect"),
            Err(InterceptError::Unsupported { reason, .. }) => {
                warn!(
                    patch = %name,
                    target = %target,
                    reason = %reason,
                    "Patching is not supported"
                );
            }
            Err(err) => {
                warn!(
                    patch = %name,
                    unit = %bound.unit.name(),
                    method = %target.name,
                    declaring_type = %target.declaring_type,
                    error = ?err,
                    "Failed to apply redirect"
                );
            }
        }
    }
}
