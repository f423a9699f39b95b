//! Discovery of patches to register.
//!
//! Two sources feed the coordinator:
//! - Redirects already installed in the backend by other owners, wrapped in
//!   one [`IndependentAdapter`] per owner
//! - Self-registered declarations, each wrapped in a [`DeclaredProvider`]
//!
//! Enumerating the backend can race with redirects being applied elsewhere.
//! A pass that hits [`InterceptError::CollectionModified`] is abandoned and
//! retried after `rescan_interval`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::adapter::{is_managed_owner, IndependentAdapter};
use crate::config::CollectorConfig;
use crate::coordinator::{Activation, Coordinator};
use crate::declare::{DeclarationSource, DeclaredProvider};
use crate::error::InterceptError;
use crate::interception::{Interceptor, RedirectInfo};
use crate::types::MethodRef;

/// What one `collect_all` call changed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CollectReport {
    /// Enumeration attempts, including abandoned ones.
    pub passes: usize,
    pub adapters_registered: usize,
    pub slots_recorded: usize,
    pub declarations_registered: usize,
}

/// Result of [`Collector::start`].
#[derive(Debug)]
pub struct Startup {
    /// Replayed activations from the bootstrap.
    pub activations: Vec<Activation>,
    /// Periodic collection task, when `periodic_interval_secs` is set.
    pub periodic: Option<JoinHandle<()>>,
}

pub struct Collector {
    coordinator: Coordinator,
    source: Arc<dyn DeclarationSource>,
    config: CollectorConfig,
    scanning: AtomicBool,
    adapters: Mutex<HashMap<String, Arc<IndependentAdapter>>>,
}

/// Clears the single-flight flag however the scan ends.
struct ScanGuard<'a>(&'a AtomicBool);

impl Drop for ScanGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

enum ScanFailure {
    Modified,
    Aborted,
}

impl Collector {
    pub fn new(
        coordinator: Coordinator,
        source: Arc<dyn DeclarationSource>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            coordinator,
            source,
            config,
            scanning: AtomicBool::new(false),
            adapters: Mutex::new(HashMap::new()),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }

    pub fn is_scanning(&self) -> bool {
        self.scanning.load(Ordering::SeqCst)
    }

    /// Adapter built for a foreign redirect owner, if one was seen.
    pub fn adapter(&self, owner: &str) -> Option<Arc<IndependentAdapter>> {
        self.adapters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(owner)
            .cloned()
    }

    /// Scans the backend and the declaration source and registers anything new.
    ///
    /// Returns `None` without doing anything while another scan is running.
    pub async fn collect_all(&self) -> Option<CollectReport> {
        if self.scanning.swap(true, Ordering::SeqCst) {
            debug!("Patch collection already in progress");
            return None;
        }
        let _guard = ScanGuard(&self.scanning);

        let mut report = CollectReport::default();
        loop {
            report.passes += 1;
            match self.scan_redirects().await {
                Ok(found) => {
                    self.merge_independent(found, &mut report);
                    break;
                }
                Err(ScanFailure::Modified) => {
                    debug!(
                        retry_in_secs = self.config.rescan_interval().as_secs(),
                        "Redirect collection modified during scan, retrying"
                    );
                    tokio::time::sleep(self.config.rescan_interval()).await;
                }
                Err(ScanFailure::Aborted) => break,
            }
        }

        self.merge_declarations(&mut report);
        debug!(
            passes = report.passes,
            adapters = report.adapters_registered,
            slots = report.slots_recorded,
            declarations = report.declarations_registered,
            "Patch collection finished"
        );
        Some(report)
    }

    async fn scan_redirects(&self) -> Result<Vec<(MethodRef, RedirectInfo)>, ScanFailure> {
        let interceptor = Arc::clone(self.coordinator.interceptor());
        let scanned = tokio::task::spawn_blocking(move || enumerate(interceptor.as_ref())).await;

        match scanned {
            Ok(Ok(found)) => Ok(found),
            Ok(Err(InterceptError::CollectionModified)) => Err(ScanFailure::Modified),
            Ok(Err(err)) => {
                warn!(error = %err, "Failed to enumerate redirected methods");
                Err(ScanFailure::Aborted)
            }
            Err(err) => {
                warn!(error = %err, "Redirect enumeration ended abnormally");
                Err(ScanFailure::Aborted)
            }
        }
    }

    fn merge_independent(&self, found: Vec<(MethodRef, RedirectInfo)>, report: &mut CollectReport) {
        let mut fresh = Vec::new();
        {
            let mut adapters = self.adapters.lock().unwrap_or_else(PoisonError::into_inner);
            // Unregistered owners get a new adapter if their redirects come back.
            adapters.retain(|owner, _| self.coordinator.is_registered(owner));
            for (method, info) in found {
                for (kind, entry) in info.iter() {
                    let owner = entry.owner.as_str();
                    if is_managed_owner(owner) || self.coordinator.provider_owns(owner) {
                        continue;
                    }
                    let adapter = adapters.entry(owner.to_string()).or_insert_with(|| {
                        let adapter = Arc::new(IndependentAdapter::new(
                            owner,
                            Arc::clone(self.coordinator.interceptor()),
                        ));
                        fresh.push(Arc::clone(&adapter));
                        adapter
                    });
                    if adapter.record(method.clone(), kind, entry.slot.clone()) {
                        report.slots_recorded += 1;
                    }
                }
            }
        }

        for adapter in fresh {
            if self.coordinator.register_managed(adapter.clone()) {
                report.adapters_registered += 1;
            }
        }
    }

    fn merge_declarations(&self, report: &mut CollectReport) {
        for declaration in self.source.declarations() {
            if self.coordinator.is_registered(declaration.id) {
                continue;
            }
            let provider = Arc::new(DeclaredProvider::new(declaration));
            if self.coordinator.register(provider) {
                report.declarations_registered += 1;
            }
        }
    }

    /// Startup sequence: self-registered providers, first collection, replay.
    pub async fn bootstrap(&self) -> Vec<Activation> {
        for provider in self.source.providers() {
            self.coordinator.register(provider);
        }
        self.collect_all().await;
        let activations = self.coordinator.replay_persisted();
        info!(
            patches = self.coordinator.len(),
            replayed = activations.len(),
            "Patch bootstrap complete"
        );
        activations
    }

    /// [`bootstrap`](Self::bootstrap), then periodic collection on the
    /// configured interval until `cancel` fires.
    pub async fn start(self: &Arc<Self>, cancel: CancellationToken) -> Startup {
        let activations = self.bootstrap().await;
        let periodic = self.config.periodic_interval().map(|period| {
            debug!(period_secs = period.as_secs(), "Starting periodic patch collection");
            self.spawn_periodic(period, cancel)
        });
        Startup {
            activations,
            periodic,
        }
    }

    /// Re-runs `collect_all` every `period` until `cancel` fires.
    pub fn spawn_periodic(
        self: &Arc<Self>,
        period: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        self.coordinator.runtime().spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        collector.collect_all().await;
                    }
                }
            }
            debug!("Periodic patch collection stopped");
        })
    }
}

fn enumerate(interceptor: &dyn Interceptor) -> Result<Vec<(MethodRef, RedirectInfo)>, InterceptError> {
    let methods = interceptor.list_redirected_methods()?;
    let mut found = Vec::with_capacity(methods.len());
    for method in methods {
        let info = interceptor.list_redirects_for(&method)?;
        found.push((method, info));
    }
    Ok(found)
}
