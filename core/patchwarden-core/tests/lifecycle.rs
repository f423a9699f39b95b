//! Integration tests for enable/disable transitions, cancellation and ordering.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{before, memory_coordinator, method, persisted, TestPatch};
use patchwarden_core::{
    DisableOutcome, EnableOutcome, Interceptor, MethodRef, PatchProvider, PatchUnit, SlotKind,
    SettingsStore, SlotSet, StaticUnit, INTERCEPTION_LOG_PATCH_ID,
};

#[tokio::test]
async fn test_before_slot_lifecycle() {
    let (coordinator, backend, _) = memory_coordinator();
    let m = method("Window", "Repaint");
    assert!(coordinator.register(TestPatch::single("A", m.clone()).arc()));

    assert_eq!(coordinator.enable("A").await, EnableOutcome::Enabled);
    let info = backend.list_redirects_for(&m).unwrap();
    assert_eq!(info.before.len(), 1);
    assert_eq!(info.before[0].owner, "A");
    assert!(info.after.is_empty());

    assert_eq!(coordinator.disable("A"), DisableOutcome::Disabled);
    assert!(backend.list_redirects_for(&m).unwrap().is_empty());
}

#[tokio::test]
async fn test_enable_is_idempotent() {
    let (coordinator, backend, _) = memory_coordinator();
    let m = method("Window", "Repaint");
    let patch = TestPatch::single("A", m.clone()).arc();
    coordinator.register(patch.clone());

    let first = coordinator.enable("A");
    let second = coordinator.enable("A");
    assert_eq!(second.await, EnableOutcome::AlreadyActivating);
    assert_eq!(first.await, EnableOutcome::Enabled);
    assert_eq!(coordinator.enable("A").await, EnableOutcome::AlreadyActive);

    assert_eq!(backend.redirects(&m).before.len(), 1);
    assert_eq!(patch.enabled_count(), 1);
}

#[tokio::test]
async fn test_disable_inactive_is_noop() {
    let (coordinator, backend, settings) = memory_coordinator();
    let patch = TestPatch::single("A", method("Window", "Repaint")).arc();
    coordinator.register(patch.clone());

    assert_eq!(coordinator.disable("A"), DisableOutcome::AlreadyInactive);
    assert_eq!(settings.write_count(), 0);
    assert_eq!(patch.disabled_count(), 0);
    assert!(backend.history().is_empty());
}

#[tokio::test]
async fn test_duplicate_registration_is_rejected() {
    let (coordinator, _, _) = memory_coordinator();
    assert!(coordinator.register(TestPatch::single("dup", method("A", "a")).arc()));
    assert!(!coordinator.register(TestPatch::single("dup", method("B", "b")).arc()));
    assert_eq!(coordinator.len(), 1);
}

#[tokio::test]
async fn test_empty_identity_is_rejected() {
    let (coordinator, _, _) = memory_coordinator();
    assert!(!coordinator.register(TestPatch::single("", method("A", "a")).arc()));
    assert!(coordinator.is_empty());
}

#[tokio::test]
async fn test_never_ready_enable_does_not_complete() {
    let (coordinator, backend, _) = memory_coordinator();
    let ready = Arc::new(AtomicBool::new(false));
    coordinator.register(TestPatch::gated("slow", method("Asset", "Import"), ready).arc());

    let outcome =
        tokio::time::timeout(Duration::from_millis(200), coordinator.enable("slow")).await;
    assert!(outcome.is_err());
    assert!(!coordinator.is_active("slow"));
    assert!(coordinator.is_waiting_for_load("slow"));
    assert!(backend.history().is_empty());

    assert_eq!(coordinator.disable("slow"), DisableOutcome::Cancelled);
    assert!(!coordinator.is_waiting_for_load("slow"));
}

#[tokio::test]
async fn test_enable_completes_once_ready() {
    let (coordinator, _, _) = memory_coordinator();
    let ready = Arc::new(AtomicBool::new(false));
    coordinator.register(
        TestPatch::gated("late", method("Asset", "Import"), Arc::clone(&ready)).arc(),
    );

    let activation = coordinator.enable("late");
    tokio::time::sleep(Duration::from_millis(60)).await;
    assert!(!coordinator.is_active("late"));

    ready.store(true, Ordering::SeqCst);
    assert_eq!(activation.await, EnableOutcome::Enabled);
    assert!(coordinator.is_active("late"));
}

#[tokio::test]
async fn test_disable_during_readiness_wait_cancels() {
    let (coordinator, backend, settings) = memory_coordinator();
    let ready = Arc::new(AtomicBool::new(false));
    let patch = TestPatch::gated("slow", method("Asset", "Import"), ready).arc();
    coordinator.register(patch.clone());

    let activation = coordinator.enable("slow");
    tokio::time::sleep(Duration::from_millis(40)).await;
    assert_eq!(coordinator.disable("slow"), DisableOutcome::Cancelled);

    assert_eq!(activation.await, EnableOutcome::Cancelled);
    assert!(!coordinator.is_active("slow"));
    assert_eq!(backend.count_owned_by("slow"), 0);
    assert_eq!(patch.disabled_count(), 0);
    assert_eq!(settings.persisted_state("slow"), None);
}

/// Blocks its first target collection until released.
struct BlockingTargets {
    entered: Mutex<Option<mpsc::Sender<()>>>,
    release: Mutex<mpsc::Receiver<()>>,
    target: MethodRef,
}

impl PatchUnit for BlockingTargets {
    fn name(&self) -> &str {
        "blocking"
    }

    fn collect_targets(&self, targets: &mut Vec<MethodRef>) {
        if let Some(entered) = self.entered.lock().unwrap().take() {
            entered.send(()).unwrap();
            self.release.lock().unwrap().recv().unwrap();
        }
        targets.push(self.target.clone());
    }

    fn slots(&self) -> SlotSet {
        SlotSet::default().with(SlotKind::Before, before("blocking"))
    }
}

struct TwoStagePatch {
    second: Mutex<Option<BlockingTargets>>,
}

impl PatchProvider for TwoStagePatch {
    fn id(&self) -> &str {
        "two-stage"
    }

    fn populate_units(&self, units: &mut Vec<Box<dyn PatchUnit>>) {
        units.push(
            StaticUnit::new("first")
                .target(method("Scene", "Draw"))
                .before(before("first"))
                .boxed(),
        );
        if let Some(second) = self.second.lock().unwrap().take() {
            units.push(Box::new(second));
        }
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_disable_mid_application_rolls_back() {
    let (coordinator, backend, _) = memory_coordinator();
    let (patch, entered_rx, release_tx) = blocking_two_stage();
    coordinator.register(Arc::new(patch));

    let activation = coordinator.enable("two-stage");
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(backend.count_owned_by("two-stage"), 1);

    assert_eq!(coordinator.disable("two-stage"), DisableOutcome::Cancelled);
    release_tx.send(()).unwrap();

    assert_eq!(activation.await, EnableOutcome::Cancelled);
    assert!(!coordinator.is_active("two-stage"));
    assert!(!coordinator.is_waiting_for_load("two-stage"));
    assert_eq!(backend.count_owned_by("two-stage"), 0);
}

fn blocking_two_stage() -> (TwoStagePatch, mpsc::Receiver<()>, mpsc::Sender<()>) {
    let (entered_tx, entered_rx) = mpsc::channel();
    let (release_tx, release_rx) = mpsc::channel();
    let patch = TwoStagePatch {
        second: Mutex::new(Some(BlockingTargets {
            entered: Mutex::new(Some(entered_tx)),
            release: Mutex::new(release_rx),
            target: method("Scene", "Pick"),
        })),
    };
    (patch, entered_rx, release_tx)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reenable_waits_for_cancelled_rollback() {
    let (coordinator, backend, _) = memory_coordinator();
    let (patch, entered_rx, release_tx) = blocking_two_stage();
    coordinator.register(Arc::new(patch));

    let first = coordinator.enable("two-stage");
    tokio::task::spawn_blocking(move || entered_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(coordinator.disable("two-stage"), DisableOutcome::Cancelled);

    let second = coordinator.enable("two-stage");
    assert!(coordinator.is_waiting_for_load("two-stage"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!second.is_finished());
    assert_eq!(backend.count_owned_by("two-stage"), 1);

    release_tx.send(()).unwrap();
    assert_eq!(first.await, EnableOutcome::Cancelled);
    assert_eq!(second.await, EnableOutcome::Enabled);
    assert!(coordinator.is_active("two-stage"));
    assert_eq!(backend.count_owned_by("two-stage"), 2);
    assert_eq!(backend.redirects(&method("Scene", "Draw")).before.len(), 1);
    assert_eq!(backend.redirects(&method("Scene", "Pick")).before.len(), 1);
}

#[tokio::test]
async fn test_debug_patch_activates_first() {
    let (coordinator, backend, settings) = memory_coordinator();
    settings.set_debug_log_enabled(true).unwrap();
    persisted(settings.as_ref(), &[INTERCEPTION_LOG_PATCH_ID, "B"]);

    let debug_ready = Arc::new(AtomicBool::new(false));
    coordinator.register(TestPatch::single("B", method("Window", "Repaint")).arc());
    coordinator.register(
        TestPatch::gated(
            INTERCEPTION_LOG_PATCH_ID,
            method("interception::FileLog", "log"),
            Arc::clone(&debug_ready),
        )
        .arc(),
    );

    let activations = coordinator.replay_persisted();
    assert_eq!(activations.len(), 2);
    tokio::time::sleep(Duration::from_millis(80)).await;
    assert!(backend.history().is_empty());
    assert!(!coordinator.is_active("B"));
    assert!(coordinator.is_waiting_for_load("B"));

    debug_ready.store(true, Ordering::SeqCst);
    for activation in activations {
        assert_eq!(activation.await, EnableOutcome::Enabled);
    }

    let owners: Vec<_> = backend.history().into_iter().map(|h| h.owner).collect();
    assert_eq!(owners, vec![INTERCEPTION_LOG_PATCH_ID.to_string(), "B".to_string()]);
}

#[tokio::test]
async fn test_debug_gate_ignored_when_debug_logging_off() {
    let (coordinator, _, settings) = memory_coordinator();
    persisted(settings.as_ref(), &[INTERCEPTION_LOG_PATCH_ID]);

    let never = Arc::new(AtomicBool::new(false));
    coordinator.register(
        TestPatch::gated(INTERCEPTION_LOG_PATCH_ID, method("interception::FileLog", "log"), never)
            .arc(),
    );
    coordinator.register(TestPatch::single("B", method("Window", "Repaint")).arc());

    let _debug = coordinator.enable(INTERCEPTION_LOG_PATCH_ID);
    let outcome = tokio::time::timeout(Duration::from_secs(2), coordinator.enable("B")).await;
    assert_eq!(outcome.unwrap(), EnableOutcome::Enabled);
    coordinator.disable(INTERCEPTION_LOG_PATCH_ID);
}

#[tokio::test]
async fn test_disable_all_preserves_or_resets_persistence() {
    let (coordinator, _, settings) = memory_coordinator();
    coordinator.register(TestPatch::single("a", method("A", "a")).arc());
    coordinator.register(TestPatch::single("b", method("B", "b")).arc());
    coordinator.enable("a").await;
    coordinator.enable("b").await;

    assert_eq!(coordinator.disable_all(false), 2);
    assert!(!coordinator.is_active("a"));
    assert!(settings.persisted_active("a"));
    assert!(settings.persisted_active("b"));

    coordinator.enable("a").await;
    assert_eq!(coordinator.disable_all_patches(), 1);
    assert!(!settings.persisted_active("a"));
}

#[tokio::test]
async fn test_non_persistent_provider_is_not_written() {
    let (coordinator, _, settings) = memory_coordinator();
    coordinator.register(TestPatch::single("temp", method("A", "a")).not_persistent().arc());

    assert_eq!(coordinator.enable("temp").await, EnableOutcome::Enabled);
    assert_eq!(settings.persisted_state("temp"), None);
}

#[tokio::test]
async fn test_invalidate_units_repopulates_on_next_enable() {
    let (coordinator, _, _) = memory_coordinator();
    let patch = TestPatch::single("A", method("A", "a")).arc();
    coordinator.register(patch.clone());
    coordinator.enable("A").await;
    coordinator.disable("A");
    assert_eq!(patch.populated_count(), 1);

    assert!(coordinator.invalidate_units("A"));
    assert_eq!(coordinator.enable("A").await, EnableOutcome::Enabled);
    assert_eq!(patch.populated_count(), 2);
    assert!(!coordinator.invalidate_units("missing"));
}
