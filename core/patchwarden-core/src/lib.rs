//! # patchwarden-core
//!
//! Lifecycle coordinator for runtime method-interception patches inside a
//! host process. Patches are grouped under string identities that can be
//! enabled, disabled and persisted across restarts, while the actual
//! redirection is delegated to an [`Interceptor`] backend.
//!
//! ## Design Principles
//!
//! - **Contained failures**: a patch that fails to apply is logged and skipped;
//!   nothing here aborts the host
//! - **Cancellable activations**: `disable` is the cancel path for an in-flight
//!   `enable`, and partial redirects are rolled back
//! - **Explicit registration**: patch modules self-register with
//!   [`declare_patch!`] and [`register_provider!`] instead of type scanning
//! - **Graceful degradation**: missing or corrupt settings start empty
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use patchwarden_core::{
//!     Collector, Coordinator, FileSettings, InventorySource, MemoryInterceptor, StoragePaths,
//! };
//!
//! let paths = StoragePaths::resolve()?;
//! let settings = Arc::new(FileSettings::load(&paths.settings_file())?);
//! let coordinator = Coordinator::new(Arc::new(MemoryInterceptor::new()), settings)?;
//! let collector = Collector::new(coordinator.clone(), Arc::new(InventorySource), Default::default());
//! for activation in collector.bootstrap().await {
//!     activation.await;
//! }
//! ```

pub mod adapter;
pub mod builtin;
pub mod collector;
pub mod config;
pub mod coordinator;
pub mod declare;
pub mod error;
pub mod interception;
pub mod locate;
pub mod provider;
pub mod settings;
pub mod storage;
pub mod types;
pub mod unit;

#[doc(hidden)]
pub use inventory;

pub use adapter::{is_managed_owner, IndependentAdapter, ManagedPatch, MANAGED_MARKER};
pub use builtin::{InterceptionLogPatch, INTERCEPTION_LOG_PATCH_ID};
pub use collector::{CollectReport, Collector, Startup};
pub use config::{load_config, CollectorConfig, CoordinatorConfig, PatchwardenConfig};
pub use coordinator::{Activation, Coordinator, CoordinatorBuilder};
pub use declare::{
    DeclarationSource, DeclaredProvider, InventorySource, PatchDeclaration, StaticSource,
};
pub use error::{InterceptError, PatchError, Result};
pub use interception::{
    Interceptor, MemoryInterceptor, RedirectEntry, RedirectInfo, SlotHandle, SlotSet,
};
pub use locate::{SourceLocator, SourceTreeLocator};
pub use provider::{PatchHandle, PatchProvider};
pub use settings::{FileSettings, MemorySettings, PatchSetting, SettingsStore};
pub use storage::StoragePaths;
pub use types::*;
pub use unit::{CachedUnit, PatchUnit, StaticUnit};
