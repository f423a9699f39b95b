//! Self-registration of patch declarations and providers.
//!
//! Patch modules submit a static entry at link time; the collector picks
//! them up at startup without any type scanning:
//!
//! ```rust,ignore
//! fn grid_unit() -> Box<dyn PatchUnit> {
//!     StaticUnit::new("grid")
//!         .target(MethodRef::new("SceneView", "OnGUI"))
//!         .before(SlotHandle::new("draw_grid", draw_grid as fn()))
//!         .boxed()
//! }
//!
//! declare_patch!("scene-view.grid", "Scene grid", "Draws a grid overlay", grid_unit);
//!
//! fn toolbar() -> Arc<dyn PatchProvider> {
//!     Arc::new(ToolbarPatch::default())
//! }
//!
//! register_provider!(toolbar);
//! ```

use std::sync::{Arc, Mutex, PoisonError};

use crate::adapter::MANAGED_MARKER;
use crate::provider::PatchProvider;
use crate::unit::PatchUnit;

/// One declared patch unit, wrapped by the collector into its own provider.
#[derive(Debug, Clone, Copy)]
pub struct PatchDeclaration {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
    /// Module path of the declaring code, used for source lookup.
    pub module: &'static str,
    pub build: fn() -> Box<dyn PatchUnit>,
}

inventory::collect!(PatchDeclaration);

/// A provider factory submitted with [`register_provider!`](crate::register_provider).
pub struct ProviderRegistration {
    pub build: fn() -> Arc<dyn PatchProvider>,
}

inventory::collect!(ProviderRegistration);

/// Declares a single-unit patch. `$build` must be a `fn() -> Box<dyn PatchUnit>`.
#[macro_export]
macro_rules! declare_patch {
    ($id:expr, $name:expr, $description:expr, $build:expr $(,)?) => {
        $crate::inventory::submit! {
            $crate::declare::PatchDeclaration {
                id: $id,
                name: $name,
                description: $description,
                module: module_path!(),
                build: $build,
            }
        }
    };
}

/// Registers a provider factory. `$build` must be a `fn() -> Arc<dyn PatchProvider>`.
#[macro_export]
macro_rules! register_provider {
    ($build:expr $(,)?) => {
        $crate::inventory::submit! {
            $crate::declare::ProviderRegistration { build: $build }
        }
    };
}

/// Where the collector finds declarations and self-registered providers.
pub trait DeclarationSource: Send + Sync {
    fn providers(&self) -> Vec<Arc<dyn PatchProvider>>;

    fn declarations(&self) -> Vec<PatchDeclaration>;
}

/// Everything submitted through the registration macros in this binary.
#[derive(Debug, Default, Clone, Copy)]
pub struct InventorySource;

impl DeclarationSource for InventorySource {
    fn providers(&self) -> Vec<Arc<dyn PatchProvider>> {
        inventory::iter::<ProviderRegistration>()
            .map(|reg| (reg.build)())
            .collect()
    }

    fn declarations(&self) -> Vec<PatchDeclaration> {
        let mut declarations: Vec<_> = inventory::iter::<PatchDeclaration>().copied().collect();
        declarations.sort_by_key(|decl| decl.id);
        declarations
    }
}

/// Explicitly populated source, for hosts that register by hand.
#[derive(Default)]
pub struct StaticSource {
    providers: Mutex<Vec<Arc<dyn PatchProvider>>>,
    declarations: Mutex<Vec<PatchDeclaration>>,
}

impl StaticSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_provider(&self, provider: Arc<dyn PatchProvider>) {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(provider);
    }

    pub fn add_declaration(&self, declaration: PatchDeclaration) {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(declaration);
    }
}

impl DeclarationSource for StaticSource {
    fn providers(&self) -> Vec<Arc<dyn PatchProvider>> {
        self.providers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn declarations(&self) -> Vec<PatchDeclaration> {
        self.declarations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Provider wrapping exactly one declaration.
///
/// Its redirects are owned by `<id>.managed` so the collector never
/// mistakes them for independently installed ones.
pub struct DeclaredProvider {
    declaration: PatchDeclaration,
    owner: String,
}

impl DeclaredProvider {
    pub fn new(declaration: PatchDeclaration) -> Self {
        Self {
            owner: format!("{}{}", declaration.id, MANAGED_MARKER),
            declaration,
        }
    }
}

impl PatchProvider for DeclaredProvider {
    fn id(&self) -> &str {
        self.declaration.id
    }

    fn display_name(&self) -> &str {
        self.declaration.name
    }

    fn description(&self) -> Option<&str> {
        Some(self.declaration.description).filter(|text| !text.is_empty())
    }

    fn owner_id(&self) -> String {
        self.owner.clone()
    }

    fn type_name(&self) -> &'static str {
        self.declaration.module
    }

    fn populate_units(&self, units: &mut Vec<Box<dyn PatchUnit>>) {
        units.push((self.declaration.build)());
    }
}
