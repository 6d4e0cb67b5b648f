use crate::delivery::model::ModuleId;
use crate::delivery::oracle::InstalledSetOracle;
use crate::delivery::registry::ModuleRegistry;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet};
use std::fmt;

pub type NavigateBack = Box<dyn FnOnce() + Send>;

/// Something a feature module hands back to the host to display.
pub struct Screen {
    pub title: String,
    pub lines: Vec<String>,
    back: Option<NavigateBack>,
}

impl Screen {
    pub fn new(title: impl Into<String>, lines: Vec<String>, on_navigate_back: NavigateBack) -> Self {
        Self {
            title: title.into(),
            lines,
            back: Some(on_navigate_back),
        }
    }

    pub fn render(&self) -> String {
        let mut out = format!("== {} ==\n", self.title);
        for l in &self.lines {
            out.push_str(l);
            out.push('\n');
        }
        out
    }

    /// Runs the back callback once; later calls do nothing.
    pub fn navigate_back(&mut self) {
        if let Some(back) = self.back.take() {
            back();
        }
    }
}

impl fmt::Debug for Screen {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Screen")
            .field("title", &self.title)
            .field("lines", &self.lines.len())
            .finish()
    }
}

/// The one operation an optional module exposes to the host.
pub trait FeatureEntry: Send + Sync {
    fn content(&self, on_navigate_back: NavigateBack) -> Screen;
}

pub type EntryFactory = fn() -> anyhow::Result<Box<dyn FeatureEntry>>;

/// Filled by modules as they load; read by the resolver.
#[derive(Default)]
pub struct EntryPointRegistry {
    factories: RwLock<HashMap<ModuleId, EntryFactory>>,
}

impl EntryPointRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, module: &str, factory: EntryFactory) {
        tracing::debug!("[ENTRY] registered entry point for {}", module);
        self.factories.write().insert(module.to_string(), factory);
    }

    pub fn factory(&self, module: &str) -> Option<EntryFactory> {
        self.factories.read().get(module).copied()
    }
}

/// Load hook of one module: called once, registers the module's entry point.
pub type ModuleInit = fn(&EntryPointRegistry);

/// Modules whose code can be brought into the process, keyed by id.
pub struct ModuleLoader {
    splits: HashMap<ModuleId, ModuleInit>,
    loaded: Mutex<HashSet<ModuleId>>,
}

impl ModuleLoader {
    pub fn new(splits: impl IntoIterator<Item = (&'static str, ModuleInit)>) -> Self {
        Self {
            splits: splits.into_iter().map(|(id, f)| (id.to_string(), f)).collect(),
            loaded: Mutex::new(HashSet::new()),
        }
    }

    /// Runs the module's load hook the first time; idempotent afterwards.
    pub fn ensure_loaded(&self, module: &str, registry: &EntryPointRegistry) -> bool {
        let mut loaded = self.loaded.lock();
        if loaded.contains(module) {
            return true;
        }
        match self.splits.get(module) {
            Some(init) => {
                init(registry);
                loaded.insert(module.to_string());
                tracing::info!("[LOADER] loaded module code for {}", module);
                true
            }
            None => false,
        }
    }

    pub fn is_loaded(&self, module: &str) -> bool {
        self.loaded.lock().contains(module)
    }
}

/// Capability to activate one module's UI. Created per resolution.
pub struct EntryPointHandle {
    module: ModuleId,
    entry: Box<dyn FeatureEntry>,
}

impl EntryPointHandle {
    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn content(&self, on_navigate_back: NavigateBack) -> Screen {
        self.entry.content(on_navigate_back)
    }
}

pub struct EntryPointResolver {
    registry: EntryPointRegistry,
    loader: ModuleLoader,
}

impl EntryPointResolver {
    pub fn new(loader: ModuleLoader) -> Self {
        Self {
            registry: EntryPointRegistry::new(),
            loader,
        }
    }

    /// `None` is an ordinary answer: the module may not be loadable yet, or
    /// its entry point may be missing or broken.
    pub fn resolve(&self, module: &str) -> Option<EntryPointHandle> {
        if !self.loader.ensure_loaded(module, &self.registry) {
            tracing::debug!("[RESOLVE] no loadable code for {}", module);
        }

        let factory = match self.registry.factory(module) {
            Some(f) => f,
            None => {
                tracing::warn!("[RESOLVE] no entry point registered for {}", module);
                return None;
            }
        };

        match factory() {
            Ok(entry) => Some(EntryPointHandle {
                module: module.to_string(),
                entry,
            }),
            Err(e) => {
                tracing::warn!("[RESOLVE] entry point for {} failed to instantiate: {:#}", module, e);
                None
            }
        }
    }
}

/// What the host shows when a user opens a module.
#[derive(Debug)]
pub enum FeatureView {
    Loaded(Screen),
    /// Installed but the entry point could not be resolved.
    Fallback(Screen),
    NotInstalled,
}

pub fn open_feature(
    oracle: &InstalledSetOracle,
    resolver: &EntryPointResolver,
    registry: &ModuleRegistry,
    module: &str,
    on_navigate_back: NavigateBack,
) -> FeatureView {
    if !oracle.is_installed(module) {
        return FeatureView::NotInstalled;
    }

    match resolver.resolve(module) {
        Some(handle) => FeatureView::Loaded(handle.content(on_navigate_back)),
        None => {
            let name = registry.display_name(module);
            FeatureView::Fallback(Screen::new(
                name,
                vec![
                    format!("{} is installed.", name),
                    "Its screen could not be loaded right now; try again shortly.".to_string(),
                ],
                on_navigate_back,
            ))
        }
    }
}
