use crate::delivery::backend::InstallBackend;
use crate::delivery::config::DeliveryMode;
use crate::delivery::model::ModuleId;
use parking_lot::RwLock;
use std::collections::HashSet;
use std::sync::Arc;

/// Modules "installed" by simulated sessions. Lives for the process only.
#[derive(Clone, Default)]
pub struct SimulatedInstallSet {
    ids: Arc<RwLock<HashSet<ModuleId>>>,
}

impl SimulatedInstallSet {
    pub fn contains(&self, module: &str) -> bool {
        self.ids.read().contains(module)
    }

    pub fn snapshot(&self) -> HashSet<ModuleId> {
        self.ids.read().clone()
    }

    pub(super) fn insert(&self, module: &str) -> bool {
        self.ids.write().insert(module.to_string())
    }

    pub(super) fn remove(&self, module: &str) -> bool {
        self.ids.write().remove(module)
    }
}

/// Answers "is module X present" over the platform set and, in simulation
/// mode, the simulated set. Read-only.
#[derive(Clone)]
pub struct InstalledSetOracle {
    backend: Arc<dyn InstallBackend>,
    simulated: Option<SimulatedInstallSet>,
}

impl InstalledSetOracle {
    pub fn new(backend: Arc<dyn InstallBackend>, mode: DeliveryMode) -> Self {
        Self {
            backend,
            simulated: mode.is_simulated().then(SimulatedInstallSet::default),
        }
    }

    pub fn is_installed(&self, module: &str) -> bool {
        if self.backend.contains_module(module) {
            return true;
        }
        self.simulated
            .as_ref()
            .map(|s| s.contains(module))
            .unwrap_or(false)
    }

    pub fn installed_modules(&self) -> HashSet<ModuleId> {
        let mut all = self.backend.installed_modules();
        if let Some(s) = &self.simulated {
            all.extend(s.snapshot());
        }
        all
    }

    pub fn in_platform_set(&self, module: &str) -> bool {
        self.backend.contains_module(module)
    }

    pub(super) fn simulated(&self) -> Option<&SimulatedInstallSet> {
        self.simulated.as_ref()
    }
}
