use crate::delivery::model::ModuleDescriptor;
use crate::delivery::oracle::InstalledSetOracle;

/// Static metadata for one optional module.
#[derive(Debug, Clone, Copy)]
pub struct ModuleSpec {
    pub id: &'static str,
    pub display_name: &'static str,
    pub description: &'static str,
    pub size_label: &'static str,
}

pub const DEFAULT_MODULES: &[ModuleSpec] = &[
    ModuleSpec {
        id: "featureanalytics",
        display_name: "Advanced analytics",
        description: "Detailed reports on your shopping activity",
        size_label: "2.1 MB",
    },
    ModuleSpec {
        id: "featurepremium",
        display_name: "VIP membership",
        description: "Exclusive offers and free delivery",
        size_label: "1.8 MB",
    },
    ModuleSpec {
        id: "featureadvancedsearch",
        display_name: "Smart search",
        description: "AI product search by image and voice",
        size_label: "3.2 MB",
    },
];

pub struct ModuleRegistry {
    specs: Vec<ModuleSpec>,
}

impl ModuleRegistry {
    pub fn new(specs: Vec<ModuleSpec>) -> Self {
        Self { specs }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MODULES.to_vec())
    }

    pub fn find(&self, id: &str) -> Option<&ModuleSpec> {
        self.specs.iter().find(|s| s.id == id)
    }

    pub fn display_name<'a>(&'a self, id: &'a str) -> &'a str {
        self.find(id).map(|s| s.display_name).unwrap_or(id)
    }

    /// Descriptors with `installed` computed now; callers should not keep them
    /// past one refresh.
    pub fn describe(&self, oracle: &InstalledSetOracle) -> Vec<ModuleDescriptor> {
        let out: Vec<ModuleDescriptor> = self
            .specs
            .iter()
            .map(|s| ModuleDescriptor {
                id: s.id.to_string(),
                display_name: s.display_name.to_string(),
                description: s.description.to_string(),
                size_label: s.size_label.to_string(),
                installed: oracle.is_installed(s.id),
            })
            .collect();
        for d in &out {
            tracing::debug!("[REGISTRY] {} installed={}", d.id, d.installed);
        }
        out
    }
}
