use crate::delivery::resolver::{EntryPointRegistry, FeatureEntry, NavigateBack, Screen};

pub const MODULE_ID: &str = "featurepremium";

struct PremiumEntry;

impl FeatureEntry for PremiumEntry {
    fn content(&self, on_navigate_back: NavigateBack) -> Screen {
        Screen::new(
            "VIP membership",
            vec![
                "Free delivery on every order".to_string(),
                "10% off organic produce".to_string(),
                "Early access to weekly deals".to_string(),
            ],
            on_navigate_back,
        )
    }
}

fn create() -> anyhow::Result<Box<dyn FeatureEntry>> {
    Ok(Box::new(PremiumEntry))
}

pub fn init(registry: &EntryPointRegistry) {
    registry.register(MODULE_ID, create);
}
