use crate::delivery::resolver::{EntryPointRegistry, FeatureEntry, NavigateBack, Screen};

pub const MODULE_ID: &str = "featureanalytics";

struct AnalyticsEntry;

impl FeatureEntry for AnalyticsEntry {
    fn content(&self, on_navigate_back: NavigateBack) -> Screen {
        Screen::new(
            "Advanced analytics",
            vec![
                "Orders this month: 12".to_string(),
                "Spent: 3,450,000 VND".to_string(),
                "Top category: fresh vegetables".to_string(),
            ],
            on_navigate_back,
        )
    }
}

fn create() -> anyhow::Result<Box<dyn FeatureEntry>> {
    Ok(Box::new(AnalyticsEntry))
}

pub fn init(registry: &EntryPointRegistry) {
    registry.register(MODULE_ID, create);
}
