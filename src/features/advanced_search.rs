use crate::delivery::resolver::{EntryPointRegistry, FeatureEntry, NavigateBack, Screen};

pub const MODULE_ID: &str = "featureadvancedsearch";

struct SearchEntry {
    suggestions: Vec<&'static str>,
}

impl FeatureEntry for SearchEntry {
    fn content(&self, on_navigate_back: NavigateBack) -> Screen {
        let mut lines = vec!["Search by photo or voice.".to_string()];
        lines.extend(self.suggestions.iter().map(|s| format!("  try: {}", s)));
        Screen::new("Smart search", lines, on_navigate_back)
    }
}

fn create() -> anyhow::Result<Box<dyn FeatureEntry>> {
    Ok(Box::new(SearchEntry {
        suggestions: vec!["bok choy", "dragon fruit", "jasmine rice"],
    }))
}

pub fn init(registry: &EntryPointRegistry) {
    registry.register(MODULE_ID, create);
}
