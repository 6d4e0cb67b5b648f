//! Optional modules shipped with the app. Each one registers its entry
//! point when the loader brings it in.

mod advanced_search;
mod analytics;
mod premium;

use crate::delivery::resolver::{ModuleInit, ModuleLoader};

pub fn loader() -> ModuleLoader {
    ModuleLoader::new([
        (analytics::MODULE_ID, analytics::init as ModuleInit),
        (premium::MODULE_ID, premium::init as ModuleInit),
        (advanced_search::MODULE_ID, advanced_search::init as ModuleInit),
    ])
}
