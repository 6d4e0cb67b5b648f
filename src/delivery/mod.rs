pub mod backend;
pub mod config;
pub mod engine;
pub mod model;
pub mod oracle;
pub mod registry;
pub mod resolver;
pub mod simulated;
pub mod state;
pub mod unpack;
