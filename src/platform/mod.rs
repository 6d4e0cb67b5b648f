pub mod fetch;
pub mod service;
pub mod store;
