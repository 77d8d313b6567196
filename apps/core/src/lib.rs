pub mod config;
pub mod contract;
pub mod debounce;
pub mod engine;
pub mod event_source;
pub mod logging;
pub mod model;
pub mod package_source;
pub mod pin_store;
pub mod registry;
pub mod runtime;
pub mod search;
pub mod transport;
pub mod uninstall;
