pub mod api;
pub mod config;
pub mod engine;
pub mod hub;
pub mod ledger;
pub mod metrics;
pub mod signal;
pub mod worker_registry;

pub use config::HubConfig;
pub use hub::Hub;
