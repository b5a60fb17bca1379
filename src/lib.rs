// Library interface for mangaflow
// The binary and the integration tests build on these modules.

pub mod api;
pub mod app_state;
pub mod blob;
pub mod config;
pub mod error;
pub mod http_client;
pub mod logging;
pub mod metrics;
pub mod models;
pub mod pipeline;
pub mod reconcile;
pub mod registry;
pub mod sources;
pub mod store;
