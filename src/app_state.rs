//! Application state for the Actix-web server
//!
//! `AppState` is the explicit context the handlers and the pipeline share:
//! the adapter registry, the persisted store, blob storage, metrics and a
//! shutdown token every request token derives from.

use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::blob::{BlobStore, LocalBlobStore};
use crate::config::Config;
use crate::error::AppError;
use crate::http_client::EnhancedHttpClient;
use crate::metrics::MetricsTracker;
use crate::pipeline::SyncPipeline;
use crate::registry::AdapterRegistry;
use crate::store::{SqliteStore, Store};

pub struct AppState {
    pub config: Config,
    pub registry: Arc<AdapterRegistry>,
    pub store: Arc<dyn Store>,
    pub metrics: Arc<MetricsTracker>,
    pub pipeline: SyncPipeline,
    /// Cancelled on shutdown; aborts in-flight syncs.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: Config,
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        let metrics = Arc::new(MetricsTracker::new());
        let pipeline = SyncPipeline::new(
            registry.clone(),
            store.clone(),
            blobs,
            metrics.clone(),
            config.search_timeout(),
        );
        Self { config, registry, store, metrics, pipeline, shutdown: CancellationToken::new() }
    }

    /// Production wiring: SQLite catalog, local blob directory, real adapters.
    pub fn from_config(config: Config) -> Result<Self, AppError> {
        let store = SqliteStore::open(&config.database.path)?;
        let http = EnhancedHttpClient::with_config(config.http.client_config())
            .map_err(|e| AppError::Configuration(format!("blob http client: {}", e)))?;
        let blobs = LocalBlobStore::new(&config.storage.root, &config.storage.public_base_url, http);
        let registry = Arc::new(AdapterRegistry::from_config(&config));

        log::info!("Catalog database: {}", config.database.path);
        log::info!("Blob storage root: {}", config.storage.root);
        Ok(Self::new(config, registry, Arc::new(store), Arc::new(blobs)))
    }

    /// Token for one request, cancelled with the server.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
