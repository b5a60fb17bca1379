//! Source identifier to adapter instance mapping.
//!
//! Each source gets exactly one long-lived adapter, built on first use.
//! Concurrent first resolutions wait on the same cell, so only one
//! construction runs and every caller sees the same instance.

use std::sync::Arc;
use tokio::sync::OnceCell;

use crate::config::Config;
use crate::error::{AppError, SourceError};
use crate::models::Source;
use crate::sources::mangadex::MangaDexAdapter;
use crate::sources::mangaplus::MangaPlusAdapter;
use crate::sources::zonatmo::ZonaTmoAdapter;
use crate::sources::SourceAdapter;

pub type AdapterFactory = Arc<dyn Fn(Source) -> Result<Arc<dyn SourceAdapter>, AppError> + Send + Sync>;

pub struct AdapterRegistry {
    cells: [OnceCell<Arc<dyn SourceAdapter>>; 3],
    factory: AdapterFactory,
}

fn slot(source: Source) -> usize {
    match source {
        Source::MangaDex => 0,
        Source::ZonaTmo => 1,
        Source::MangaPlus => 2,
    }
}

impl AdapterRegistry {
    pub fn new(factory: AdapterFactory) -> Self {
        Self { cells: [OnceCell::new(), OnceCell::new(), OnceCell::new()], factory }
    }

    /// Registry building the real network adapters from configuration.
    pub fn from_config(config: &Config) -> Self {
        let config = config.clone();
        Self::new(Arc::new(move |source| build_adapter(&config, source)))
    }

    pub async fn resolve(&self, source: Source) -> Result<Arc<dyn SourceAdapter>, AppError> {
        let adapter = self.cells[slot(source)]
            .get_or_try_init(|| async {
                log::info!("Initializing {} adapter", source.display_name());
                (self.factory)(source)
            })
            .await?;
        Ok(adapter.clone())
    }

    /// Resolve by identifier; unknown identifiers are a configuration error.
    pub async fn resolve_name(&self, name: &str) -> Result<Arc<dyn SourceAdapter>, AppError> {
        let source: Source = name.parse()?;
        self.resolve(source).await
    }

    /// Sources whose adapter has already been constructed.
    pub fn initialized(&self) -> Vec<Source> {
        Source::ALL.into_iter().filter(|s| self.cells[slot(*s)].initialized()).collect()
    }
}

fn build_adapter(config: &Config, source: Source) -> Result<Arc<dyn SourceAdapter>, AppError> {
    let http = config.http.client_config();
    let built: Result<Arc<dyn SourceAdapter>, SourceError> = match source {
        Source::MangaDex => {
            MangaDexAdapter::new(config.sources.mangadex.clone(), http).map(|a| Arc::new(a) as _)
        }
        Source::ZonaTmo => {
            ZonaTmoAdapter::new(config.sources.zonatmo.clone(), http).map(|a| Arc::new(a) as _)
        }
        Source::MangaPlus => {
            MangaPlusAdapter::new(config.sources.mangaplus.clone(), http).map(|a| Arc::new(a) as _)
        }
    };
    built.map_err(|reason| AppError::AdapterInit { origin: source, reason })
}
