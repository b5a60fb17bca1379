//! Sync orchestration: search fan-out, full and chapter sync, lazy page
//! fill, page mirroring and catalog maintenance.
//!
//! Every operation takes a [`CancellationToken`]. Adapter and blob calls
//! race against it, and a cancelled operation returns
//! [`AppError::Cancelled`] after dropping its in-flight requests.

use futures::FutureExt;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::blob::{chapter_folder, image_extension, page_path, BlobSource, BlobStore};
use crate::error::{AppError, SourceError};
use crate::metrics::{track_list, track_request, MetricsTracker};
use crate::models::{
    Chapter, Page, PaginatedResponse, PaginationInfo, Source, Stats, Work, WorkSummary,
};
use crate::reconcile::Reconciler;
use crate::registry::AdapterRegistry;
use crate::sources::SourceAdapter;
use crate::store::Store;

pub const MAX_PAGE_SIZE: u32 = 100;
const LOCAL_SEARCH_LIMIT: u32 = 50;

/// Combined search output. Results are not deduplicated across sources.
#[derive(Debug, Clone, Serialize)]
pub struct SearchResults {
    pub local: Vec<Work>,
    pub external: Vec<WorkSummary>,
    /// Sources that panicked, could not be resolved, or missed the deadline.
    pub degraded: Vec<Source>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub work: Work,
    /// All chapters of the work after the sync, ascending.
    pub chapters: Vec<Chapter>,
}

/// Race `fut` against cancellation.
pub async fn cancellable<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, AppError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(AppError::Cancelled),
        out = fut => Ok(out),
    }
}

fn ensure_active(cancel: &CancellationToken) -> Result<(), AppError> {
    if cancel.is_cancelled() {
        Err(AppError::Cancelled)
    } else {
        Ok(())
    }
}

pub struct SyncPipeline {
    registry: Arc<AdapterRegistry>,
    store: Arc<dyn Store>,
    reconciler: Reconciler,
    blobs: Arc<dyn BlobStore>,
    metrics: Arc<MetricsTracker>,
    search_timeout: Duration,
    page_fills: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl SyncPipeline {
    pub fn new(
        registry: Arc<AdapterRegistry>,
        store: Arc<dyn Store>,
        blobs: Arc<dyn BlobStore>,
        metrics: Arc<MetricsTracker>,
        search_timeout: Duration,
    ) -> Self {
        Self {
            reconciler: Reconciler::new(store.clone()),
            registry,
            store,
            blobs,
            metrics,
            search_timeout,
            page_fills: Mutex::new(HashMap::new()),
        }
    }

    pub fn metrics(&self) -> &MetricsTracker {
        &self.metrics
    }

    /// Query the local catalog and the given sources concurrently.
    ///
    /// A source that fails, panics or misses the search deadline contributes
    /// nothing and is listed in `degraded`; the other results still return.
    /// Sources without text search are skipped and not degraded.
    pub async fn search(
        &self,
        query: &str,
        sources: &[Source],
        cancel: &CancellationToken,
    ) -> Result<SearchResults, AppError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AppError::InvalidInput("search query must not be empty".to_string()));
        }

        let sources: BTreeSet<Source> = sources.iter().copied().collect();
        let mut tasks = JoinSet::new();
        for source in sources.iter().copied() {
            let registry = self.registry.clone();
            let metrics = self.metrics.clone();
            let query = query.to_string();
            tasks.spawn(async move {
                let search = async {
                    let adapter = registry.resolve(source).await?;
                    if !adapter.supports_search() {
                        log::debug!("[{}] text search unsupported, skipping", source);
                        return Ok(Vec::new());
                    }
                    Ok::<_, AppError>(track_list(&metrics, source, adapter.fetch_search(&query)).await)
                };
                match AssertUnwindSafe(search).catch_unwind().await {
                    Ok(Ok(results)) => (source, Some(results)),
                    Ok(Err(e)) => {
                        log::warn!("[{}] search unavailable: {}", source, e);
                        (source, None)
                    }
                    Err(_) => {
                        log::error!("[{}] search task panicked", source);
                        metrics.record_failure(source, "search panicked".to_string());
                        (source, None)
                    }
                }
            });
        }

        let local = cancellable(cancel, self.store.search_works(query, LOCAL_SEARCH_LIMIT)).await??;

        let mut pending = sources.clone();
        let mut by_source: BTreeMap<Source, Vec<WorkSummary>> = BTreeMap::new();
        let deadline = tokio::time::sleep(self.search_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    tasks.abort_all();
                    return Err(AppError::Cancelled);
                }
                _ = &mut deadline => {
                    log::warn!("Search deadline reached, {} source(s) still pending", pending.len());
                    tasks.abort_all();
                    break;
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok((source, Some(results)))) => {
                        pending.remove(&source);
                        by_source.insert(source, results);
                    }
                    Some(Ok((_, None))) => {}
                    Some(Err(e)) => log::error!("Search task failed to join: {}", e),
                    None => break,
                },
            }
        }

        let degraded = sources.iter().copied().filter(|s| !by_source.contains_key(s)).collect();
        Ok(SearchResults {
            local,
            external: by_source.into_values().flatten().collect(),
            degraded,
        })
    }

    /// Fetch a work from a source, reconcile it, then reconcile its chapters.
    pub async fn sync_work(
        &self,
        source: Source,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncOutcome, AppError> {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            return Err(AppError::InvalidInput("external id must not be empty".to_string()));
        }
        let adapter = self.registry.resolve(source).await?;
        log::info!("Syncing {} work {}", source, external_id);

        let details = cancellable(cancel, track_request(&self.metrics, source, adapter.get_work_details(external_id)))
            .await?
            .map_err(|e| AppError::source_fetch(source, e))?;
        let work = self.reconciler.reconcile_work(source, &details).await?;

        self.reconcile_chapters(adapter.as_ref(), &work, external_id, cancel).await?;
        let chapters = self.store.list_chapters(&work.id).await?;
        log::info!("Synced {} work {} with {} chapter(s)", source, work.id, chapters.len());
        Ok(SyncOutcome { work, chapters })
    }

    /// Refresh the chapter list of a stored work from its first binding.
    pub async fn sync_chapters(&self, work_id: &str, cancel: &CancellationToken) -> Result<Vec<Chapter>, AppError> {
        let work = self.get_work(work_id).await?;
        let binding = work.bindings.first().ok_or_else(|| AppError::NoSourceBound(work.id.clone()))?;
        let adapter = self.registry.resolve(binding.source).await?;

        self.reconcile_chapters(adapter.as_ref(), &work, &binding.external_id, cancel).await?;
        Ok(self.store.list_chapters(&work.id).await?)
    }

    async fn reconcile_chapters(
        &self,
        adapter: &dyn SourceAdapter,
        work: &Work,
        external_id: &str,
        cancel: &CancellationToken,
    ) -> Result<usize, AppError> {
        let source = adapter.source();
        let listed = cancellable(cancel, track_list(&self.metrics, source, adapter.fetch_chapters(external_id))).await?;
        for info in &listed {
            ensure_active(cancel)?;
            self.reconciler.reconcile_chapter(&work.id, source, info).await?;
        }
        Ok(listed.len())
    }

    pub async fn list_works(&self, page: u32, limit: u32) -> Result<PaginatedResponse<Work>, AppError> {
        if page == 0 || limit == 0 || limit > MAX_PAGE_SIZE {
            return Err(AppError::InvalidInput(format!(
                "page must be >= 1 and limit between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        let offset = (page - 1).saturating_mul(limit);
        let mut data = self.store.list_works(offset, limit + 1).await?;
        let has_more = data.len() > limit as usize;
        data.truncate(limit as usize);
        Ok(PaginatedResponse { data, pagination: PaginationInfo { page, limit, has_more } })
    }

    pub async fn get_work(&self, work_id: &str) -> Result<Work, AppError> {
        self.store
            .find_work(work_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("work {}", work_id)))
    }

    pub async fn list_chapters(&self, work_id: &str) -> Result<Vec<Chapter>, AppError> {
        self.get_work(work_id).await?;
        Ok(self.store.list_chapters(work_id).await?)
    }

    /// Read a chapter, fetching and persisting its pages on first read.
    ///
    /// Concurrent reads of the same empty chapter share one adapter call.
    /// When the source reports no pages the chapter is returned as stored.
    pub async fn get_chapter(&self, chapter_id: &str, cancel: &CancellationToken) -> Result<Chapter, AppError> {
        let chapter = self.find_chapter(chapter_id).await?;
        if !chapter.pages.is_empty() {
            return Ok(chapter);
        }

        let gate = self.page_fill_gate(chapter_id);
        let filled = async {
            let _turn = cancellable(cancel, gate.lock()).await?;
            // Another reader may have filled it while we waited.
            let chapter = self.find_chapter(chapter_id).await?;
            if !chapter.pages.is_empty() {
                return Ok(chapter);
            }

            let adapter = self.registry.resolve(chapter.source).await?;
            let listed = cancellable(
                cancel,
                track_list(&self.metrics, chapter.source, adapter.fetch_pages(&chapter.external_id)),
            )
            .await?;
            if listed.is_empty() {
                log::warn!("[{}] no pages for chapter {}, leaving it unchanged", chapter.source, chapter.id);
                return Ok(chapter);
            }
            let pages: Vec<Page> = listed.iter().map(Page::from).collect();
            log::info!("Filled {} page(s) for chapter {}", pages.len(), chapter.id);
            self.reconciler.fill_pages(&chapter, &pages).await
        }
        .await;
        self.release_page_fill_gate(chapter_id, gate);
        filled
    }

    fn page_fill_gate(&self, chapter_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut gates = self.page_fills.lock().unwrap_or_else(|p| p.into_inner());
        gates.entry(chapter_id.to_string()).or_default().clone()
    }

    fn release_page_fill_gate(&self, chapter_id: &str, gate: Arc<tokio::sync::Mutex<()>>) {
        let mut gates = self.page_fills.lock().unwrap_or_else(|p| p.into_inner());
        drop(gate);
        // Only the map's own reference left.
        if gates.get(chapter_id).is_some_and(|g| Arc::strong_count(g) == 1) {
            gates.remove(chapter_id);
        }
    }

    async fn find_chapter(&self, chapter_id: &str) -> Result<Chapter, AppError> {
        self.store
            .find_chapter(chapter_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("chapter {}", chapter_id)))
    }

    /// Mirror every page of a chapter into blob storage and mark it downloaded.
    pub async fn download_chapter(&self, chapter_id: &str, cancel: &CancellationToken) -> Result<Chapter, AppError> {
        let chapter = self.get_chapter(chapter_id, cancel).await?;
        if chapter.downloaded {
            return Ok(chapter);
        }
        if chapter.pages.is_empty() {
            return Err(AppError::source_fetch(
                chapter.source,
                SourceError::Missing(format!("pages of chapter {}", chapter.id)),
            ));
        }

        let folder = chapter_folder(&chapter.work_id, &chapter.id);
        if let Err(e) = self.mirror_pages(&chapter, cancel).await {
            if let Err(cleanup) = self.blobs.delete_folder(&folder).await {
                log::warn!("Could not clean up {} after failed download: {}", folder, cleanup);
            }
            return Err(e);
        }
        log::info!("Downloaded {} page(s) of chapter {} to {}", chapter.pages.len(), chapter.id, folder);
        Ok(self.store.mark_downloaded(&chapter.id, &folder).await?)
    }

    async fn mirror_pages(&self, chapter: &Chapter, cancel: &CancellationToken) -> Result<(), AppError> {
        for page in &chapter.pages {
            let path = page_path(&chapter.work_id, &chapter.id, page.number, image_extension(&page.image_url));
            cancellable(cancel, self.blobs.upload(BlobSource::Url(page.image_url.clone()), &path)).await??;
        }
        Ok(())
    }

    pub async fn list_downloaded(&self) -> Result<Vec<Chapter>, AppError> {
        Ok(self.store.list_downloaded().await?)
    }

    /// Delete a chapter with its pages and any mirrored images.
    pub async fn delete_chapter(&self, chapter_id: &str) -> Result<(), AppError> {
        let chapter = self.find_chapter(chapter_id).await?;
        let removed = self.blobs.delete_folder(&chapter_folder(&chapter.work_id, &chapter.id)).await?;
        self.store.delete_chapter(&chapter.id).await?;
        log::info!("Deleted chapter {} ({} mirrored file(s))", chapter.id, removed);
        Ok(())
    }

    /// Delete a work with its bindings, chapters and mirrored images.
    pub async fn delete_work(&self, work_id: &str) -> Result<(), AppError> {
        let work = self.get_work(work_id).await?;
        for chapter in self.store.list_chapters(&work.id).await? {
            self.blobs.delete_folder(&chapter_folder(&work.id, &chapter.id)).await?;
        }
        self.store.delete_work(&work.id).await?;
        log::info!("Deleted work {} ({})", work.id, work.title);
        Ok(())
    }

    pub async fn stats(&self) -> Result<Stats, AppError> {
        Ok(self.store.stats().await?)
    }
}
