#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use mangaflow::blob::{BlobSource, BlobStore};
use mangaflow::error::{AppError, BlobError, SourceError, StoreError};
use mangaflow::metrics::MetricsTracker;
use mangaflow::models::{
    BindingKey, Chapter, ChapterAttributes, ChapterInfo, ChapterKey, Page, PageInfo, Source, Stats, Work,
    WorkAttributes, WorkDetails, WorkStatus, WorkSummary,
};
use mangaflow::pipeline::SyncPipeline;
use mangaflow::registry::AdapterRegistry;
use mangaflow::sources::SourceAdapter;
use mangaflow::store::{BindingUpdate, MemoryStore, Store};

/// How a fake adapter answers searches.
#[derive(Clone, Copy, PartialEq)]
pub enum SearchMode {
    Hits,
    Panic,
    Hang,
}

/// Scriptable in-process adapter.
pub struct FakeAdapter {
    pub source: Source,
    pub title: Mutex<String>,
    pub chapters: Mutex<Vec<ChapterInfo>>,
    pub pages: Mutex<Vec<PageInfo>>,
    pub search_mode: SearchMode,
    pub search_supported: bool,
    pub details_fail: bool,
    /// Chapter and page listings answer with an upstream error.
    pub lists_fail: bool,
    pub page_delay: Duration,
    pub page_calls: AtomicUsize,
    pub search_calls: AtomicUsize,
}

impl FakeAdapter {
    pub fn new(source: Source) -> Self {
        Self {
            source,
            title: Mutex::new("One Piece".to_string()),
            chapters: Mutex::new(Vec::new()),
            pages: Mutex::new(Vec::new()),
            search_mode: SearchMode::Hits,
            search_supported: true,
            details_fail: false,
            lists_fail: false,
            page_delay: Duration::ZERO,
            page_calls: AtomicUsize::new(0),
            search_calls: AtomicUsize::new(0),
        }
    }

    pub fn with_chapters(self, numbers: &[f64]) -> Self {
        self.set_chapters(numbers);
        self
    }

    pub fn with_pages(self, count: u32) -> Self {
        self.set_pages(count);
        self
    }

    pub fn set_chapters(&self, numbers: &[f64]) {
        *self.chapters.lock().unwrap() = numbers.iter().map(|n| chapter(*n)).collect();
    }

    pub fn set_pages(&self, count: u32) {
        *self.pages.lock().unwrap() = (1..=count)
            .map(|n| PageInfo {
                number: n,
                image_url: format!("https://img.example/{}.png", n),
                width: None,
                height: None,
            })
            .collect();
    }

    pub fn page_calls(&self) -> usize {
        self.page_calls.load(Ordering::SeqCst)
    }

    pub fn search_calls(&self) -> usize {
        self.search_calls.load(Ordering::SeqCst)
    }
}

pub fn chapter(number: f64) -> ChapterInfo {
    ChapterInfo {
        external_id: format!("ch-{}", number),
        number,
        title: Some(format!("Chapter {}", number)),
        volume: None,
        language: "en".to_string(),
        published_at: None,
        source_url: format!("https://example.org/chapter/{}", number),
    }
}

#[async_trait]
impl SourceAdapter for FakeAdapter {
    fn source(&self) -> Source {
        self.source
    }

    fn supports_search(&self) -> bool {
        self.search_supported
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<WorkSummary>, SourceError> {
        self.search_calls.fetch_add(1, Ordering::SeqCst);
        match self.search_mode {
            SearchMode::Panic => panic!("search exploded"),
            SearchMode::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(Vec::new())
            }
            SearchMode::Hits => Ok(vec![WorkSummary {
                external_id: format!("{}-1", self.source),
                title: format!("{} ({})", query, self.source),
                cover_url: None,
                description: None,
                source: self.source,
            }]),
        }
    }

    async fn get_work_details(&self, external_id: &str) -> Result<WorkDetails, SourceError> {
        if self.details_fail {
            return Err(SourceError::Status { url: format!("https://example.org/{}", external_id), status: 503 });
        }
        Ok(WorkDetails {
            external_id: external_id.to_string(),
            title: self.title.lock().unwrap().clone(),
            alt_titles: BTreeSet::from(["Wan Pisu".to_string()]),
            description: Some("Pirates".to_string()),
            cover_url: None,
            authors: vec!["Oda".to_string()],
            artists: vec!["Oda".to_string()],
            genres: BTreeSet::from(["Adventure".to_string()]),
            status: WorkStatus::Ongoing,
            year: Some(1997),
            source_url: format!("https://example.org/title/{}", external_id),
        })
    }

    async fn fetch_chapters(&self, external_id: &str) -> Result<Vec<ChapterInfo>, SourceError> {
        if self.lists_fail {
            return Err(SourceError::Status { url: format!("https://example.org/{}/chapters", external_id), status: 429 });
        }
        Ok(self.chapters.lock().unwrap().clone())
    }

    async fn fetch_pages(&self, external_chapter_id: &str) -> Result<Vec<PageInfo>, SourceError> {
        self.page_calls.fetch_add(1, Ordering::SeqCst);
        if !self.page_delay.is_zero() {
            tokio::time::sleep(self.page_delay).await;
        }
        if self.lists_fail {
            return Err(SourceError::Status { url: format!("https://example.org/{}/pages", external_chapter_id), status: 503 });
        }
        Ok(self.pages.lock().unwrap().clone())
    }
}

/// Registry serving prebuilt fakes; sources without a fake fail to resolve.
pub fn registry(adapters: Vec<Arc<FakeAdapter>>) -> Arc<AdapterRegistry> {
    let by_source: HashMap<Source, Arc<FakeAdapter>> = adapters.into_iter().map(|a| (a.source, a)).collect();
    Arc::new(AdapterRegistry::new(Arc::new(move |source| {
        by_source
            .get(&source)
            .map(|a| a.clone() as Arc<dyn SourceAdapter>)
            .ok_or_else(|| AppError::Configuration(format!("no fake for {}", source)))
    })))
}

/// Blob store keeping uploads in memory; uploads of `fail_on` URLs fail.
#[derive(Default)]
pub struct MemoryBlobs {
    pub objects: Mutex<HashMap<String, String>>,
    pub fail_on: Option<String>,
}

#[async_trait]
impl BlobStore for MemoryBlobs {
    async fn upload(&self, source: BlobSource, path: &str) -> Result<String, BlobError> {
        let origin = match source {
            BlobSource::Url(url) => url,
            BlobSource::Bytes(bytes) => format!("{} bytes", bytes.len()),
        };
        if self.fail_on.as_deref() == Some(origin.as_str()) {
            return Err(BlobError::Fetch(SourceError::Status { url: origin, status: 404 }));
        }
        self.objects.lock().unwrap().insert(path.to_string(), origin);
        Ok(path.to_string())
    }

    async fn signed_url(&self, path: &str, _ttl: Duration) -> Result<String, BlobError> {
        Ok(format!("mem://{}?signed", path))
    }

    fn public_url(&self, path: &str) -> String {
        format!("mem://{}", path)
    }

    async fn delete(&self, path: &str) -> Result<bool, BlobError> {
        Ok(self.objects.lock().unwrap().remove(path).is_some())
    }

    async fn delete_folder(&self, prefix: &str) -> Result<usize, BlobError> {
        let mut objects = self.objects.lock().unwrap();
        let before = objects.len();
        objects.retain(|path, _| !path.starts_with(&format!("{}/", prefix)));
        Ok(before - objects.len())
    }

    async fn exists(&self, path: &str) -> Result<bool, BlobError> {
        Ok(self.objects.lock().unwrap().contains_key(path))
    }
}

pub struct Harness {
    pub store: Arc<dyn Store>,
    pub blobs: Arc<MemoryBlobs>,
    pub pipeline: Arc<SyncPipeline>,
}

pub fn harness(adapters: Vec<Arc<FakeAdapter>>) -> Harness {
    harness_with(adapters, Arc::new(MemoryStore::new()), MemoryBlobs::default(), Duration::from_secs(5))
}

pub fn harness_with(
    adapters: Vec<Arc<FakeAdapter>>,
    store: Arc<dyn Store>,
    blobs: MemoryBlobs,
    search_timeout: Duration,
) -> Harness {
    let blobs = Arc::new(blobs);
    let pipeline = Arc::new(SyncPipeline::new(
        registry(adapters),
        store.clone(),
        blobs.clone() as Arc<dyn BlobStore>,
        Arc::new(MetricsTracker::new()),
        search_timeout,
    ));
    Harness { store, blobs, pipeline }
}

/// Store wrapper that yields before every read, widening the window
/// between a lookup and the create that follows it. Optionally hides
/// bindings from `find_work`.
pub struct YieldingStore {
    pub inner: MemoryStore,
    pub hide_bindings: bool,
}

impl YieldingStore {
    pub fn new() -> Self {
        Self { inner: MemoryStore::new(), hide_bindings: false }
    }
}

#[async_trait]
impl Store for YieldingStore {
    async fn find_work(&self, id: &str) -> Result<Option<Work>, StoreError> {
        tokio::task::yield_now().await;
        let found = self.inner.find_work(id).await?;
        Ok(found.map(|mut w| {
            if self.hide_bindings {
                w.bindings.clear();
            }
            w
        }))
    }

    async fn find_work_by_binding(&self, key: &BindingKey) -> Result<Option<Work>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.find_work_by_binding(key).await
    }

    async fn list_works(&self, offset: u32, limit: u32) -> Result<Vec<Work>, StoreError> {
        self.inner.list_works(offset, limit).await
    }

    async fn search_works(&self, query: &str, limit: u32) -> Result<Vec<Work>, StoreError> {
        self.inner.search_works(query, limit).await
    }

    async fn create_work(&self, attrs: &WorkAttributes, binding: &BindingUpdate) -> Result<Work, StoreError> {
        tokio::task::yield_now().await;
        self.inner.create_work(attrs, binding).await
    }

    async fn update_work(&self, id: &str, attrs: &WorkAttributes, binding: &BindingUpdate) -> Result<Work, StoreError> {
        self.inner.update_work(id, attrs, binding).await
    }

    async fn delete_work(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_work(id).await
    }

    async fn find_chapter(&self, id: &str) -> Result<Option<Chapter>, StoreError> {
        self.inner.find_chapter(id).await
    }

    async fn find_chapter_by_key(&self, key: &ChapterKey) -> Result<Option<Chapter>, StoreError> {
        tokio::task::yield_now().await;
        self.inner.find_chapter_by_key(key).await
    }

    async fn create_chapter(
        &self,
        key: &ChapterKey,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        tokio::task::yield_now().await;
        self.inner.create_chapter(key, attrs, pages).await
    }

    async fn update_chapter(
        &self,
        id: &str,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        self.inner.update_chapter(id, attrs, pages).await
    }

    async fn list_chapters(&self, work_id: &str) -> Result<Vec<Chapter>, StoreError> {
        self.inner.list_chapters(work_id).await
    }

    async fn mark_downloaded(&self, id: &str, download_path: &str) -> Result<Chapter, StoreError> {
        self.inner.mark_downloaded(id, download_path).await
    }

    async fn list_downloaded(&self) -> Result<Vec<Chapter>, StoreError> {
        self.inner.list_downloaded().await
    }

    async fn delete_chapter(&self, id: &str) -> Result<bool, StoreError> {
        self.inner.delete_chapter(id).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        self.inner.stats().await
    }
}
