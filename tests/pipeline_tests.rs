mod common;

use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use common::{harness, harness_with, FakeAdapter, MemoryBlobs, SearchMode, YieldingStore};
use mangaflow::error::{AppError, ErrorKind};
use mangaflow::models::Source;
use mangaflow::store::{MemoryStore, Store};

fn token() -> CancellationToken {
    CancellationToken::new()
}

#[tokio::test]
async fn test_sync_work_is_idempotent() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0, 2.0, 3.0]));
    let h = harness(vec![adapter.clone()]);

    let first = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    *adapter.title.lock().unwrap() = "One Piece (Colored)".to_string();
    let second = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();

    assert_eq!(first.work.id, second.work.id);
    assert_eq!(second.work.title, "One Piece (Colored)");
    assert_eq!(second.work.bindings.len(), 1);
    assert_eq!(
        first.chapters.iter().map(|c| &c.id).collect::<Vec<_>>(),
        second.chapters.iter().map(|c| &c.id).collect::<Vec<_>>()
    );

    let stats = h.pipeline.stats().await.unwrap();
    assert_eq!(stats.total_works, 1);
    assert_eq!(stats.total_chapters, 3);
}

#[tokio::test]
async fn test_new_chapter_slots_in_with_stable_ids() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0, 2.0]));
    let h = harness(vec![adapter.clone()]);

    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let (one, two) = (synced.chapters[0].id.clone(), synced.chapters[1].id.clone());

    adapter.set_chapters(&[1.0, 1.5, 2.0]);
    let chapters = h.pipeline.sync_chapters(&synced.work.id, &token()).await.unwrap();

    assert_eq!(chapters.iter().map(|c| c.number).collect::<Vec<_>>(), vec![1.0, 1.5, 2.0]);
    assert_eq!(chapters[0].id, one);
    assert_eq!(chapters[2].id, two);
}

#[tokio::test]
async fn test_details_failure_is_a_source_fetch_error() {
    let mut adapter = FakeAdapter::new(Source::ZonaTmo);
    adapter.details_fail = true;
    let h = harness(vec![Arc::new(adapter)]);

    let err = h.pipeline.sync_work(Source::ZonaTmo, "x", &token()).await.unwrap_err();
    assert!(matches!(err, AppError::SourceFetch { origin: Source::ZonaTmo, .. }));
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert_eq!(h.pipeline.stats().await.unwrap().total_works, 0);
}

#[tokio::test]
async fn test_sync_chapters_requires_a_binding() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]));
    let store = Arc::new(YieldingStore { inner: MemoryStore::new(), hide_bindings: true });
    let h = harness_with(vec![adapter], store, MemoryBlobs::default(), Duration::from_secs(5));

    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    assert_eq!(synced.chapters.len(), 1);

    let err = h.pipeline.sync_chapters(&synced.work.id, &token()).await.unwrap_err();
    assert!(matches!(err, AppError::NoSourceBound(_)));
    assert_eq!(err.kind(), ErrorKind::BadInput);

    let missing = h.pipeline.sync_chapters("nope", &token()).await.unwrap_err();
    assert!(matches!(missing, AppError::NotFound(_)));
}

#[tokio::test]
async fn test_lazy_page_fill_runs_once() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]).with_pages(3));
    let h = harness(vec![adapter.clone()]);
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let id = synced.chapters[0].id.clone();
    assert!(synced.chapters[0].pages.is_empty());

    let filled = h.pipeline.get_chapter(&id, &token()).await.unwrap();
    assert_eq!(filled.page_count, 3);
    assert_eq!(filled.pages.iter().map(|p| p.number).collect::<Vec<_>>(), vec![1, 2, 3]);

    let again = h.pipeline.get_chapter(&id, &token()).await.unwrap();
    assert_eq!(again.pages, filled.pages);
    assert_eq!(adapter.page_calls(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_reads_share_one_page_fill() {
    let mut adapter = FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]).with_pages(5);
    adapter.page_delay = Duration::from_millis(50);
    let adapter = Arc::new(adapter);
    let h = harness(vec![adapter.clone()]);
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let id = synced.chapters[0].id.clone();

    let reads = (0..4).map(|_| {
        let pipeline = h.pipeline.clone();
        let id = id.clone();
        tokio::spawn(async move { pipeline.get_chapter(&id, &CancellationToken::new()).await })
    });
    for read in futures::future::join_all(reads).await {
        assert_eq!(read.unwrap().unwrap().page_count, 5);
    }
    assert_eq!(adapter.page_calls(), 1);
}

#[tokio::test]
async fn test_empty_page_listing_leaves_chapter_unchanged() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaPlus).with_chapters(&[1.0]));
    let h = harness(vec![adapter.clone()]);
    let synced = h.pipeline.sync_work(Source::MangaPlus, "100020", &token()).await.unwrap();
    let id = synced.chapters[0].id.clone();

    let chapter = h.pipeline.get_chapter(&id, &token()).await.unwrap();
    assert!(chapter.pages.is_empty());
    assert_eq!(chapter.page_count, 0);

    let err = h.pipeline.download_chapter(&id, &token()).await.unwrap_err();
    assert!(matches!(err, AppError::SourceFetch { origin: Source::MangaPlus, .. }));
}

#[tokio::test]
async fn test_resync_keeps_filled_pages() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]).with_pages(4));
    let h = harness(vec![adapter.clone()]);
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let id = synced.chapters[0].id.clone();
    h.pipeline.get_chapter(&id, &token()).await.unwrap();

    let chapters = h.pipeline.sync_chapters(&synced.work.id, &token()).await.unwrap();
    assert_eq!(chapters[0].id, id);
    assert_eq!(chapters[0].page_count, 4);
    assert_eq!(chapters[0].pages.len(), 4);
}

#[tokio::test]
async fn test_download_mirrors_every_page() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]).with_pages(3));
    let h = harness(vec![adapter.clone()]);
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let chapter = &synced.chapters[0];

    let downloaded = h.pipeline.download_chapter(&chapter.id, &token()).await.unwrap();
    let folder = format!("manga-{}/chapter-{}", synced.work.id, chapter.id);
    assert!(downloaded.downloaded);
    assert_eq!(downloaded.download_path.as_deref(), Some(folder.as_str()));
    {
        let objects = h.blobs.objects.lock().unwrap();
        assert_eq!(objects.len(), 3);
        assert_eq!(objects[&format!("{}/page-002.png", folder)], "https://img.example/2.png");
    }

    let listed = h.pipeline.list_downloaded().await.unwrap();
    assert_eq!(listed.len(), 1);

    // Already downloaded: no further uploads or page fetches.
    h.pipeline.download_chapter(&chapter.id, &token()).await.unwrap();
    assert_eq!(adapter.page_calls(), 1);

    h.pipeline.delete_chapter(&chapter.id).await.unwrap();
    assert!(h.blobs.objects.lock().unwrap().is_empty());
    assert!(h.pipeline.list_chapters(&synced.work.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_failed_download_cleans_up() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]).with_pages(3));
    let blobs = MemoryBlobs { fail_on: Some("https://img.example/3.png".to_string()), ..MemoryBlobs::default() };
    let h = harness_with(vec![adapter], Arc::new(MemoryStore::new()), blobs, Duration::from_secs(5));
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    let id = synced.chapters[0].id.clone();

    let err = h.pipeline.download_chapter(&id, &token()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert!(h.blobs.objects.lock().unwrap().is_empty());

    let chapter = h.pipeline.get_chapter(&id, &token()).await.unwrap();
    assert!(!chapter.downloaded);
    assert!(chapter.download_path.is_none());
}

#[tokio::test]
async fn test_search_degrades_per_source() {
    let mut panicking = FakeAdapter::new(Source::ZonaTmo);
    panicking.search_mode = SearchMode::Panic;
    let h = harness(vec![Arc::new(FakeAdapter::new(Source::MangaDex)), Arc::new(panicking)]);
    h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();

    let results = h.pipeline.search("one piece", &Source::ALL, &token()).await.unwrap();
    assert_eq!(results.local.len(), 1);
    assert_eq!(results.external.len(), 1);
    assert_eq!(results.external[0].source, Source::MangaDex);
    // ZonaTmo panicked, MangaPlus has no adapter.
    assert_eq!(results.degraded, vec![Source::ZonaTmo, Source::MangaPlus]);

    let metrics = h.pipeline.metrics().get_metrics(Source::ZonaTmo).unwrap();
    assert_eq!(metrics.failed_requests, 1);
}

#[tokio::test(start_paused = true)]
async fn test_search_deadline_drops_slow_sources() {
    let mut slow = FakeAdapter::new(Source::MangaPlus);
    slow.search_mode = SearchMode::Hang;
    let h = harness_with(
        vec![Arc::new(FakeAdapter::new(Source::MangaDex)), Arc::new(slow)],
        Arc::new(MemoryStore::new()),
        MemoryBlobs::default(),
        Duration::from_secs(2),
    );

    let results = h.pipeline.search("berserk", &[Source::MangaDex, Source::MangaPlus], &token()).await.unwrap();
    assert_eq!(results.external.len(), 1);
    assert_eq!(results.degraded, vec![Source::MangaPlus]);
}

#[tokio::test]
async fn test_sources_without_search_are_skipped() {
    let mut no_search = FakeAdapter::new(Source::MangaPlus);
    no_search.search_supported = false;
    let no_search = Arc::new(no_search);
    let h = harness(vec![Arc::new(FakeAdapter::new(Source::MangaDex)), no_search.clone()]);

    let results = h.pipeline.search("berserk", &[Source::MangaDex, Source::MangaPlus], &token()).await.unwrap();
    assert_eq!(results.external.len(), 1);
    assert!(results.degraded.is_empty());
    assert_eq!(no_search.search_calls(), 0);
    assert!(h.pipeline.metrics().get_metrics(Source::MangaPlus).is_none());
}

#[tokio::test]
async fn test_failed_chapter_listing_is_recorded() {
    let mut adapter = FakeAdapter::new(Source::ZonaTmo).with_chapters(&[1.0, 2.0]);
    adapter.lists_fail = true;
    let h = harness(vec![Arc::new(adapter)]);

    let synced = h.pipeline.sync_work(Source::ZonaTmo, "berserk", &token()).await.unwrap();
    assert!(synced.chapters.is_empty());

    let metrics = h.pipeline.metrics().get_metrics(Source::ZonaTmo).unwrap();
    assert_eq!(metrics.total_requests, 2);
    assert_eq!(metrics.successful_requests, 1);
    assert_eq!(metrics.failed_requests, 1);
    assert_eq!(metrics.empty_results, 0);
    assert_eq!(metrics.rate_limit_hits, 1);
    assert!(metrics.last_error.unwrap().contains("returned status 429"));
}

#[tokio::test]
async fn test_search_rejects_blank_query() {
    let h = harness(vec![]);
    let err = h.pipeline.search("   ", &Source::ALL, &token()).await.unwrap_err();
    assert!(matches!(err, AppError::InvalidInput(_)));
}

#[tokio::test]
async fn test_cancelled_sync_stops_before_fetching() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0]));
    let h = harness(vec![adapter]);
    let cancel = token();
    cancel.cancel();

    let err = h.pipeline.sync_work(Source::MangaDex, "op", &cancel).await.unwrap_err();
    assert!(matches!(err, AppError::Cancelled));
    assert_eq!(h.pipeline.stats().await.unwrap().total_works, 0);
}

#[tokio::test]
async fn test_list_works_paginates() {
    let h = harness(vec![Arc::new(FakeAdapter::new(Source::MangaDex))]);
    for id in ["a", "b", "c"] {
        h.pipeline.sync_work(Source::MangaDex, id, &token()).await.unwrap();
    }

    let first = h.pipeline.list_works(1, 2).await.unwrap();
    assert_eq!(first.data.len(), 2);
    assert!(first.pagination.has_more);
    let second = h.pipeline.list_works(2, 2).await.unwrap();
    assert_eq!(second.data.len(), 1);
    assert!(!second.pagination.has_more);

    assert!(matches!(h.pipeline.list_works(0, 2).await, Err(AppError::InvalidInput(_))));
    assert!(matches!(h.pipeline.list_works(1, 101).await, Err(AppError::InvalidInput(_))));
}

#[tokio::test]
async fn test_delete_work_removes_everything() {
    let adapter = Arc::new(FakeAdapter::new(Source::MangaDex).with_chapters(&[1.0, 2.0]).with_pages(2));
    let h = harness(vec![adapter]);
    let synced = h.pipeline.sync_work(Source::MangaDex, "op", &token()).await.unwrap();
    h.pipeline.download_chapter(&synced.chapters[0].id, &token()).await.unwrap();

    h.pipeline.delete_work(&synced.work.id).await.unwrap();
    assert!(h.blobs.objects.lock().unwrap().is_empty());
    assert!(matches!(h.pipeline.get_work(&synced.work.id).await, Err(AppError::NotFound(_))));
    assert!(h.store.find_chapter(&synced.chapters[1].id).await.unwrap().is_none());
}
