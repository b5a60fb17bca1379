mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use common::{chapter, FakeAdapter, YieldingStore};
use mangaflow::error::AppError;
use mangaflow::models::{Source, WorkDetails};
use mangaflow::reconcile::Reconciler;
use mangaflow::registry::AdapterRegistry;
use mangaflow::sources::SourceAdapter;
use mangaflow::store::Store;

fn details(id: &str) -> WorkDetails {
    WorkDetails {
        external_id: id.to_string(),
        title: "Vagabond".to_string(),
        source_url: format!("https://zonatmo.com/library/manga/{}", id),
        ..WorkDetails::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_work_reconciles_converge() {
    let store = Arc::new(YieldingStore::new());
    let reconciler = Arc::new(Reconciler::new(store.clone()));

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let reconciler = reconciler.clone();
            tokio::spawn(async move { reconciler.reconcile_work(Source::ZonaTmo, &details("123")).await })
        })
        .collect();

    let mut ids = Vec::new();
    for task in tasks {
        ids.push(task.await.unwrap().unwrap().id);
    }
    ids.dedup();
    assert_eq!(ids.len(), 1);
    assert_eq!(store.stats().await.unwrap().total_works, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_chapter_reconciles_converge() {
    let store = Arc::new(YieldingStore::new());
    let reconciler = Arc::new(Reconciler::new(store.clone()));
    let work = reconciler.reconcile_work(Source::ZonaTmo, &details("123")).await.unwrap();

    let tasks: Vec<_> = (0..8)
        .map(|i| {
            let reconciler = reconciler.clone();
            let work_id = work.id.clone();
            // Two distinct chapters raced by four tasks each.
            let info = chapter(if i % 2 == 0 { 1.0 } else { 2.0 });
            tokio::spawn(async move { reconciler.reconcile_chapter(&work_id, Source::ZonaTmo, &info).await })
        })
        .collect();
    for task in tasks {
        task.await.unwrap().unwrap();
    }

    let chapters = store.list_chapters(&work.id).await.unwrap();
    assert_eq!(chapters.iter().map(|c| c.number).collect::<Vec<_>>(), vec![1.0, 2.0]);
}

#[tokio::test]
async fn test_chapter_for_missing_work_is_not_found() {
    let reconciler = Reconciler::new(Arc::new(YieldingStore::new()));
    let err = reconciler.reconcile_chapter("ghost", Source::MangaDex, &chapter(1.0)).await.unwrap_err();
    assert!(matches!(err, AppError::NotFound(_)));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_registry_builds_one_adapter_per_source() {
    let built = Arc::new(AtomicUsize::new(0));
    let counter = built.clone();
    let registry = Arc::new(AdapterRegistry::new(Arc::new(move |source| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(FakeAdapter::new(source)) as Arc<dyn SourceAdapter>)
    })));

    let tasks: Vec<_> = (0..16)
        .map(|_| {
            let registry = registry.clone();
            tokio::spawn(async move { registry.resolve(Source::MangaDex).await })
        })
        .collect();
    let mut adapters = Vec::new();
    for task in tasks {
        adapters.push(task.await.unwrap().unwrap());
    }

    assert_eq!(built.load(Ordering::SeqCst), 1);
    assert!(adapters.windows(2).all(|pair| Arc::ptr_eq(&pair[0], &pair[1])));
    assert_eq!(registry.initialized(), vec![Source::MangaDex]);

    registry.resolve_name("zonatmo").await.unwrap();
    assert_eq!(built.load(Ordering::SeqCst), 2);
    assert!(matches!(registry.resolve_name("webtoon").await, Err(AppError::Configuration(_))));
}
