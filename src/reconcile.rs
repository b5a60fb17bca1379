//! Create-or-update of freshly fetched records against the store.
//!
//! Records are matched on their natural key. A create that loses a race
//! against a concurrent create of the same key comes back from the store
//! as a unique violation and is retried as an update.

use chrono::Utc;
use std::sync::Arc;

use crate::error::{AppError, StoreError};
use crate::models::{
    BindingKey, Chapter, ChapterAttributes, ChapterInfo, ChapterKey, Page, Source, Work, WorkAttributes,
    WorkDetails,
};
use crate::store::{BindingUpdate, Store};

const DEFAULT_MAX_ATTEMPTS: usize = 3;

pub struct Reconciler {
    store: Arc<dyn Store>,
    max_attempts: usize,
}

impl Reconciler {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Upsert a work keyed by its `(source, external_id)` binding.
    pub async fn reconcile_work(&self, source: Source, details: &WorkDetails) -> Result<Work, AppError> {
        let binding = BindingUpdate {
            key: BindingKey { source, external_id: details.external_id.clone() },
            url: details.source_url.clone(),
            synced_at: Utc::now(),
        };
        let attrs = WorkAttributes::from(details);

        for attempt in 1..=self.max_attempts {
            let outcome = match self.store.find_work_by_binding(&binding.key).await? {
                Some(existing) => self.store.update_work(&existing.id, &attrs, &binding).await,
                None => self.store.create_work(&attrs, &binding).await,
            };
            match outcome {
                Ok(work) => return Ok(work),
                Err(StoreError::UniqueViolation(_)) | Err(StoreError::Missing(_)) => {
                    log::debug!("Work {} changed concurrently, retrying (attempt {})", binding.key, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::ReconciliationConflict(binding.key.to_string()))
    }

    /// Upsert a listed chapter. Stored pages and download state are kept.
    pub async fn reconcile_chapter(&self, work_id: &str, source: Source, info: &ChapterInfo) -> Result<Chapter, AppError> {
        let key = ChapterKey { work_id: work_id.to_string(), source, external_id: info.external_id.clone() };
        self.reconcile_chapter_with(&key, &ChapterAttributes::from(info), None).await
    }

    /// Upsert a chapter, replacing its page set when `pages` is given.
    pub async fn reconcile_chapter_with(
        &self,
        key: &ChapterKey,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, AppError> {
        for attempt in 1..=self.max_attempts {
            let outcome = match self.store.find_chapter_by_key(key).await? {
                Some(existing) => self.store.update_chapter(&existing.id, attrs, pages).await,
                None => self.store.create_chapter(key, attrs, pages).await,
            };
            match outcome {
                Ok(chapter) => return Ok(chapter),
                Err(StoreError::UniqueViolation(_)) => {
                    log::debug!("Chapter {} created concurrently, retrying (attempt {})", key, attempt);
                }
                Err(StoreError::Missing(what)) if self.store.find_work(&key.work_id).await?.is_none() => {
                    return Err(AppError::NotFound(what));
                }
                Err(StoreError::Missing(_)) => {
                    log::debug!("Chapter {} removed concurrently, retrying (attempt {})", key, attempt);
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(AppError::ReconciliationConflict(key.to_string()))
    }

    /// Replace the page set of a stored chapter, keeping its other attributes.
    pub async fn fill_pages(&self, chapter: &Chapter, pages: &[Page]) -> Result<Chapter, AppError> {
        let key = ChapterKey {
            work_id: chapter.work_id.clone(),
            source: chapter.source,
            external_id: chapter.external_id.clone(),
        };
        self.reconcile_chapter_with(&key, &ChapterAttributes::from(chapter), Some(pages)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn details(id: &str, title: &str) -> WorkDetails {
        WorkDetails {
            external_id: id.to_string(),
            title: title.to_string(),
            source_url: format!("https://mangadex.org/title/{}", id),
            ..WorkDetails::default()
        }
    }

    fn info(id: &str, number: f64) -> ChapterInfo {
        ChapterInfo {
            external_id: id.to_string(),
            number,
            title: None,
            volume: None,
            language: "es".to_string(),
            published_at: None,
            source_url: format!("https://mangadex.org/chapter/{}", id),
        }
    }

    #[tokio::test]
    async fn test_work_reconcile_is_idempotent() {
        let reconciler = Reconciler::new(Arc::new(MemoryStore::new()));
        let first = reconciler.reconcile_work(Source::MangaDex, &details("abc123", "Title")).await.unwrap();
        let second = reconciler.reconcile_work(Source::MangaDex, &details("abc123", "Renamed")).await.unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(second.title, "Renamed");
        assert_eq!(second.bindings.len(), 1);
        assert_eq!(reconciler.store().stats().await.unwrap().total_works, 1);
    }

    #[tokio::test]
    async fn test_chapter_update_preserves_download_and_pages() {
        let reconciler = Reconciler::new(Arc::new(MemoryStore::new()));
        let work = reconciler.reconcile_work(Source::MangaDex, &details("w", "W")).await.unwrap();
        let chapter = reconciler.reconcile_chapter(&work.id, Source::MangaDex, &info("c1", 1.0)).await.unwrap();
        let page = Page { number: 1, image_url: "https://img/1.jpg".into(), width: None, height: None };
        reconciler.fill_pages(&chapter, &[page]).await.unwrap();
        reconciler.store().mark_downloaded(&chapter.id, "storage/x").await.unwrap();

        let mut relisted = info("c1", 1.0);
        relisted.title = Some("Nuevo".into());
        let updated = reconciler.reconcile_chapter(&work.id, Source::MangaDex, &relisted).await.unwrap();
        assert_eq!(updated.id, chapter.id);
        assert_eq!(updated.title.as_deref(), Some("Nuevo"));
        assert_eq!(updated.page_count, 1);
        assert!(updated.downloaded);
        assert_eq!(updated.download_path.as_deref(), Some("storage/x"));
    }

    #[tokio::test]
    async fn test_chapter_for_unknown_work_is_not_found() {
        let reconciler = Reconciler::new(Arc::new(MemoryStore::new()));
        let err = reconciler.reconcile_chapter("missing", Source::ZonaTmo, &info("c", 1.0)).await.unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }
}
