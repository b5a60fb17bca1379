//! Persisted catalog of works, chapters and pages.
//!
//! Both backends enforce the natural keys: a binding `(source, external_id)`
//! belongs to at most one work and a chapter `(work_id, source, external_id)`
//! exists at most once. A create that would break either key fails with
//! [`StoreError::UniqueViolation`] and leaves the store untouched.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreError;
use crate::models::{BindingKey, Chapter, ChapterAttributes, ChapterKey, Page, Stats, Work, WorkAttributes};

pub mod memory;
pub mod sqlite;

pub use memory::MemoryStore;
pub use sqlite::SqliteStore;

/// Binding data written alongside a work on every sync.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingUpdate {
    pub key: BindingKey,
    pub url: String,
    pub synced_at: DateTime<Utc>,
}

#[async_trait]
pub trait Store: Send + Sync {
    async fn find_work(&self, id: &str) -> Result<Option<Work>, StoreError>;

    async fn find_work_by_binding(&self, key: &BindingKey) -> Result<Option<Work>, StoreError>;

    /// Most recently updated first.
    async fn list_works(&self, offset: u32, limit: u32) -> Result<Vec<Work>, StoreError>;

    /// Case-insensitive match on title, alternate titles and authors.
    async fn search_works(&self, query: &str, limit: u32) -> Result<Vec<Work>, StoreError>;

    async fn create_work(&self, attrs: &WorkAttributes, binding: &BindingUpdate) -> Result<Work, StoreError>;

    /// Overwrite the mutable attributes and refresh the binding's url and
    /// sync time, adding the binding when the work does not have it yet.
    async fn update_work(
        &self,
        id: &str,
        attrs: &WorkAttributes,
        binding: &BindingUpdate,
    ) -> Result<Work, StoreError>;

    /// Removes the work with its bindings, chapters and pages.
    async fn delete_work(&self, id: &str) -> Result<bool, StoreError>;

    async fn find_chapter(&self, id: &str) -> Result<Option<Chapter>, StoreError>;

    async fn find_chapter_by_key(&self, key: &ChapterKey) -> Result<Option<Chapter>, StoreError>;

    async fn create_chapter(
        &self,
        key: &ChapterKey,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError>;

    /// With `pages` the page set is swapped atomically and `page_count`
    /// recomputed; without it both stay as stored. Download state is never
    /// touched here.
    async fn update_chapter(
        &self,
        id: &str,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError>;

    /// Ascending by chapter number.
    async fn list_chapters(&self, work_id: &str) -> Result<Vec<Chapter>, StoreError>;

    async fn mark_downloaded(&self, id: &str, download_path: &str) -> Result<Chapter, StoreError>;

    async fn list_downloaded(&self) -> Result<Vec<Chapter>, StoreError>;

    async fn delete_chapter(&self, id: &str) -> Result<bool, StoreError>;

    async fn stats(&self) -> Result<Stats, StoreError>;
}

/// Page set normalized to ascending page number. A repeated number keeps
/// its first entry.
pub(crate) fn sorted_pages(pages: &[Page]) -> Vec<Page> {
    let mut pages = pages.to_vec();
    pages.sort_by_key(|p| p.number);
    pages.dedup_by_key(|p| p.number);
    pages
}
