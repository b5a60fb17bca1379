//! Source adapters.
//!
//! Each adapter talks to one external origin and normalizes its data into
//! [`WorkSummary`], [`WorkDetails`], [`ChapterInfo`] and [`PageInfo`].
//! Search, chapter listing and page listing are best-effort: the `fetch_*`
//! methods report failures, and the provided wrappers degrade them to an
//! empty list. Work details are load-bearing and return an error.

use async_trait::async_trait;
use std::future::Future;

use crate::error::SourceError;
use crate::models::{ChapterInfo, PageInfo, Source, WorkDetails, WorkSummary};

pub mod mangadex;
pub mod mangaplus;
pub mod zonatmo;

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source(&self) -> Source;

    /// Whether `search_works` can ever return results.
    fn supports_search(&self) -> bool {
        true
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<WorkSummary>, SourceError>;

    async fn get_work_details(&self, external_id: &str) -> Result<WorkDetails, SourceError>;

    /// Ascending by chapter number, all upstream pages included.
    async fn fetch_chapters(&self, external_id: &str) -> Result<Vec<ChapterInfo>, SourceError>;

    /// 1-based, ascending by page number.
    async fn fetch_pages(&self, external_chapter_id: &str) -> Result<Vec<PageInfo>, SourceError>;

    async fn search_works(&self, query: &str) -> Vec<WorkSummary> {
        degrade(self.source(), "search", self.fetch_search(query).await)
    }

    async fn list_chapters(&self, external_id: &str) -> Vec<ChapterInfo> {
        degrade(self.source(), "chapter list", self.fetch_chapters(external_id).await)
    }

    async fn get_chapter_pages(&self, external_chapter_id: &str) -> Vec<PageInfo> {
        degrade(self.source(), "page list", self.fetch_pages(external_chapter_id).await)
    }
}

/// Log a best-effort failure and substitute an empty list.
pub(crate) fn degrade<T>(source: Source, operation: &str, result: Result<Vec<T>, SourceError>) -> Vec<T> {
    match result {
        Ok(items) => items,
        Err(e) => {
            log::warn!("[{}] {} failed, returning no results: {}", source, operation, e);
            Vec::new()
        }
    }
}

/// Stable ascending sort by chapter number.
pub fn sort_chapters_ascending(chapters: &mut [ChapterInfo]) {
    chapters.sort_by(|a, b| a.number.total_cmp(&b.number));
}

/// Resolve a possibly relative link against a site root.
pub(crate) fn absolutize(base_url: &str, href: &str) -> String {
    let href = href.trim();
    if href.starts_with("http://") || href.starts_with("https://") {
        href.to_string()
    } else if let Some(rest) = href.strip_prefix("//") {
        format!("https://{}", rest)
    } else if href.starts_with('/') {
        format!("{}{}", base_url.trim_end_matches('/'), href)
    } else {
        format!("{}/{}", base_url.trim_end_matches('/'), href)
    }
}

/// Last non-empty path segment of a link, used as an external id.
pub(crate) fn last_path_segment(href: &str) -> Option<String> {
    let path = href.split(['?', '#']).next().unwrap_or("");
    path.split('/')
        .filter(|s| !s.is_empty())
        .last()
        .map(|s| s.to_string())
}

/// Page through an offset/limit endpoint until a short page comes back.
pub(crate) async fn collect_paged<T, F, Fut>(
    limit: u32,
    max_offset: u32,
    mut fetch: F,
) -> Result<Vec<T>, SourceError>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<Vec<T>, SourceError>>,
{
    let mut out = Vec::new();
    let mut offset = 0u32;
    loop {
        let page = fetch(offset).await?;
        let received = page.len();
        out.extend(page);
        if received < limit as usize {
            break;
        }
        offset += limit;
        if offset >= max_offset {
            log::warn!("Stopping pagination at offset {}", offset);
            break;
        }
    }
    Ok(out)
}
