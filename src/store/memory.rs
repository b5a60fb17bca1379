use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{sorted_pages, BindingUpdate, Store};
use crate::error::StoreError;
use crate::models::{
    BindingKey, Chapter, ChapterAttributes, ChapterKey, Page, SourceBinding, SourceCount, Stats, Work,
    WorkAttributes,
};

#[derive(Default)]
struct Inner {
    works: HashMap<String, Work>,
    bindings: HashMap<BindingKey, String>,
    chapters: HashMap<String, Chapter>,
    chapter_keys: HashMap<ChapterKey, String>,
}

/// Process-local store. Every record is replaced as a whole under one
/// lock, so readers never see a half-written chapter.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn apply_work_attributes(work: &mut Work, attrs: &WorkAttributes) {
    work.title = attrs.title.clone();
    work.alt_titles = attrs.alt_titles.clone();
    work.description = attrs.description.clone();
    work.cover_url = attrs.cover_url.clone();
    work.authors = attrs.authors.clone();
    work.artists = attrs.artists.clone();
    work.genres = attrs.genres.clone();
    work.status = attrs.status;
    work.year = attrs.year;
}

fn apply_chapter_attributes(chapter: &mut Chapter, attrs: &ChapterAttributes) {
    chapter.number = attrs.number;
    chapter.title = attrs.title.clone();
    chapter.volume = attrs.volume.clone();
    chapter.language = attrs.language.clone();
    chapter.url = attrs.url.clone();
    chapter.published_at = attrs.published_at;
}

fn matches_query(work: &Work, needle: &str) -> bool {
    work.title.to_lowercase().contains(needle)
        || work.alt_titles.iter().any(|t| t.to_lowercase().contains(needle))
        || work.authors.iter().any(|a| a.to_lowercase().contains(needle))
}

fn ascending(chapters: &mut [Chapter]) {
    chapters.sort_by(|a, b| a.number.total_cmp(&b.number).then_with(|| a.created_at.cmp(&b.created_at)));
}

#[async_trait]
impl Store for MemoryStore {
    async fn find_work(&self, id: &str) -> Result<Option<Work>, StoreError> {
        Ok(self.inner.read().await.works.get(id).cloned())
    }

    async fn find_work_by_binding(&self, key: &BindingKey) -> Result<Option<Work>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.bindings.get(key).and_then(|id| inner.works.get(id)).cloned())
    }

    async fn list_works(&self, offset: u32, limit: u32) -> Result<Vec<Work>, StoreError> {
        let inner = self.inner.read().await;
        let mut works: Vec<Work> = inner.works.values().cloned().collect();
        works.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(works.into_iter().skip(offset as usize).take(limit as usize).collect())
    }

    async fn search_works(&self, query: &str, limit: u32) -> Result<Vec<Work>, StoreError> {
        let needle = query.trim().to_lowercase();
        let inner = self.inner.read().await;
        let mut works: Vec<Work> = inner.works.values().filter(|w| matches_query(w, &needle)).cloned().collect();
        works.sort_by(|a, b| a.title.cmp(&b.title).then_with(|| a.id.cmp(&b.id)));
        works.truncate(limit as usize);
        Ok(works)
    }

    async fn create_work(&self, attrs: &WorkAttributes, binding: &BindingUpdate) -> Result<Work, StoreError> {
        let mut inner = self.inner.write().await;
        if inner.bindings.contains_key(&binding.key) {
            return Err(StoreError::UniqueViolation(format!("binding {}", binding.key)));
        }
        let now = Utc::now();
        let id = Uuid::new_v4().to_string();
        let mut work = Work {
            id: id.clone(),
            title: String::new(),
            alt_titles: Default::default(),
            description: None,
            cover_url: None,
            authors: Vec::new(),
            artists: Vec::new(),
            genres: Default::default(),
            status: Default::default(),
            year: None,
            bindings: vec![SourceBinding {
                work_id: id.clone(),
                source: binding.key.source,
                external_id: binding.key.external_id.clone(),
                url: binding.url.clone(),
                last_synced_at: binding.synced_at,
            }],
            created_at: now,
            updated_at: now,
        };
        apply_work_attributes(&mut work, attrs);
        inner.bindings.insert(binding.key.clone(), id.clone());
        inner.works.insert(id, work.clone());
        Ok(work)
    }

    async fn update_work(
        &self,
        id: &str,
        attrs: &WorkAttributes,
        binding: &BindingUpdate,
    ) -> Result<Work, StoreError> {
        let mut inner = self.inner.write().await;
        if let Some(owner) = inner.bindings.get(&binding.key) {
            if owner != id {
                return Err(StoreError::UniqueViolation(format!("binding {} belongs to {}", binding.key, owner)));
            }
        }
        let work = inner.works.get_mut(id).ok_or_else(|| StoreError::Missing(format!("work {}", id)))?;
        apply_work_attributes(work, attrs);
        match work
            .bindings
            .iter_mut()
            .find(|b| b.source == binding.key.source && b.external_id == binding.key.external_id)
        {
            Some(existing) => {
                existing.url = binding.url.clone();
                existing.last_synced_at = binding.synced_at;
            }
            None => work.bindings.push(SourceBinding {
                work_id: id.to_string(),
                source: binding.key.source,
                external_id: binding.key.external_id.clone(),
                url: binding.url.clone(),
                last_synced_at: binding.synced_at,
            }),
        }
        work.updated_at = Utc::now();
        let work = work.clone();
        inner.bindings.insert(binding.key.clone(), id.to_string());
        Ok(work)
    }

    async fn delete_work(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(work) = inner.works.remove(id) else { return Ok(false) };
        for b in &work.bindings {
            inner.bindings.remove(&BindingKey { source: b.source, external_id: b.external_id.clone() });
        }
        inner.chapters.retain(|_, c| c.work_id != id);
        inner.chapter_keys.retain(|k, _| k.work_id != id);
        Ok(true)
    }

    async fn find_chapter(&self, id: &str) -> Result<Option<Chapter>, StoreError> {
        Ok(self.inner.read().await.chapters.get(id).cloned())
    }

    async fn find_chapter_by_key(&self, key: &ChapterKey) -> Result<Option<Chapter>, StoreError> {
        let inner = self.inner.read().await;
        Ok(inner.chapter_keys.get(key).and_then(|id| inner.chapters.get(id)).cloned())
    }

    async fn create_chapter(
        &self,
        key: &ChapterKey,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        let mut inner = self.inner.write().await;
        if !inner.works.contains_key(&key.work_id) {
            return Err(StoreError::Missing(format!("work {}", key.work_id)));
        }
        if inner.chapter_keys.contains_key(key) {
            return Err(StoreError::UniqueViolation(format!("chapter {}", key)));
        }
        let now = Utc::now();
        let pages = pages.map(sorted_pages).unwrap_or_default();
        let mut chapter = Chapter {
            id: Uuid::new_v4().to_string(),
            work_id: key.work_id.clone(),
            number: 0.0,
            title: None,
            volume: None,
            language: String::new(),
            source: key.source,
            external_id: key.external_id.clone(),
            url: String::new(),
            published_at: None,
            page_count: pages.len() as u32,
            downloaded: false,
            download_path: None,
            pages,
            created_at: now,
            updated_at: now,
        };
        apply_chapter_attributes(&mut chapter, attrs);
        inner.chapter_keys.insert(key.clone(), chapter.id.clone());
        inner.chapters.insert(chapter.id.clone(), chapter.clone());
        Ok(chapter)
    }

    async fn update_chapter(
        &self,
        id: &str,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        let mut inner = self.inner.write().await;
        let current = inner.chapters.get(id).ok_or_else(|| StoreError::Missing(format!("chapter {}", id)))?;
        let mut next = current.clone();
        apply_chapter_attributes(&mut next, attrs);
        if let Some(pages) = pages {
            next.pages = sorted_pages(pages);
            next.page_count = next.pages.len() as u32;
        }
        next.updated_at = Utc::now();
        inner.chapters.insert(id.to_string(), next.clone());
        Ok(next)
    }

    async fn list_chapters(&self, work_id: &str) -> Result<Vec<Chapter>, StoreError> {
        let inner = self.inner.read().await;
        let mut chapters: Vec<Chapter> = inner.chapters.values().filter(|c| c.work_id == work_id).cloned().collect();
        ascending(&mut chapters);
        Ok(chapters)
    }

    async fn mark_downloaded(&self, id: &str, download_path: &str) -> Result<Chapter, StoreError> {
        let mut inner = self.inner.write().await;
        let chapter = inner.chapters.get_mut(id).ok_or_else(|| StoreError::Missing(format!("chapter {}", id)))?;
        chapter.downloaded = true;
        chapter.download_path = Some(download_path.to_string());
        chapter.updated_at = Utc::now();
        Ok(chapter.clone())
    }

    async fn list_downloaded(&self) -> Result<Vec<Chapter>, StoreError> {
        let inner = self.inner.read().await;
        let mut chapters: Vec<Chapter> = inner.chapters.values().filter(|c| c.downloaded).cloned().collect();
        chapters.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        Ok(chapters)
    }

    async fn delete_chapter(&self, id: &str) -> Result<bool, StoreError> {
        let mut inner = self.inner.write().await;
        let Some(chapter) = inner.chapters.remove(id) else { return Ok(false) };
        inner.chapter_keys.remove(&ChapterKey {
            work_id: chapter.work_id,
            source: chapter.source,
            external_id: chapter.external_id,
        });
        Ok(true)
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        let inner = self.inner.read().await;
        let mut per_source: BTreeMap<_, BTreeSet<&str>> = BTreeMap::new();
        for (key, work_id) in &inner.bindings {
            per_source.entry(key.source).or_default().insert(work_id.as_str());
        }
        Ok(Stats {
            total_works: inner.works.len() as i64,
            total_chapters: inner.chapters.len() as i64,
            per_source: per_source
                .into_iter()
                .map(|(source, works)| SourceCount { source, works: works.len() as i64 })
                .collect(),
        })
    }
}
