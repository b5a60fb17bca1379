use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::error::AppError;

/// External origins a work can be synchronized from.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Source {
    MangaDex,
    ZonaTmo,
    MangaPlus,
}

impl Source {
    pub const ALL: [Source; 3] = [Source::MangaDex, Source::ZonaTmo, Source::MangaPlus];

    pub fn as_str(&self) -> &'static str {
        match self {
            Source::MangaDex => "mangadex",
            Source::ZonaTmo => "zonatmo",
            Source::MangaPlus => "mangaplus",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Source::MangaDex => "MangaDex",
            Source::ZonaTmo => "ZonaTMO",
            Source::MangaPlus => "MANGA Plus",
        }
    }

    /// Parse a source identifier, case-insensitively.
    pub fn parse(s: &str) -> Option<Source> {
        match s.trim().to_lowercase().as_str() {
            "mangadex" => Some(Source::MangaDex),
            "zonatmo" | "zona-tmo" => Some(Source::ZonaTmo),
            "mangaplus" | "manga-plus" => Some(Source::MangaPlus),
            _ => None,
        }
    }
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Source {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Source::parse(s)
            .ok_or_else(|| AppError::Configuration(format!("unknown source identifier: {}", s)))
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum WorkStatus {
    Ongoing,
    Completed,
    Hiatus,
    Cancelled,
    #[default]
    Unknown,
}

impl WorkStatus {
    /// Map an upstream status label onto the lifecycle enum.
    pub fn from_upstream(label: &str) -> WorkStatus {
        match label.trim().to_lowercase().as_str() {
            "ongoing" | "publishing" | "publicándose" | "publicandose" | "en emisión"
            | "en emision" => WorkStatus::Ongoing,
            "completed" | "finished" | "finalizado" => WorkStatus::Completed,
            "hiatus" | "pausado" | "en pausa" => WorkStatus::Hiatus,
            "cancelled" | "canceled" | "cancelado" => WorkStatus::Cancelled,
            _ => WorkStatus::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WorkStatus::Ongoing => "ongoing",
            WorkStatus::Completed => "completed",
            WorkStatus::Hiatus => "hiatus",
            WorkStatus::Cancelled => "cancelled",
            WorkStatus::Unknown => "unknown",
        }
    }
}

/// A search hit as reported by one source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct WorkSummary {
    pub external_id: String,
    pub title: String,
    pub cover_url: Option<String>,
    pub description: Option<String>,
    pub source: Source,
}

/// Normalized work attributes fetched from a source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
pub struct WorkDetails {
    pub external_id: String,
    pub title: String,
    pub alt_titles: BTreeSet<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub authors: Vec<String>,
    pub artists: Vec<String>,
    pub genres: BTreeSet<String>,
    pub status: WorkStatus,
    pub year: Option<i32>,
    pub source_url: String,
}

/// A chapter descriptor as listed by a source.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ChapterInfo {
    pub external_id: String,
    pub number: f64,
    pub title: Option<String>,
    pub volume: Option<String>,
    pub language: String,
    pub published_at: Option<DateTime<Utc>>,
    pub source_url: String,
}

/// One page image as listed by a source. Numbers are 1-based.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Eq)]
pub struct PageInfo {
    pub number: u32,
    pub image_url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceBinding {
    pub work_id: String,
    pub source: Source,
    pub external_id: String,
    pub url: String,
    pub last_synced_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Work {
    pub id: String,
    pub title: String,
    pub alt_titles: BTreeSet<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub authors: Vec<String>,
    pub artists: Vec<String>,
    pub genres: BTreeSet<String>,
    pub status: WorkStatus,
    pub year: Option<i32>,
    /// Ordered by binding creation; the first entry is the primary source.
    pub bindings: Vec<SourceBinding>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Page {
    pub number: u32,
    pub image_url: String,
    pub width: Option<u32>,
    pub height: Option<u32>,
}

impl From<&PageInfo> for Page {
    fn from(p: &PageInfo) -> Self {
        Page {
            number: p.number,
            image_url: p.image_url.clone(),
            width: p.width,
            height: p.height,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Chapter {
    pub id: String,
    pub work_id: String,
    pub number: f64,
    pub title: Option<String>,
    pub volume: Option<String>,
    pub language: String,
    pub source: Source,
    pub external_id: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
    pub page_count: u32,
    pub downloaded: bool,
    pub download_path: Option<String>,
    /// Ascending by page number.
    pub pages: Vec<Page>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Mutable work attributes written by reconciliation.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkAttributes {
    pub title: String,
    pub alt_titles: BTreeSet<String>,
    pub description: Option<String>,
    pub cover_url: Option<String>,
    pub authors: Vec<String>,
    pub artists: Vec<String>,
    pub genres: BTreeSet<String>,
    pub status: WorkStatus,
    pub year: Option<i32>,
}

impl From<&WorkDetails> for WorkAttributes {
    fn from(d: &WorkDetails) -> Self {
        WorkAttributes {
            title: d.title.clone(),
            alt_titles: d.alt_titles.clone(),
            description: d.description.clone(),
            cover_url: d.cover_url.clone(),
            authors: d.authors.clone(),
            artists: d.artists.clone(),
            genres: d.genres.clone(),
            status: d.status,
            year: d.year,
        }
    }
}

/// Natural key of a source binding.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingKey {
    pub source: Source,
    pub external_id: String,
}

impl fmt::Display for BindingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.external_id)
    }
}

/// Natural key of a chapter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChapterKey {
    pub work_id: String,
    pub source: Source,
    pub external_id: String,
}

impl fmt::Display for ChapterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}:{}", self.work_id, self.source, self.external_id)
    }
}

/// Mutable chapter attributes written by reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct ChapterAttributes {
    pub number: f64,
    pub title: Option<String>,
    pub volume: Option<String>,
    pub language: String,
    pub url: String,
    pub published_at: Option<DateTime<Utc>>,
}

impl From<&ChapterInfo> for ChapterAttributes {
    fn from(c: &ChapterInfo) -> Self {
        ChapterAttributes {
            number: c.number,
            title: c.title.clone(),
            volume: c.volume.clone(),
            language: c.language.clone(),
            url: c.source_url.clone(),
            published_at: c.published_at,
        }
    }
}

impl From<&Chapter> for ChapterAttributes {
    fn from(c: &Chapter) -> Self {
        ChapterAttributes {
            number: c.number,
            title: c.title.clone(),
            volume: c.volume.clone(),
            language: c.language.clone(),
            url: c.url.clone(),
            published_at: c.published_at,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct SourceCount {
    pub source: Source,
    pub works: i64,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Stats {
    pub total_works: i64,
    pub total_chapters: i64,
    pub per_source: Vec<SourceCount>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginatedResponse<T> {
    pub data: Vec<T>,
    pub pagination: PaginationInfo,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PaginationInfo {
    pub page: u32,
    pub limit: u32,
    pub has_more: bool,
}
