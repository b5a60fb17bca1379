use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};

use super::{collect_paged, sort_chapters_ascending, SourceAdapter};
use crate::config::MangaDexConfig;
use crate::error::SourceError;
use crate::http_client::{EnhancedHttpClient, HttpClientConfig};
use crate::models::{ChapterInfo, PageInfo, Source, WorkDetails, WorkStatus, WorkSummary};

/// The API refuses offset + limit beyond this.
const MAX_OFFSET: u32 = 10_000;
const SEARCH_LIMIT: u32 = 20;

type Localized = BTreeMap<String, String>;

#[derive(Deserialize)]
struct MangaList {
    data: Vec<MangaData>,
}

#[derive(Deserialize)]
struct MangaEntity {
    data: MangaData,
}

#[derive(Deserialize)]
struct MangaData {
    id: String,
    attributes: MangaAttributes,
    #[serde(default)]
    relationships: Vec<Relationship>,
}

#[derive(Deserialize)]
struct Relationship {
    #[allow(dead_code)]
    id: String,
    #[serde(rename = "type")]
    rel_type: String,
    attributes: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaAttributes {
    #[serde(default, deserialize_with = "localized")]
    title: Localized,
    #[serde(default)]
    alt_titles: Vec<Value>,
    #[serde(default, deserialize_with = "localized")]
    description: Localized,
    status: Option<String>,
    year: Option<i32>,
    #[serde(default)]
    tags: Vec<Tag>,
}

#[derive(Deserialize)]
struct Tag {
    attributes: TagAttributes,
}

#[derive(Deserialize)]
struct TagAttributes {
    #[serde(default, deserialize_with = "localized")]
    name: Localized,
    #[serde(default)]
    group: String,
}

#[derive(Deserialize)]
struct ChapterList {
    data: Vec<ChapterData>,
}

#[derive(Deserialize)]
struct ChapterData {
    id: String,
    attributes: ChapterAttributes,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChapterAttributes {
    chapter: Option<String>,
    title: Option<String>,
    volume: Option<String>,
    #[serde(default)]
    translated_language: String,
    publish_at: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeServer {
    base_url: String,
    chapter: AtHomeChapter,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AtHomeChapter {
    hash: String,
    data: Vec<String>,
}

/// Localized maps arrive as `{}` objects, but empty ones are sometimes `[]`.
fn localized<'de, D>(deserializer: D) -> Result<Localized, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Value::deserialize(deserializer)?;
    Ok(localized_from_value(&value))
}

fn localized_from_value(value: &Value) -> Localized {
    value
        .as_object()
        .map(|obj| {
            obj.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string())))
                .collect()
        })
        .unwrap_or_default()
}

/// Pick a value by locale preference, then the first non-empty one.
pub(crate) fn pick_localized(map: &Localized, preference: &[String]) -> Option<String> {
    preference
        .iter()
        .filter_map(|lang| map.get(lang))
        .find(|v| !v.trim().is_empty())
        .or_else(|| map.values().find(|v| !v.trim().is_empty()))
        .map(|v| v.trim().to_string())
}

/// Client for the official MangaDex v5 API.
pub struct MangaDexAdapter {
    http: EnhancedHttpClient,
    config: MangaDexConfig,
}

impl MangaDexAdapter {
    pub fn new(config: MangaDexConfig, http: HttpClientConfig) -> Result<Self, SourceError> {
        Ok(Self { http: EnhancedHttpClient::with_config(http)?, config })
    }

    fn cover_url(&self, manga: &MangaData) -> Option<String> {
        manga
            .relationships
            .iter()
            .find(|r| r.rel_type == "cover_art")
            .and_then(|rel| rel.attributes.as_ref())
            .and_then(|attrs| attrs.get("fileName"))
            .and_then(|f| f.as_str())
            .map(|file| format!("{}/{}/{}", self.config.cover_base_url, manga.id, file))
    }

    fn related_names(manga: &MangaData, rel_type: &str) -> Vec<String> {
        manga
            .relationships
            .iter()
            .filter(|r| r.rel_type == rel_type)
            .filter_map(|r| r.attributes.as_ref())
            .filter_map(|attrs| attrs.get("name").and_then(|n| n.as_str()))
            .map(|n| n.trim().to_string())
            .filter(|n| !n.is_empty())
            .collect()
    }

    fn summary(&self, manga: MangaData) -> WorkSummary {
        let prefs = &self.config.locale_preference;
        WorkSummary {
            title: pick_localized(&manga.attributes.title, prefs).unwrap_or_default(),
            description: pick_localized(&manga.attributes.description, prefs),
            cover_url: self.cover_url(&manga),
            external_id: manga.id,
            source: Source::MangaDex,
        }
    }

    pub(crate) fn parse_search(&self, body: &str) -> Result<Vec<WorkSummary>, SourceError> {
        let list: MangaList = serde_json::from_str(body)?;
        Ok(list.data.into_iter().map(|m| self.summary(m)).collect())
    }

    pub(crate) fn parse_details(&self, body: &str) -> Result<WorkDetails, SourceError> {
        let entity: MangaEntity = serde_json::from_str(body)?;
        let manga = entity.data;
        let prefs = &self.config.locale_preference;

        let title = pick_localized(&manga.attributes.title, prefs)
            .ok_or_else(|| SourceError::Missing(format!("title of manga {}", manga.id)))?;

        let alt_titles: BTreeSet<String> = manga
            .attributes
            .alt_titles
            .iter()
            .filter_map(|alt| pick_localized(&localized_from_value(alt), prefs))
            .filter(|t| t != &title)
            .collect();

        let genres: BTreeSet<String> = manga
            .attributes
            .tags
            .iter()
            .filter(|t| t.attributes.group == "genre")
            .filter_map(|t| pick_localized(&t.attributes.name, prefs))
            .collect();

        Ok(WorkDetails {
            title,
            alt_titles,
            description: pick_localized(&manga.attributes.description, prefs),
            cover_url: self.cover_url(&manga),
            authors: Self::related_names(&manga, "author"),
            artists: Self::related_names(&manga, "artist"),
            genres,
            status: manga
                .attributes
                .status
                .as_deref()
                .map(WorkStatus::from_upstream)
                .unwrap_or_default(),
            year: manga.attributes.year,
            source_url: format!("{}/title/{}", self.config.web_url, manga.id),
            external_id: manga.id,
        })
    }

    pub(crate) fn parse_chapter_page(&self, body: &str) -> Result<Vec<ChapterInfo>, SourceError> {
        let list: ChapterList = serde_json::from_str(body)?;
        Ok(list
            .data
            .into_iter()
            .map(|c| {
                let attrs = c.attributes;
                ChapterInfo {
                    number: attrs
                        .chapter
                        .as_deref()
                        .and_then(|n| n.trim().parse::<f64>().ok())
                        .unwrap_or(0.0),
                    title: attrs.title.filter(|t| !t.trim().is_empty()),
                    volume: attrs.volume.filter(|v| !v.trim().is_empty()),
                    language: attrs.translated_language,
                    published_at: attrs
                        .publish_at
                        .as_deref()
                        .and_then(|ts| DateTime::parse_from_rfc3339(ts).ok())
                        .map(|dt| dt.with_timezone(&Utc)),
                    source_url: format!("{}/chapter/{}", self.config.web_url, c.id),
                    external_id: c.id,
                }
            })
            .collect())
    }

    pub(crate) fn parse_pages(body: &str) -> Result<Vec<PageInfo>, SourceError> {
        let server: AtHomeServer = serde_json::from_str(body)?;
        Ok(server
            .chapter
            .data
            .iter()
            .enumerate()
            .map(|(i, file)| PageInfo {
                number: i as u32 + 1,
                image_url: format!("{}/data/{}/{}", server.base_url, server.chapter.hash, file),
                width: None,
                height: None,
            })
            .collect())
    }
}

#[async_trait]
impl SourceAdapter for MangaDexAdapter {
    fn source(&self) -> Source {
        Source::MangaDex
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<WorkSummary>, SourceError> {
        let url = format!("{}/manga", self.config.base_url);
        let mut params = vec![
            ("title", query.to_string()),
            ("limit", SEARCH_LIMIT.to_string()),
            ("includes[]", "cover_art".to_string()),
        ];
        for lang in &self.config.locale_preference {
            params.push(("availableTranslatedLanguage[]", lang.clone()));
        }
        let body = self.http.get_text(&url, &params).await?;
        self.parse_search(&body)
    }

    async fn get_work_details(&self, external_id: &str) -> Result<WorkDetails, SourceError> {
        let url = format!("{}/manga/{}", self.config.base_url, external_id);
        let params = [
            ("includes[]", "cover_art".to_string()),
            ("includes[]", "author".to_string()),
            ("includes[]", "artist".to_string()),
        ];
        let body = self.http.get_text(&url, &params).await?;
        self.parse_details(&body)
    }

    async fn fetch_chapters(&self, external_id: &str) -> Result<Vec<ChapterInfo>, SourceError> {
        let url = format!("{}/chapter", self.config.base_url);
        let limit = self.config.page_size.max(1);
        let mut chapters = collect_paged(limit, MAX_OFFSET, |offset| {
            let mut params = vec![
                ("manga", external_id.to_string()),
                ("limit", limit.to_string()),
                ("offset", offset.to_string()),
                ("order[chapter]", "asc".to_string()),
                ("includes[]", "scanlation_group".to_string()),
            ];
            for lang in &self.config.chapter_languages {
                params.push(("translatedLanguage[]", lang.clone()));
            }
            let url = url.clone();
            async move {
                let body = self.http.get_text(&url, &params).await?;
                self.parse_chapter_page(&body)
            }
        })
        .await?;
        sort_chapters_ascending(&mut chapters);
        Ok(chapters)
    }

    async fn fetch_pages(&self, external_chapter_id: &str) -> Result<Vec<PageInfo>, SourceError> {
        let url = format!("{}/at-home/server/{}", self.config.base_url, external_chapter_id);
        let body = self.http.get_text(&url, &[]).await?;
        Self::parse_pages(&body)
    }
}
