use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::Deserialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashSet};
use std::sync::{LazyLock, Once};

use super::{sort_chapters_ascending, SourceAdapter};
use crate::config::MangaPlusConfig;
use crate::error::SourceError;
use crate::http_client::{EnhancedHttpClient, HttpClientConfig};
use crate::models::{ChapterInfo, PageInfo, Source, WorkDetails, WorkSummary};

static CHAPTER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+(\.\d+)?").expect("chapter number regex"));

static SEARCH_WARNING: Once = Once::new();

#[derive(Deserialize)]
struct Envelope<T> {
    success: Option<T>,
    error: Option<Value>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitleDetailResponse {
    title_detail_view: Option<TitleDetailView>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitleDetailView {
    title: Option<TitleInfo>,
    overview: Option<String>,
    #[serde(default)]
    first_chapter_list: Vec<RawChapter>,
    #[serde(default)]
    last_chapter_list: Vec<RawChapter>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct TitleInfo {
    name: Option<String>,
    author: Option<String>,
    portrait_image_url: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawChapter {
    chapter_id: Value,
    #[serde(default)]
    name: String,
    sub_title: Option<String>,
    start_time_stamp: Option<i64>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewerResponse {
    manga_viewer: Option<MangaViewer>,
}

#[derive(Deserialize)]
struct MangaViewer {
    #[serde(default)]
    pages: Vec<ViewerPage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ViewerPage {
    manga_page: Option<MangaPage>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct MangaPage {
    image_url: String,
    width: Option<u32>,
    height: Option<u32>,
}

fn unwrap_envelope<T>(envelope: Envelope<T>) -> Result<T, SourceError> {
    match envelope.success {
        Some(body) => Ok(body),
        None => Err(SourceError::Parse(match envelope.error {
            Some(err) => format!("api error: {}", err),
            None => "response has no success payload".to_string(),
        })),
    }
}

fn title_detail(body: &str) -> Result<TitleDetailView, SourceError> {
    let envelope: Envelope<TitleDetailResponse> = serde_json::from_str(body)?;
    unwrap_envelope(envelope)?
        .title_detail_view
        .ok_or_else(|| SourceError::Missing("titleDetailView".to_string()))
}

/// Chapter ids come back as numbers, occasionally as strings.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::Number(n) => Some(n.to_string()),
        Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
        _ => None,
    }
}

pub(crate) fn parse_details(body: &str, external_id: &str, web_url: &str) -> Result<WorkDetails, SourceError> {
    let view = title_detail(body)?;
    let info = view.title.ok_or_else(|| SourceError::Missing("title".to_string()))?;
    let title = info
        .name
        .map(|n| n.trim().to_string())
        .filter(|n| !n.is_empty())
        .ok_or_else(|| SourceError::Missing(format!("name of title {}", external_id)))?;

    // Credits arrive as one string, e.g. "Eiichiro Oda" or "Writer / Artist".
    let authors: Vec<String> = info
        .author
        .as_deref()
        .map(|a| a.split('/').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default();

    Ok(WorkDetails {
        external_id: external_id.to_string(),
        title,
        alt_titles: BTreeSet::new(),
        description: view.overview.filter(|o| !o.trim().is_empty()),
        cover_url: info.portrait_image_url,
        authors,
        source_url: format!("{}/titles/{}", web_url, external_id),
        ..WorkDetails::default()
    })
}

/// First and last chapter lists merged, deduplicated, ascending.
pub(crate) fn parse_chapters(body: &str, web_url: &str) -> Result<Vec<ChapterInfo>, SourceError> {
    let view = title_detail(body)?;
    let mut seen = HashSet::new();
    let mut chapters: Vec<ChapterInfo> = view
        .first_chapter_list
        .into_iter()
        .chain(view.last_chapter_list)
        .filter_map(|raw| {
            let id = id_string(&raw.chapter_id)?;
            if !seen.insert(id.clone()) {
                return None;
            }
            let number = CHAPTER_NUMBER
                .find(&raw.name)
                .and_then(|m| m.as_str().parse::<f64>().ok())
                .unwrap_or(0.0);
            let title = raw
                .sub_title
                .filter(|s| !s.trim().is_empty())
                .or_else(|| Some(raw.name.clone()).filter(|n| !n.trim().is_empty()));
            Some(ChapterInfo {
                source_url: format!("{}/viewer/{}", web_url, id),
                external_id: id,
                number,
                title,
                volume: None,
                language: "en".to_string(),
                published_at: raw.start_time_stamp.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            })
        })
        .collect();
    sort_chapters_ascending(&mut chapters);
    Ok(chapters)
}

pub(crate) fn parse_pages(body: &str) -> Result<Vec<PageInfo>, SourceError> {
    let envelope: Envelope<ViewerResponse> = serde_json::from_str(body)?;
    let viewer = match unwrap_envelope(envelope)?.manga_viewer {
        Some(viewer) => viewer,
        None => return Ok(Vec::new()),
    };
    Ok(viewer
        .pages
        .into_iter()
        .filter_map(|p| p.manga_page)
        .enumerate()
        .map(|(i, page)| PageInfo {
            number: i as u32 + 1,
            image_url: page.image_url,
            width: page.width,
            height: page.height,
        })
        .collect())
}

/// Client for the MANGA Plus web API. The API has no text search.
pub struct MangaPlusAdapter {
    http: EnhancedHttpClient,
    config: MangaPlusConfig,
}

impl MangaPlusAdapter {
    pub fn new(config: MangaPlusConfig, http: HttpClientConfig) -> Result<Self, SourceError> {
        let http = http
            .with_header("Origin", &config.web_url)
            .with_header("Referer", &config.web_url);
        Ok(Self { http: EnhancedHttpClient::with_config(http)?, config })
    }

    async fn title_detail_body(&self, title_id: &str) -> Result<String, SourceError> {
        let url = format!("{}/title_detailV3", self.config.api_url);
        let params = [("title_id", title_id.to_string()), ("format", "json".to_string())];
        self.http.get_text(&url, &params).await
    }
}

#[async_trait]
impl SourceAdapter for MangaPlusAdapter {
    fn source(&self) -> Source {
        Source::MangaPlus
    }

    fn supports_search(&self) -> bool {
        false
    }

    async fn fetch_search(&self, _query: &str) -> Result<Vec<WorkSummary>, SourceError> {
        SEARCH_WARNING.call_once(|| {
            log::warn!("[mangaplus] text search is not supported by the API, returning no results");
        });
        Ok(Vec::new())
    }

    async fn get_work_details(&self, external_id: &str) -> Result<WorkDetails, SourceError> {
        let body = self.title_detail_body(external_id).await?;
        parse_details(&body, external_id, &self.config.web_url)
    }

    async fn fetch_chapters(&self, external_id: &str) -> Result<Vec<ChapterInfo>, SourceError> {
        let body = self.title_detail_body(external_id).await?;
        parse_chapters(&body, &self.config.web_url)
    }

    async fn fetch_pages(&self, external_chapter_id: &str) -> Result<Vec<PageInfo>, SourceError> {
        let url = format!("{}/manga_viewer", self.config.api_url);
        let params = [
            ("chapter_id", external_chapter_id.to_string()),
            ("split", "yes".to_string()),
            ("img_quality", "high".to_string()),
            ("format", "json".to_string()),
        ];
        let body = self.http.get_text(&url, &params).await?;
        parse_pages(&body)
    }
}
