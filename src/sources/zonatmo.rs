use async_trait::async_trait;
use regex::Regex;
use scraper::{ElementRef, Html, Selector};
use std::collections::BTreeSet;
use std::sync::LazyLock;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::sleep;

use super::{absolutize, last_path_segment, sort_chapters_ascending, SourceAdapter};
use crate::config::ZonaTmoConfig;
use crate::error::SourceError;
use crate::http_client::{EnhancedHttpClient, HttpClientConfig};
use crate::models::{ChapterInfo, PageInfo, Source, WorkDetails, WorkStatus, WorkSummary};

const MAX_SEARCH_RESULTS: usize = 20;

static CHAPTER_NUMBER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)cap[ií]tulo\s+(\d+(?:\.\d+)?)").expect("chapter number regex"));
static SCRIPT_PAGES: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)pages\s*=\s*\[(.*?)\]").expect("script pages regex"));

/// Spaces out requests to one origin.
///
/// Callers queue on the gate, and each one sleeps the full delay while
/// holding it, so no two requests start closer than `delay` apart.
pub struct RateLimiter {
    delay: Duration,
    gate: Mutex<()>,
}

impl RateLimiter {
    pub fn new(delay: Duration) -> Self {
        Self { delay, gate: Mutex::new(()) }
    }

    pub async fn wait(&self) {
        let _turn = self.gate.lock().await;
        if !self.delay.is_zero() {
            sleep(self.delay).await;
        }
    }
}

fn selector(css: &str) -> Result<Selector, SourceError> {
    Selector::parse(css).map_err(|e| SourceError::Parse(format!("bad selector {}: {}", css, e)))
}

/// Elements matching the primary selector, or the secondary one when the
/// primary matches nothing.
fn select_either<'a>(
    root: ElementRef<'a>,
    primary: &str,
    secondary: &str,
) -> Result<Vec<ElementRef<'a>>, SourceError> {
    let found: Vec<_> = root.select(&selector(primary)?).collect();
    if !found.is_empty() {
        return Ok(found);
    }
    Ok(root.select(&selector(secondary)?).collect())
}

fn element_text(el: ElementRef<'_>) -> String {
    el.text().collect::<Vec<_>>().join(" ").split_whitespace().collect::<Vec<_>>().join(" ")
}

fn first_text(root: ElementRef<'_>, primary: &str, secondary: &str) -> Result<Option<String>, SourceError> {
    Ok(select_either(root, primary, secondary)?
        .into_iter()
        .map(element_text)
        .find(|t| !t.is_empty()))
}

fn image_src(img: ElementRef<'_>) -> Option<&str> {
    img.value()
        .attr("src")
        .or_else(|| img.value().attr("data-src"))
        .map(str::trim)
        .filter(|s| !s.is_empty())
}

pub(crate) fn parse_search(html: &str, base_url: &str) -> Result<Vec<WorkSummary>, SourceError> {
    let document = Html::parse_document(html);
    let link_sel = selector("a")?;
    let img_sel = selector("img")?;

    let mut results = Vec::new();
    for item in select_either(document.root_element(), ".manga-item", ".search-result-item")? {
        let Some(link) = item.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let title = link
            .value()
            .attr("title")
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
            .unwrap_or_else(|| element_text(link));
        if title.is_empty() {
            continue;
        }
        let Some(external_id) = last_path_segment(href) else { continue };
        let cover_url = item
            .select(&img_sel)
            .next()
            .and_then(image_src)
            .map(|src| absolutize(base_url, src));

        results.push(WorkSummary {
            external_id,
            title,
            cover_url,
            description: None,
            source: Source::ZonaTmo,
        });
        if results.len() == MAX_SEARCH_RESULTS {
            break;
        }
    }
    Ok(results)
}

pub(crate) fn parse_details(html: &str, external_id: &str, page_url: &str, base_url: &str) -> Result<WorkDetails, SourceError> {
    let document = Html::parse_document(html);
    let root = document.root_element();

    let title = first_text(root, "h1.manga-title", ".entry-title")?
        .ok_or_else(|| SourceError::Missing(format!("title on {}", page_url)))?;
    let description = first_text(root, ".manga-description", ".summary")?;
    let cover_url = select_either(root, "img.manga-cover", ".manga-thumbnail img")?
        .into_iter()
        .find_map(image_src)
        .map(|src| absolutize(base_url, src));

    let genres: BTreeSet<String> = select_either(root, ".genre-item", ".manga-genre a")?
        .into_iter()
        .map(element_text)
        .filter(|g| !g.is_empty())
        .collect();

    let status = first_text(root, ".manga-status", ".book-status")?
        .map(|label| WorkStatus::from_upstream(&label))
        .unwrap_or(WorkStatus::Unknown);

    let mut authors: Vec<String> = Vec::new();
    for author in select_either(root, ".author-item", ".manga-author")?.into_iter().map(element_text) {
        if !author.is_empty() && !authors.contains(&author) {
            authors.push(author);
        }
    }

    Ok(WorkDetails {
        external_id: external_id.to_string(),
        title,
        description,
        cover_url,
        authors,
        genres,
        status,
        source_url: page_url.to_string(),
        ..WorkDetails::default()
    })
}

/// Chapter entries in page order, which is newest first on this site.
pub(crate) fn parse_chapter_list(html: &str, base_url: &str) -> Result<Vec<ChapterInfo>, SourceError> {
    let document = Html::parse_document(html);
    let link_sel = selector("a")?;

    let mut chapters = Vec::new();
    for item in select_either(document.root_element(), ".chapter-item", ".chapter-list li")? {
        let Some(link) = item.select(&link_sel).next() else { continue };
        let Some(href) = link.value().attr("href") else { continue };
        let Some(external_id) = last_path_segment(href) else { continue };
        let text = element_text(link);
        let number = CHAPTER_NUMBER
            .captures(&text)
            .and_then(|caps| caps.get(1))
            .and_then(|m| m.as_str().parse::<f64>().ok())
            .unwrap_or(0.0);

        chapters.push(ChapterInfo {
            external_id,
            number,
            title: Some(text).filter(|t| !t.is_empty()),
            volume: None,
            language: "es".to_string(),
            published_at: None,
            source_url: absolutize(base_url, href),
        });
    }
    Ok(chapters)
}

/// Page order flipped, then stable-sorted, so equal numbers keep the
/// site's oldest-first tie order.
pub(crate) fn into_ascending(mut chapters: Vec<ChapterInfo>) -> Vec<ChapterInfo> {
    chapters.reverse();
    sort_chapters_ascending(&mut chapters);
    chapters
}

pub(crate) fn parse_pages(html: &str, base_url: &str) -> Result<Vec<PageInfo>, SourceError> {
    let document = Html::parse_document(html);
    let image_sel = selector(".page-image img, #chapter-reader img, .reader-image")?;

    let mut urls: Vec<String> = document
        .select(&image_sel)
        .filter_map(image_src)
        .map(|src| absolutize(base_url, src))
        .collect();

    if urls.is_empty() {
        let script_sel = selector("script")?;
        urls = document
            .select(&script_sel)
            .map(|s| s.inner_html())
            .find_map(|body| {
                SCRIPT_PAGES.captures(&body).map(|caps| {
                    caps[1]
                        .split(',')
                        .map(|u| u.trim().trim_matches(|c| c == '"' || c == '\'').trim().to_string())
                        .filter(|u| !u.is_empty())
                        .map(|u| absolutize(base_url, &u))
                        .collect::<Vec<_>>()
                })
            })
            .unwrap_or_default();
    }

    Ok(urls
        .into_iter()
        .enumerate()
        .map(|(i, image_url)| PageInfo { number: i as u32 + 1, image_url, width: None, height: None })
        .collect())
}

/// HTML scraper for ZonaTMO. Every request waits on the shared rate limiter.
pub struct ZonaTmoAdapter {
    http: EnhancedHttpClient,
    base_url: String,
    limiter: RateLimiter,
}

impl ZonaTmoAdapter {
    pub fn new(config: ZonaTmoConfig, http: HttpClientConfig) -> Result<Self, SourceError> {
        Ok(Self {
            http: EnhancedHttpClient::with_config(http)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            limiter: RateLimiter::new(Duration::from_millis(config.delay_ms)),
        })
    }

    async fn fetch(&self, url: &str, query: &[(&str, String)]) -> Result<String, SourceError> {
        self.limiter.wait().await;
        log::debug!("[zonatmo] GET {}", url);
        self.http.get_text(url, query).await
    }

    fn work_url(&self, external_id: &str) -> String {
        format!("{}/manga/{}", self.base_url, external_id)
    }
}

#[async_trait]
impl SourceAdapter for ZonaTmoAdapter {
    fn source(&self) -> Source {
        Source::ZonaTmo
    }

    async fn fetch_search(&self, query: &str) -> Result<Vec<WorkSummary>, SourceError> {
        let url = format!("{}/buscar", self.base_url);
        let html = self.fetch(&url, &[("q", query.to_string())]).await?;
        parse_search(&html, &self.base_url)
    }

    async fn get_work_details(&self, external_id: &str) -> Result<WorkDetails, SourceError> {
        let url = self.work_url(external_id);
        let html = self.fetch(&url, &[]).await?;
        parse_details(&html, external_id, &url, &self.base_url)
    }

    async fn fetch_chapters(&self, external_id: &str) -> Result<Vec<ChapterInfo>, SourceError> {
        let html = self.fetch(&self.work_url(external_id), &[]).await?;
        Ok(into_ascending(parse_chapter_list(&html, &self.base_url)?))
    }

    async fn fetch_pages(&self, external_chapter_id: &str) -> Result<Vec<PageInfo>, SourceError> {
        let url = format!("{}/leer/{}", self.base_url, external_chapter_id);
        let html = self.fetch(&url, &[]).await?;
        parse_pages(&html, &self.base_url)
    }
}
