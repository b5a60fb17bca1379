//! HTTP surface over the sync pipeline.
//!
//! Every response is a JSON envelope with an explicit `success` flag. Failures
//! carry a human-readable `error` and a machine-readable `kind`; the status
//! code follows the kind.

use actix_web::http::StatusCode;
use actix_web::{delete, get, post, web, HttpResponse, ResponseError};
use serde::{Deserialize, Serialize};

use crate::app_state::AppState;
use crate::error::{AppError, ErrorKind};
use crate::models::Source;

const DEFAULT_PAGE_SIZE: u32 = 20;

#[derive(Debug, Serialize)]
pub struct Envelope<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<ErrorKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl<T: Serialize> Envelope<T> {
    pub fn ok(data: T) -> Self {
        Self { success: true, data: Some(data), error: None, kind: None, message: None }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

fn ok<T: Serialize>(data: T) -> HttpResponse {
    HttpResponse::Ok().json(Envelope::ok(data))
}

fn done(message: &str) -> HttpResponse {
    HttpResponse::Ok().json(Envelope::<()> {
        success: true,
        data: None,
        error: None,
        kind: None,
        message: Some(message.to_string()),
    })
}

impl ResponseError for AppError {
    fn status_code(&self) -> StatusCode {
        StatusCode::from_u16(self.kind().status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
    }

    fn error_response(&self) -> HttpResponse {
        let kind = self.kind();
        if kind == ErrorKind::Internal {
            log::error!("Request failed: {}", self);
        } else {
            log::warn!("Request failed: {}", self);
        }
        HttpResponse::build(self.status_code()).json(Envelope::<()> {
            success: false,
            data: None,
            error: Some(self.to_string()),
            kind: Some(kind),
            message: None,
        })
    }
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub page: Option<u32>,
    pub limit: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    /// Source identifiers; every known source when omitted.
    pub sources: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequest {
    pub source: String,
    pub external_id: String,
}

#[derive(Debug, Serialize)]
struct Health {
    status: &'static str,
    version: &'static str,
}

fn parse_sources(names: Option<&[String]>) -> Result<Vec<Source>, AppError> {
    match names {
        None => Ok(Source::ALL.to_vec()),
        Some(names) => names.iter().map(|n| n.parse::<Source>()).collect(),
    }
}

#[get("/health")]
async fn health() -> HttpResponse {
    HttpResponse::Ok().json(Health { status: "ok", version: env!("CARGO_PKG_VERSION") })
}

#[get("/api/manga")]
async fn list_manga(data: web::Data<AppState>, query: web::Query<ListQuery>) -> Result<HttpResponse, AppError> {
    let page = query.page.unwrap_or(1);
    let limit = query.limit.unwrap_or(DEFAULT_PAGE_SIZE);
    Ok(ok(data.pipeline.list_works(page, limit).await?))
}

#[get("/api/manga/stats")]
async fn manga_stats(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(ok(data.pipeline.stats().await?))
}

#[get("/api/manga/{id}")]
async fn get_manga(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    Ok(ok(data.pipeline.get_work(&path.into_inner()).await?))
}

#[post("/api/manga/search")]
async fn search_manga(data: web::Data<AppState>, body: web::Json<SearchRequest>) -> Result<HttpResponse, AppError> {
    let sources = parse_sources(body.sources.as_deref())?;
    let cancel = data.request_token();
    Ok(ok(data.pipeline.search(&body.query, &sources, &cancel).await?))
}

#[post("/api/manga/sync")]
async fn sync_manga(data: web::Data<AppState>, body: web::Json<SyncRequest>) -> Result<HttpResponse, AppError> {
    let source: Source = body.source.parse()?;
    let cancel = data.request_token();
    let outcome = data.pipeline.sync_work(source, &body.external_id, &cancel).await?;
    let message = format!("Synced {} chapter(s) from {}", outcome.chapters.len(), source.display_name());
    Ok(HttpResponse::Ok().json(Envelope::ok(outcome).with_message(message)))
}

#[delete("/api/manga/{id}")]
async fn delete_manga(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    data.pipeline.delete_work(&path.into_inner()).await?;
    Ok(done("Manga deleted"))
}

#[get("/api/chapters/downloaded")]
async fn downloaded_chapters(data: web::Data<AppState>) -> Result<HttpResponse, AppError> {
    Ok(ok(data.pipeline.list_downloaded().await?))
}

#[get("/api/chapters/manga/{manga_id}")]
async fn chapters_for_manga(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    Ok(ok(data.pipeline.list_chapters(&path.into_inner()).await?))
}

#[post("/api/chapters/manga/{manga_id}/sync")]
async fn sync_chapters(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let cancel = data.request_token();
    let chapters = data.pipeline.sync_chapters(&path.into_inner(), &cancel).await?;
    let message = format!("{} chapter(s) after sync", chapters.len());
    Ok(HttpResponse::Ok().json(Envelope::ok(chapters).with_message(message)))
}

#[get("/api/chapters/{id}")]
async fn get_chapter(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let cancel = data.request_token();
    Ok(ok(data.pipeline.get_chapter(&path.into_inner(), &cancel).await?))
}

#[post("/api/chapters/{id}/download")]
async fn download_chapter(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    let cancel = data.request_token();
    let chapter = data.pipeline.download_chapter(&path.into_inner(), &cancel).await?;
    Ok(HttpResponse::Ok().json(Envelope::ok(chapter).with_message("Chapter downloaded")))
}

#[delete("/api/chapters/{id}")]
async fn delete_chapter(data: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, AppError> {
    data.pipeline.delete_chapter(&path.into_inner()).await?;
    Ok(done("Chapter deleted"))
}

#[get("/api/metrics")]
async fn metrics(data: web::Data<AppState>) -> HttpResponse {
    ok(data.metrics.get_all_metrics())
}

/// Register every route. Literal segments come before `{id}` captures.
pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(health)
        .service(list_manga)
        .service(manga_stats)
        .service(search_manga)
        .service(sync_manga)
        .service(get_manga)
        .service(delete_manga)
        .service(downloaded_chapters)
        .service(chapters_for_manga)
        .service(sync_chapters)
        .service(download_chapter)
        .service(get_chapter)
        .service(delete_chapter)
        .service(metrics);
}
