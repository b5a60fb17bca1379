use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{sorted_pages, BindingUpdate, Store};
use crate::error::StoreError;
use crate::models::{
    BindingKey, Chapter, ChapterAttributes, ChapterKey, Page, Source, SourceBinding, SourceCount, Stats, Work,
    WorkAttributes, WorkStatus,
};

const WORK_COLUMNS: &str = "id, title, alt_titles, description, cover_url, authors, artists, genres, status, year, created_at, updated_at";
const CHAPTER_COLUMNS: &str = "id, work_id, number, title, volume, language, source, external_id, url, published_at, page_count, downloaded, download_path, created_at, updated_at";

/// SQLite-backed store. Natural keys are UNIQUE constraints, and page-set
/// replacement runs inside a single transaction. Every call runs on the
/// blocking pool.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        Self::init(Connection::open(path)?)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true)?;
        create_tables(&conn)?;
        Ok(Self { conn: Arc::new(Mutex::new(conn)) })
    }

    async fn run<T, F>(&self, f: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T, StoreError> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            f(&mut conn)
        })
        .await
        .map_err(|e| StoreError::Task(e.to_string()))?
    }
}

pub fn create_tables(conn: &Connection) -> rusqlite::Result<()> {
    log::info!("Creating tables if not exists...");

    conn.execute(
        "CREATE TABLE IF NOT EXISTS works (
            id TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            alt_titles TEXT NOT NULL DEFAULT '[]',
            description TEXT,
            cover_url TEXT,
            authors TEXT NOT NULL DEFAULT '[]',
            artists TEXT NOT NULL DEFAULT '[]',
            genres TEXT NOT NULL DEFAULT '[]',
            status TEXT NOT NULL DEFAULT 'unknown',
            year INTEGER,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS source_bindings (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            work_id TEXT NOT NULL,
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            url TEXT NOT NULL,
            last_synced_at TEXT NOT NULL,
            FOREIGN KEY (work_id) REFERENCES works (id) ON DELETE CASCADE,
            UNIQUE(source, external_id)
        );",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS chapters (
            id TEXT PRIMARY KEY,
            work_id TEXT NOT NULL,
            number REAL NOT NULL,
            title TEXT,
            volume TEXT,
            language TEXT NOT NULL,
            source TEXT NOT NULL,
            external_id TEXT NOT NULL,
            url TEXT NOT NULL,
            published_at TEXT,
            page_count INTEGER NOT NULL DEFAULT 0,
            downloaded INTEGER NOT NULL DEFAULT 0,
            download_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            FOREIGN KEY (work_id) REFERENCES works (id) ON DELETE CASCADE,
            UNIQUE(work_id, source, external_id)
        );",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS pages (
            chapter_id TEXT NOT NULL,
            number INTEGER NOT NULL,
            image_url TEXT NOT NULL,
            width INTEGER,
            height INTEGER,
            FOREIGN KEY (chapter_id) REFERENCES chapters (id) ON DELETE CASCADE,
            PRIMARY KEY (chapter_id, number)
        );",
        [],
    )?;

    // Migrations for databases created before these columns existed
    ensure_column(conn, "chapters", "volume", "TEXT")?;
    ensure_column(conn, "chapters", "download_path", "TEXT")?;

    conn.execute("CREATE INDEX IF NOT EXISTS idx_bindings_work ON source_bindings(work_id);", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_chapters_work ON chapters(work_id, number);", [])?;
    conn.execute("CREATE INDEX IF NOT EXISTS idx_chapters_downloaded ON chapters(downloaded);", [])?;

    Ok(())
}

fn ensure_column(conn: &Connection, table: &str, column: &str, column_type: &str) -> rusqlite::Result<()> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({})", table))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(());
        }
    }
    conn.execute(&format!("ALTER TABLE {} ADD COLUMN {} {}", table, column, column_type), [])?;
    Ok(())
}

/// Translate constraint failures on natural keys into `UniqueViolation`.
fn unique_or_db(e: rusqlite::Error, what: impl FnOnce() -> String) -> StoreError {
    if let rusqlite::Error::SqliteFailure(failure, _) = &e {
        if failure.code == ErrorCode::ConstraintViolation
            && (failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
                || failure.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_PRIMARYKEY)
        {
            return StoreError::UniqueViolation(what());
        }
    }
    StoreError::Database(e)
}

fn to_json<T: Serialize>(value: &T) -> Result<String, StoreError> {
    serde_json::to_string(value).map_err(|e| StoreError::Corrupt(e.to_string()))
}

fn from_json<T: DeserializeOwned>(text: &str) -> Result<T, StoreError> {
    serde_json::from_str(text).map_err(|e| StoreError::Corrupt(format!("{}: {}", e, text)))
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn parse_ts(text: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {}: {}", text, e)))
}

fn parse_source(text: &str) -> Result<Source, StoreError> {
    Source::parse(text).ok_or_else(|| StoreError::Corrupt(format!("source {}", text)))
}

struct WorkRow {
    id: String,
    title: String,
    alt_titles: String,
    description: Option<String>,
    cover_url: Option<String>,
    authors: String,
    artists: String,
    genres: String,
    status: String,
    year: Option<i32>,
    created_at: String,
    updated_at: String,
}

impl WorkRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            title: row.get(1)?,
            alt_titles: row.get(2)?,
            description: row.get(3)?,
            cover_url: row.get(4)?,
            authors: row.get(5)?,
            artists: row.get(6)?,
            genres: row.get(7)?,
            status: row.get(8)?,
            year: row.get(9)?,
            created_at: row.get(10)?,
            updated_at: row.get(11)?,
        })
    }

    fn into_work(self, bindings: Vec<SourceBinding>) -> Result<Work, StoreError> {
        Ok(Work {
            alt_titles: from_json(&self.alt_titles)?,
            authors: from_json(&self.authors)?,
            artists: from_json(&self.artists)?,
            genres: from_json(&self.genres)?,
            status: WorkStatus::from_upstream(&self.status),
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            title: self.title,
            description: self.description,
            cover_url: self.cover_url,
            year: self.year,
            bindings,
        })
    }
}

struct ChapterRow {
    id: String,
    work_id: String,
    number: f64,
    title: Option<String>,
    volume: Option<String>,
    language: String,
    source: String,
    external_id: String,
    url: String,
    published_at: Option<String>,
    page_count: u32,
    downloaded: bool,
    download_path: Option<String>,
    created_at: String,
    updated_at: String,
}

impl ChapterRow {
    fn read(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            work_id: row.get(1)?,
            number: row.get(2)?,
            title: row.get(3)?,
            volume: row.get(4)?,
            language: row.get(5)?,
            source: row.get(6)?,
            external_id: row.get(7)?,
            url: row.get(8)?,
            published_at: row.get(9)?,
            page_count: row.get(10)?,
            downloaded: row.get(11)?,
            download_path: row.get(12)?,
            created_at: row.get(13)?,
            updated_at: row.get(14)?,
        })
    }

    fn into_chapter(self, pages: Vec<Page>) -> Result<Chapter, StoreError> {
        Ok(Chapter {
            source: parse_source(&self.source)?,
            published_at: self.published_at.as_deref().map(parse_ts).transpose()?,
            created_at: parse_ts(&self.created_at)?,
            updated_at: parse_ts(&self.updated_at)?,
            id: self.id,
            work_id: self.work_id,
            number: self.number,
            title: self.title,
            volume: self.volume,
            language: self.language,
            external_id: self.external_id,
            url: self.url,
            page_count: self.page_count,
            downloaded: self.downloaded,
            download_path: self.download_path,
            pages,
        })
    }
}

fn load_bindings(conn: &Connection, work_id: &str) -> Result<Vec<SourceBinding>, StoreError> {
    let mut stmt = conn.prepare(
        "SELECT work_id, source, external_id, url, last_synced_at FROM source_bindings WHERE work_id = ?1 ORDER BY id",
    )?;
    let rows = stmt.query_map([work_id], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
            row.get::<_, String>(3)?,
            row.get::<_, String>(4)?,
        ))
    })?;
    let mut bindings = Vec::new();
    for row in rows {
        let (work_id, source, external_id, url, synced) = row?;
        bindings.push(SourceBinding {
            work_id,
            source: parse_source(&source)?,
            external_id,
            url,
            last_synced_at: parse_ts(&synced)?,
        });
    }
    Ok(bindings)
}

fn load_work(conn: &Connection, id: &str) -> Result<Option<Work>, StoreError> {
    let row = conn
        .query_row(&format!("SELECT {} FROM works WHERE id = ?1", WORK_COLUMNS), [id], WorkRow::read)
        .optional()?;
    match row {
        Some(row) => {
            let bindings = load_bindings(conn, &row.id)?;
            Ok(Some(row.into_work(bindings)?))
        }
        None => Ok(None),
    }
}

fn load_works(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Work>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, WorkRow::read)?;
    let mut raw = Vec::new();
    for row in rows {
        raw.push(row?);
    }
    raw.into_iter()
        .map(|row| {
            let bindings = load_bindings(conn, &row.id)?;
            row.into_work(bindings)
        })
        .collect()
}

fn load_pages(conn: &Connection, chapter_id: &str) -> Result<Vec<Page>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT number, image_url, width, height FROM pages WHERE chapter_id = ?1 ORDER BY number")?;
    let rows = stmt.query_map([chapter_id], |row| {
        Ok(Page { number: row.get(0)?, image_url: row.get(1)?, width: row.get(2)?, height: row.get(3)? })
    })?;
    let mut pages = Vec::new();
    for row in rows {
        pages.push(row?);
    }
    Ok(pages)
}

fn load_chapters(conn: &Connection, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<Vec<Chapter>, StoreError> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, ChapterRow::read)?;
    let mut raw = Vec::new();
    for row in rows {
        raw.push(row?);
    }
    raw.into_iter()
        .map(|row| {
            let pages = load_pages(conn, &row.id)?;
            row.into_chapter(pages)
        })
        .collect()
}

fn load_chapter(conn: &Connection, id: &str) -> Result<Option<Chapter>, StoreError> {
    let sql = format!("SELECT {} FROM chapters WHERE id = ?1", CHAPTER_COLUMNS);
    Ok(load_chapters(conn, &sql, &[&id])?.into_iter().next())
}

fn replace_pages(tx: &Transaction<'_>, chapter_id: &str, pages: &[Page]) -> Result<(), StoreError> {
    tx.execute("DELETE FROM pages WHERE chapter_id = ?1", [chapter_id])?;
    let mut insert =
        tx.prepare("INSERT INTO pages (chapter_id, number, image_url, width, height) VALUES (?1, ?2, ?3, ?4, ?5)")?;
    for page in pages {
        insert
            .execute(params![chapter_id, page.number, page.image_url, page.width, page.height])
            .map_err(|e| unique_or_db(e, || format!("page {} of chapter {}", page.number, chapter_id)))?;
    }
    tx.execute("UPDATE chapters SET page_count = ?1 WHERE id = ?2", params![pages.len() as u32, chapter_id])?;
    Ok(())
}

fn escape_like(query: &str) -> String {
    query.replace('\\', "\\\\").replace('%', "\\%").replace('_', "\\_")
}

#[async_trait]
impl Store for SqliteStore {
    async fn find_work(&self, id: &str) -> Result<Option<Work>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| load_work(conn, &id)).await
    }

    async fn find_work_by_binding(&self, key: &BindingKey) -> Result<Option<Work>, StoreError> {
        let key = key.clone();
        self.run(move |conn| {
            let work_id: Option<String> = conn
                .query_row(
                    "SELECT work_id FROM source_bindings WHERE source = ?1 AND external_id = ?2",
                    params![key.source.as_str(), key.external_id],
                    |row| row.get(0),
                )
                .optional()?;
            match work_id {
                Some(id) => load_work(conn, &id),
                None => Ok(None),
            }
        })
        .await
    }

    async fn list_works(&self, offset: u32, limit: u32) -> Result<Vec<Work>, StoreError> {
        let sql = format!("SELECT {} FROM works ORDER BY updated_at DESC, id LIMIT ?1 OFFSET ?2", WORK_COLUMNS);
        self.run(move |conn| load_works(conn, &sql, &[&limit, &offset])).await
    }

    async fn search_works(&self, query: &str, limit: u32) -> Result<Vec<Work>, StoreError> {
        let pattern = format!("%{}%", escape_like(&query.trim().to_lowercase()));
        let sql = format!(
            "SELECT {} FROM works
             WHERE lower(title) LIKE ?1 ESCAPE '\\'
                OR lower(alt_titles) LIKE ?1 ESCAPE '\\'
                OR lower(authors) LIKE ?1 ESCAPE '\\'
             ORDER BY title, id LIMIT ?2",
            WORK_COLUMNS
        );
        self.run(move |conn| load_works(conn, &sql, &[&pattern, &limit])).await
    }

    async fn create_work(&self, attrs: &WorkAttributes, binding: &BindingUpdate) -> Result<Work, StoreError> {
        let attrs = attrs.clone();
        let binding = binding.clone();
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = ts(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                &format!("INSERT INTO works ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)", WORK_COLUMNS),
                params![
                    id,
                    attrs.title,
                    to_json(&attrs.alt_titles)?,
                    attrs.description,
                    attrs.cover_url,
                    to_json(&attrs.authors)?,
                    to_json(&attrs.artists)?,
                    to_json(&attrs.genres)?,
                    attrs.status.as_str(),
                    attrs.year,
                    now,
                    now,
                ],
            )?;
            tx.execute(
                "INSERT INTO source_bindings (work_id, source, external_id, url, last_synced_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                params![id, binding.key.source.as_str(), binding.key.external_id, binding.url, ts(&binding.synced_at)],
            )
            .map_err(|e| unique_or_db(e, || format!("binding {}", binding.key)))?;
            tx.commit()?;
            load_work(conn, &id)?.ok_or_else(|| StoreError::Missing(format!("work {}", id)))
        })
        .await
    }

    async fn update_work(
        &self,
        id: &str,
        attrs: &WorkAttributes,
        binding: &BindingUpdate,
    ) -> Result<Work, StoreError> {
        let id = id.to_string();
        let attrs = attrs.clone();
        let binding = binding.clone();
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let owner: Option<String> = tx
                .query_row(
                    "SELECT work_id FROM source_bindings WHERE source = ?1 AND external_id = ?2",
                    params![binding.key.source.as_str(), binding.key.external_id],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(owner) = owner.as_deref() {
                if owner != id {
                    return Err(StoreError::UniqueViolation(format!("binding {} belongs to {}", binding.key, owner)));
                }
            }
            let changed = tx.execute(
                "UPDATE works SET title = ?1, alt_titles = ?2, description = ?3, cover_url = ?4, authors = ?5,
                    artists = ?6, genres = ?7, status = ?8, year = ?9, updated_at = ?10 WHERE id = ?11",
                params![
                    attrs.title,
                    to_json(&attrs.alt_titles)?,
                    attrs.description,
                    attrs.cover_url,
                    to_json(&attrs.authors)?,
                    to_json(&attrs.artists)?,
                    to_json(&attrs.genres)?,
                    attrs.status.as_str(),
                    attrs.year,
                    ts(&Utc::now()),
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Missing(format!("work {}", id)));
            }
            if owner.is_some() {
                tx.execute(
                    "UPDATE source_bindings SET url = ?1, last_synced_at = ?2 WHERE source = ?3 AND external_id = ?4",
                    params![binding.url, ts(&binding.synced_at), binding.key.source.as_str(), binding.key.external_id],
                )?;
            } else {
                tx.execute(
                    "INSERT INTO source_bindings (work_id, source, external_id, url, last_synced_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![id, binding.key.source.as_str(), binding.key.external_id, binding.url, ts(&binding.synced_at)],
                )
                .map_err(|e| unique_or_db(e, || format!("binding {}", binding.key)))?;
            }
            tx.commit()?;
            load_work(conn, &id)?.ok_or_else(|| StoreError::Missing(format!("work {}", id)))
        })
        .await
    }

    async fn delete_work(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.run(move |conn| Ok(conn.execute("DELETE FROM works WHERE id = ?1", [id.as_str()])? > 0)).await
    }

    async fn find_chapter(&self, id: &str) -> Result<Option<Chapter>, StoreError> {
        let id = id.to_string();
        self.run(move |conn| load_chapter(conn, &id)).await
    }

    async fn find_chapter_by_key(&self, key: &ChapterKey) -> Result<Option<Chapter>, StoreError> {
        let key = key.clone();
        let sql = format!(
            "SELECT {} FROM chapters WHERE work_id = ?1 AND source = ?2 AND external_id = ?3",
            CHAPTER_COLUMNS
        );
        self.run(move |conn| {
            let source = key.source.as_str();
            Ok(load_chapters(conn, &sql, &[&key.work_id, &source, &key.external_id])?.into_iter().next())
        })
        .await
    }

    async fn create_chapter(
        &self,
        key: &ChapterKey,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        let key = key.clone();
        let attrs = attrs.clone();
        let pages = pages.map(sorted_pages);
        self.run(move |conn| {
            let id = Uuid::new_v4().to_string();
            let now = ts(&Utc::now());
            let tx = conn.transaction()?;
            tx.execute(
                &format!(
                    "INSERT INTO chapters ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 0, 0, NULL, ?11, ?12)",
                    CHAPTER_COLUMNS
                ),
                params![
                    id,
                    key.work_id,
                    attrs.number,
                    attrs.title,
                    attrs.volume,
                    attrs.language,
                    key.source.as_str(),
                    key.external_id,
                    attrs.url,
                    attrs.published_at.as_ref().map(ts),
                    now,
                    now,
                ],
            )
            .map_err(|e| match unique_or_db(e, || format!("chapter {}", key)) {
                StoreError::Database(rusqlite::Error::SqliteFailure(f, msg))
                    if f.code == ErrorCode::ConstraintViolation =>
                {
                    log::debug!("chapter insert rejected: {:?}", msg);
                    StoreError::Missing(format!("work {}", key.work_id))
                }
                other => other,
            })?;
            if let Some(pages) = &pages {
                replace_pages(&tx, &id, pages)?;
            }
            tx.commit()?;
            load_chapter(conn, &id)?.ok_or_else(|| StoreError::Missing(format!("chapter {}", id)))
        })
        .await
    }

    async fn update_chapter(
        &self,
        id: &str,
        attrs: &ChapterAttributes,
        pages: Option<&[Page]>,
    ) -> Result<Chapter, StoreError> {
        let id = id.to_string();
        let attrs = attrs.clone();
        let pages = pages.map(sorted_pages);
        self.run(move |conn| {
            let tx = conn.transaction()?;
            let changed = tx.execute(
                "UPDATE chapters SET number = ?1, title = ?2, volume = ?3, language = ?4, url = ?5,
                    published_at = ?6, updated_at = ?7 WHERE id = ?8",
                params![
                    attrs.number,
                    attrs.title,
                    attrs.volume,
                    attrs.language,
                    attrs.url,
                    attrs.published_at.as_ref().map(ts),
                    ts(&Utc::now()),
                    id,
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::Missing(format!("chapter {}", id)));
            }
            if let Some(pages) = &pages {
                replace_pages(&tx, &id, pages)?;
            }
            tx.commit()?;
            load_chapter(conn, &id)?.ok_or_else(|| StoreError::Missing(format!("chapter {}", id)))
        })
        .await
    }

    async fn list_chapters(&self, work_id: &str) -> Result<Vec<Chapter>, StoreError> {
        let work_id = work_id.to_string();
        let sql = format!("SELECT {} FROM chapters WHERE work_id = ?1 ORDER BY number, created_at", CHAPTER_COLUMNS);
        self.run(move |conn| load_chapters(conn, &sql, &[&work_id])).await
    }

    async fn mark_downloaded(&self, id: &str, download_path: &str) -> Result<Chapter, StoreError> {
        let id = id.to_string();
        let download_path = download_path.to_string();
        self.run(move |conn| {
            let changed = conn.execute(
                "UPDATE chapters SET downloaded = 1, download_path = ?1, updated_at = ?2 WHERE id = ?3",
                params![download_path, ts(&Utc::now()), id],
            )?;
            if changed == 0 {
                return Err(StoreError::Missing(format!("chapter {}", id)));
            }
            load_chapter(conn, &id)?.ok_or_else(|| StoreError::Missing(format!("chapter {}", id)))
        })
        .await
    }

    async fn list_downloaded(&self) -> Result<Vec<Chapter>, StoreError> {
        let sql = format!("SELECT {} FROM chapters WHERE downloaded = 1 ORDER BY updated_at DESC, id", CHAPTER_COLUMNS);
        self.run(move |conn| load_chapters(conn, &sql, &[])).await
    }

    async fn delete_chapter(&self, id: &str) -> Result<bool, StoreError> {
        let id = id.to_string();
        self.run(move |conn| Ok(conn.execute("DELETE FROM chapters WHERE id = ?1", [id.as_str()])? > 0)).await
    }

    async fn stats(&self) -> Result<Stats, StoreError> {
        self.run(|conn| {
            let total_works: i64 = conn.query_row("SELECT COUNT(*) FROM works", [], |row| row.get(0))?;
            let total_chapters: i64 = conn.query_row("SELECT COUNT(*) FROM chapters", [], |row| row.get(0))?;

            let mut stmt =
                conn.prepare("SELECT source, COUNT(DISTINCT work_id) FROM source_bindings GROUP BY source")?;
            let rows = stmt.query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?;
            let mut per_source = Vec::new();
            for row in rows {
                let (source, works) = row?;
                per_source.push(SourceCount { source: parse_source(&source)?, works });
            }
            per_source.sort_by_key(|c| c.source);

            Ok(Stats { total_works, total_chapters, per_source })
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;
    use std::time::Duration;

    fn binding(source: Source, id: &str) -> BindingUpdate {
        BindingUpdate {
            key: BindingKey { source, external_id: id.to_string() },
            url: format!("https://example.org/{}", id),
            synced_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_tables_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        create_tables(&conn).unwrap();
        create_tables(&conn).unwrap();
        ensure_column(&conn, "chapters", "volume", "TEXT").unwrap();
    }

    #[test]
    fn test_escape_like() {
        assert_eq!(escape_like("100%_a\\b"), "100\\%\\_a\\\\b");
    }

    #[tokio::test]
    async fn test_binding_unique_violation_is_classified() {
        let store = SqliteStore::open_in_memory().unwrap();
        let attrs = WorkAttributes { title: "A".into(), ..WorkAttributes::default() };
        store.create_work(&attrs, &binding(Source::ZonaTmo, "a")).await.unwrap();
        let err = store.create_work(&attrs, &binding(Source::ZonaTmo, "a")).await.unwrap_err();
        assert!(matches!(err, StoreError::UniqueViolation(_)));
        // the failed transaction left no orphan work behind
        assert_eq!(store.stats().await.unwrap().total_works, 1);
    }

    #[tokio::test]
    async fn test_chapter_for_missing_work_is_missing() {
        let store = SqliteStore::open_in_memory().unwrap();
        let key = ChapterKey { work_id: "nope".into(), source: Source::MangaDex, external_id: "c".into() };
        let attrs = ChapterAttributes {
            number: 1.0,
            title: None,
            volume: None,
            language: "es".into(),
            url: String::new(),
            published_at: None,
        };
        let err = store.create_chapter(&key, &attrs, None).await.unwrap_err();
        assert!(matches!(err, StoreError::Missing(_)));
    }

    #[tokio::test]
    async fn test_calls_do_not_block_the_runtime() {
        let store = Arc::new(SqliteStore::open_in_memory().unwrap());
        let held = store.conn.clone();
        let (locked_tx, locked_rx) = mpsc::channel();
        let holder = std::thread::spawn(move || {
            let _guard = held.lock().unwrap();
            locked_tx.send(()).unwrap();
            std::thread::sleep(Duration::from_millis(300));
        });
        locked_rx.recv().unwrap();

        let stats = {
            let store = store.clone();
            tokio::spawn(async move { store.stats().await })
        };
        // The runtime thread stays free while the store waits on the connection.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!stats.is_finished());

        assert_eq!(stats.await.unwrap().unwrap().total_works, 0);
        holder.join().unwrap();
    }

    #[tokio::test]
    async fn test_repeated_page_numbers_keep_the_first() {
        let store = SqliteStore::open_in_memory().unwrap();
        let attrs = WorkAttributes { title: "A".into(), ..WorkAttributes::default() };
        let work = store.create_work(&attrs, &binding(Source::MangaPlus, "100020")).await.unwrap();
        let key = ChapterKey { work_id: work.id.clone(), source: Source::MangaPlus, external_id: "c".into() };
        let chapter_attrs = ChapterAttributes {
            number: 1.0,
            title: None,
            volume: None,
            language: "en".into(),
            url: String::new(),
            published_at: None,
        };
        let page = |number: u32, url: &str| Page { number, image_url: url.to_string(), width: None, height: None };

        let chapter = store
            .create_chapter(&key, &chapter_attrs, Some(&[page(2, "b"), page(1, "a"), page(2, "b-again")]))
            .await
            .unwrap();
        assert_eq!(chapter.page_count, 2);
        assert_eq!(chapter.pages, vec![page(1, "a"), page(2, "b")]);

        let updated = store
            .update_chapter(&chapter.id, &chapter_attrs, Some(&[page(1, "x"), page(1, "y")]))
            .await
            .unwrap();
        assert_eq!(updated.page_count, 1);
        assert_eq!(updated.pages, vec![page(1, "x")]);
    }
}
