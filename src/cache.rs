use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use tracing::info;

use crate::errors::{AppError, AppResult};

// Entries never expire; an empty payload is cached like a match.
#[derive(Clone)]
pub struct QueryCache {
    connection: Arc<Mutex<Connection>>,
    path: PathBuf,
}

impl QueryCache {
    pub fn open<P: AsRef<Path>>(cache_dir: P, country_code: &str) -> AppResult<Self> {
        let cache_dir = cache_dir.as_ref();
        std::fs::create_dir_all(cache_dir)?;
        let path = cache_dir.join(cache_file_name(country_code)?);

        let flags = OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE;
        let connection = Connection::open_with_flags(&path, flags)?;
        configure(&connection)?;
        run_migrations(&connection)?;

        let cache = Self {
            connection: Arc::new(Mutex::new(connection)),
            path,
        };
        info!(
            target: "query_cache",
            path = %cache.path.display(),
            entries = cache.len()?,
            "query cache opened"
        );
        Ok(cache)
    }

    pub fn get(&self, query: &str) -> AppResult<Option<String>> {
        let conn = self.connection.lock();
        conn.query_row(
            "SELECT payload FROM query_cache WHERE query = ?1",
            [query],
            |row| row.get(0),
        )
        .optional()
        .map_err(AppError::from)
    }

    pub fn put(&self, query: &str, payload: &str) -> AppResult<()> {
        let conn = self.connection.lock();
        conn.execute(
            "INSERT INTO query_cache (query, payload, created_at)
            VALUES (?1, ?2, DATETIME('now'))
            ON CONFLICT(query) DO UPDATE SET
                payload = excluded.payload,
                created_at = DATETIME('now')",
            (query, payload),
        )?;
        Ok(())
    }

    pub fn len(&self) -> AppResult<usize> {
        let conn = self.connection.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM query_cache", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> AppResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

fn cache_file_name(country_code: &str) -> AppResult<String> {
    let code = country_code.trim().to_ascii_lowercase();
    if code.is_empty() || !code.chars().all(|c| c.is_ascii_alphanumeric()) {
        return Err(AppError::Config(format!(
            "country code {country_code:?} cannot name a cache file"
        )));
    }
    Ok(format!("geocode-cache-{code}.sqlite"))
}

fn configure(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        "#,
    )?;
    Ok(())
}

fn run_migrations(connection: &Connection) -> AppResult<()> {
    connection.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS query_cache (
            query TEXT PRIMARY KEY,
            payload TEXT NOT NULL,
            created_at TEXT NOT NULL DEFAULT (DATETIME('now'))
        );
        "#,
    )?;
    Ok(())
}
