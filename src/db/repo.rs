use super::model::OutboxRow;
use super::DurableStore;
use crate::error::StoreError;
use crate::model::{CommitMode, PendingSend};
use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tokio::sync::Mutex;
use tracing::{debug, instrument, warn};

pub type Pool = SqlitePool;

/// SQLite-backed outbox table.
///
/// The pool is opened lazily and can be closed and re-opened, which is how a
/// context releases its connection while frozen.
#[derive(Debug)]
pub struct SqliteStore {
    url: String,
    pool: Mutex<Option<Pool>>,
}

impl SqliteStore {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            url: prepare_sqlite_url(&database_url.into()),
            pool: Mutex::new(None),
        }
    }

    /// Open a store and fail if it cannot be used.
    pub async fn connect(database_url: impl Into<String>) -> Result<Self, StoreError> {
        let store = Self::new(database_url);
        store.open().await?;
        Ok(store)
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// Number of pending records.
    pub async fn count(&self) -> Result<i64, StoreError> {
        let pool = self.pool().await?;
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&pool)
            .await?;
        Ok(cnt)
    }

    async fn pool(&self) -> Result<Pool, StoreError> {
        let mut guard = self.pool.lock().await;
        if let Some(pool) = guard.as_ref() {
            return Ok(pool.clone());
        }
        let pool = init_pool(&self.url).await?;
        *guard = Some(pool.clone());
        Ok(pool)
    }
}

async fn init_pool(url: &str) -> Result<Pool, StoreError> {
    let in_memory = url.starts_with("sqlite::memory");
    let mut options = SqliteConnectOptions::from_str(url)
        .map_err(|e| StoreError::Unavailable(e.to_string()))?
        .create_if_missing(true)
        .synchronous(SqliteSynchronous::Full);
    if !in_memory {
        options = options.journal_mode(SqliteJournalMode::Wal);
    }
    // Every connection to `sqlite::memory:` is its own database.
    let max_connections = if in_memory { 1 } else { 4 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect_with(options)
        .await
        .map_err(|e| StoreError::Unavailable(e.to_string()))?;
    sqlx::migrate!("./migrations").run(&pool).await?;
    debug!(url, "outbox store opened");
    Ok(pool)
}

/// If using a file-backed SQLite URL, expand a leading `~/` and ensure the parent
/// directory exists. Leaves in-memory URLs untouched.
fn prepare_sqlite_url(url: &str) -> String {
    if !url.starts_with("sqlite:") || url.starts_with("sqlite::memory") {
        return url.to_string();
    }

    let rest = &url["sqlite:".len()..];
    let path_with_query = rest.strip_prefix("//").unwrap_or(rest);
    let (path_part, query_part) = match path_with_query.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (path_with_query, None),
    };
    if path_part.is_empty() {
        return url.to_string();
    }

    let expanded_path = match (path_part.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(rest), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), rest),
        _ => path_part.to_string(),
    };

    if let Some(parent) = std::path::Path::new(&expanded_path).parent() {
        if !parent.as_os_str().is_empty() {
            if let Err(err) = std::fs::create_dir_all(parent) {
                // The connect that follows reports the store as unavailable.
                warn!(?err, path = %parent.display(), "cannot create outbox directory");
            }
        }
    }

    let mut rebuilt = String::from("sqlite://");
    rebuilt.push_str(&expanded_path);
    if let Some(q) = query_part {
        rebuilt.push('?');
        rebuilt.push_str(q);
    }
    rebuilt
}

#[async_trait]
impl DurableStore for SqliteStore {
    async fn open(&self) -> Result<(), StoreError> {
        self.pool().await.map(|_| ())
    }

    async fn close(&self) {
        let pool = self.pool.lock().await.take();
        if let Some(pool) = pool {
            pool.close().await;
            debug!(url = %self.url, "outbox store closed");
        }
    }

    fn supports_immediate_commit(&self) -> bool {
        true
    }

    #[instrument(skip_all)]
    async fn add(
        &self,
        endpoint: &str,
        json_string: &str,
        mode: CommitMode,
    ) -> Result<i64, StoreError> {
        let pool = self.pool().await?;
        let insert = sqlx::query(
            "INSERT INTO outbox (endpoint, json_string) VALUES (?, ?) RETURNING id",
        )
        .bind(endpoint)
        .bind(json_string);
        let id: i64 = match mode {
            CommitMode::Deferred => insert.fetch_one(&pool).await?.get("id"),
            CommitMode::Immediate => {
                let mut tx = pool.begin().await?;
                let id: i64 = insert.fetch_one(&mut *tx).await?.get("id");
                tx.commit().await?;
                id
            }
        };
        Ok(id)
    }

    #[instrument(skip_all)]
    async fn list(&self) -> Result<Vec<PendingSend>, StoreError> {
        let pool = self.pool().await?;
        let rows: Vec<OutboxRow> =
            sqlx::query_as("SELECT id, endpoint, json_string FROM outbox ORDER BY id ASC")
                .fetch_all(&pool)
                .await?;
        Ok(rows.into_iter().map(PendingSend::from).collect())
    }

    #[instrument(skip_all)]
    async fn next_oldest(&self) -> Result<Option<PendingSend>, StoreError> {
        let pool = self.pool().await?;
        let row: Option<OutboxRow> = sqlx::query_as(
            "SELECT id, endpoint, json_string FROM outbox ORDER BY id ASC LIMIT 1",
        )
        .fetch_optional(&pool)
        .await?;
        Ok(row.map(PendingSend::from))
    }

    #[instrument(skip_all)]
    async fn delete(&self, id: i64) -> Result<(), StoreError> {
        let pool = self.pool().await?;
        sqlx::query("DELETE FROM outbox WHERE id = ?")
            .bind(id)
            .execute(&pool)
            .await?;
        Ok(())
    }
}
