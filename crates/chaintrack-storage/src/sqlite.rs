//! SQLite log store.
//!
//! Persists every filter entry (its log sequence, last processed block and
//! chain identity) to a single SQLite file. Each `store_event` runs in one
//! transaction, so a crash mid-write leaves the previous state intact.
//!
//! # Usage
//! ```rust,no_run
//! use chaintrack_storage::sqlite::SqliteLogStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteLogStore::open("./logs.db").await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteLogStore::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use tracing::debug;

use chaintrack_core::{Block, Entry, Event, FilterConfig, GenesisRecord, Log, LogStore, TrackerError};

fn storage_err(e: impl std::fmt::Display) -> TrackerError {
    TrackerError::Storage(e.to_string())
}

/// SQLite-backed [`LogStore`]. Entries share the pool.
pub struct SqliteLogStore {
    pool: SqlitePool,
}

impl SqliteLogStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./logs.db"`) or a full
    /// SQLite URL (`"sqlite:./logs.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, TrackerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database.
    ///
    /// Every connection to `:memory:` is its own database, so the pool is
    /// pinned to one long-lived connection. All data is lost on drop.
    pub async fn in_memory() -> Result<Self, TrackerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;

        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), TrackerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS entries (
                fingerprint     TEXT    PRIMARY KEY,
                filter_json     TEXT    NOT NULL,
                last_block_json TEXT,
                chain_id        INTEGER,
                genesis_hash    TEXT,
                updated_at      INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS logs (
                fingerprint TEXT    NOT NULL,
                idx         INTEGER NOT NULL,
                log_json    TEXT    NOT NULL,
                PRIMARY KEY (fingerprint, idx)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(())
    }

    /// Number of entries in the database.
    pub async fn entry_count(&self) -> Result<u64, TrackerError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM entries")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(cnt as u64)
    }

    /// Close the pool, flushing pending writes.
    pub async fn close(&self) {
        self.pool.close().await;
    }
}

#[async_trait]
impl LogStore for SqliteLogStore {
    async fn get_entry(&self, filter: &FilterConfig) -> Result<Arc<dyn Entry>, TrackerError> {
        let fingerprint = filter.fingerprint();
        let filter_json = serde_json::to_string(&filter.normalized()).map_err(storage_err)?;

        sqlx::query(
            "INSERT OR IGNORE INTO entries (fingerprint, filter_json, updated_at)
             VALUES (?, ?, ?)",
        )
        .bind(&fingerprint)
        .bind(&filter_json)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        Ok(Arc::new(SqliteEntry {
            pool: self.pool.clone(),
            fingerprint,
        }))
    }
}

// ─── Entry ───────────────────────────────────────────────────────────────────

/// One filter's rows in a [`SqliteLogStore`].
pub struct SqliteEntry {
    pool: SqlitePool,
    fingerprint: String,
}

impl SqliteEntry {
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Unix time of the last write to this entry.
    pub async fn updated_at(&self) -> Result<i64, TrackerError> {
        sqlx::query_scalar("SELECT updated_at FROM entries WHERE fingerprint = ?")
            .bind(&self.fingerprint)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl Entry for SqliteEntry {
    async fn last_index(&self) -> Result<u64, TrackerError> {
        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs WHERE fingerprint = ?")
            .bind(&self.fingerprint)
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(cnt as u64)
    }

    async fn store_event(&self, event: &Event) -> Result<(), TrackerError> {
        let block_json = serde_json::to_string(&event.block).map_err(storage_err)?;
        let mut tx = self.pool.begin().await.map_err(storage_err)?;

        let cnt: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM logs WHERE fingerprint = ?")
            .bind(&self.fingerprint)
            .fetch_one(&mut *tx)
            .await
            .map_err(storage_err)?;
        let mut next = cnt as u64;

        if let Some(len) = event.truncate_to {
            if len > next {
                // Dropping `tx` rolls back.
                return Err(TrackerError::Storage(format!(
                    "cannot truncate {next} logs to length {len}"
                )));
            }
            sqlx::query("DELETE FROM logs WHERE fingerprint = ? AND idx >= ?")
                .bind(&self.fingerprint)
                .bind(len as i64)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            next = len;
        }

        for log in &event.added {
            let log_json = serde_json::to_string(log).map_err(storage_err)?;
            sqlx::query("INSERT INTO logs (fingerprint, idx, log_json) VALUES (?, ?, ?)")
                .bind(&self.fingerprint)
                .bind(next as i64)
                .bind(&log_json)
                .execute(&mut *tx)
                .await
                .map_err(storage_err)?;
            next += 1;
        }

        sqlx::query(
            "UPDATE entries SET last_block_json = ?, updated_at = ? WHERE fingerprint = ?",
        )
        .bind(&block_json)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.fingerprint)
        .execute(&mut *tx)
        .await
        .map_err(storage_err)?;

        tx.commit().await.map_err(storage_err)?;

        debug!(
            fingerprint = %self.fingerprint,
            added = event.added.len(),
            truncate_to = ?event.truncate_to,
            block = event.block.number,
            "event stored"
        );
        Ok(())
    }

    async fn get_log(&self, index: u64) -> Result<Option<Log>, TrackerError> {
        let raw: Option<String> =
            sqlx::query_scalar("SELECT log_json FROM logs WHERE fingerprint = ? AND idx = ?")
                .bind(&self.fingerprint)
                .bind(index as i64)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        raw.map(|s| serde_json::from_str(&s).map_err(storage_err))
            .transpose()
    }

    async fn get_last_block(&self) -> Result<Option<Block>, TrackerError> {
        let raw: Option<Option<String>> =
            sqlx::query_scalar("SELECT last_block_json FROM entries WHERE fingerprint = ?")
                .bind(&self.fingerprint)
                .fetch_optional(&self.pool)
                .await
                .map_err(storage_err)?;
        raw.flatten()
            .map(|s| serde_json::from_str(&s).map_err(storage_err))
            .transpose()
    }

    async fn genesis(&self) -> Result<Option<GenesisRecord>, TrackerError> {
        let row = sqlx::query("SELECT chain_id, genesis_hash FROM entries WHERE fingerprint = ?")
            .bind(&self.fingerprint)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        let Some(row) = row else {
            return Ok(None);
        };
        let chain_id: Option<i64> = row.try_get("chain_id").map_err(storage_err)?;
        let genesis_hash: Option<String> = row.try_get("genesis_hash").map_err(storage_err)?;
        Ok(chain_id.zip(genesis_hash).map(|(chain_id, genesis_hash)| GenesisRecord {
            chain_id: chain_id as u64,
            genesis_hash,
        }))
    }

    async fn upsert_genesis(&self, chain_id: u64, genesis_hash: &str) -> Result<(), TrackerError> {
        sqlx::query(
            "UPDATE entries SET chain_id = ?, genesis_hash = ?, updated_at = ? WHERE fingerprint = ?",
        )
        .bind(chain_id as i64)
        .bind(genesis_hash)
        .bind(chrono::Utc::now().timestamp())
        .bind(&self.fingerprint)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        debug!(fingerprint = %self.fingerprint, chain_id, genesis = %genesis_hash, "genesis recorded");
        Ok(())
    }

    async fn logs(&self) -> Result<Vec<Log>, TrackerError> {
        let rows = sqlx::query("SELECT log_json FROM logs WHERE fingerprint = ? ORDER BY idx")
            .bind(&self.fingerprint)
            .fetch_all(&self.pool)
            .await
            .map_err(storage_err)?;

        let mut logs = Vec::with_capacity(rows.len());
        for row in rows {
            let raw: String = row.try_get("log_json").map_err(storage_err)?;
            logs.push(serde_json::from_str(&raw).map_err(storage_err)?);
        }
        Ok(logs)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
