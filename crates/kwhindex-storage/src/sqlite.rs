//! SQLite storage backend.
//!
//! Persists cursors, transaction records and event records to a single
//! SQLite file. Deduplication relies on `UNIQUE (tx_hash, log_index)` with
//! `INSERT .. ON CONFLICT DO NOTHING`, so a duplicate is a zero-row insert.
//!
//! ```rust,no_run
//! use kwhindex_storage::sqlite::SqliteStorage;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let store = SqliteStorage::open("./kwhindex.db").await?;
//! let scratch = SqliteStorage::in_memory().await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use tracing::debug;

use kwhindex_core::{
    Args, CursorStore, EventQuery, EventRecord, EventStore, IndexerError, TxRecord, TxStatus,
};

fn storage_err(e: impl std::fmt::Display) -> IndexerError {
    IndexerError::Storage(e.to_string())
}

pub struct SqliteStorage {
    pool: SqlitePool,
}

impl SqliteStorage {
    /// Open (or create) a database at `path`.
    ///
    /// Accepts a plain file path (`"./kwhindex.db"`) or a SQLite URL
    /// (`"sqlite:./kwhindex.db?mode=rwc"`).
    pub async fn open(path: &str) -> Result<Self, IndexerError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url).await.map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    /// Open a private in-memory database. A single connection keeps every
    /// query on the same database.
    pub async fn in_memory() -> Result<Self, IndexerError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(storage_err)?;
        let storage = Self { pool };
        storage.init_schema().await?;
        Ok(storage)
    }

    async fn init_schema(&self) -> Result<(), IndexerError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS cursors (
                cursor_key   TEXT    PRIMARY KEY,
                block_number INTEGER NOT NULL,
                updated_at   INTEGER NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS txs (
                id            INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id      INTEGER NOT NULL,
                block_number  INTEGER,
                block_hash    TEXT,
                tx_hash       TEXT    NOT NULL,
                log_index     INTEGER NOT NULL,
                contract      TEXT    NOT NULL,
                event         TEXT    NOT NULL,
                args_json     TEXT    NOT NULL,
                from_addr     TEXT    NOT NULL,
                to_addr       TEXT    NOT NULL,
                status        TEXT    NOT NULL,
                block_time_ms INTEGER NOT NULL,
                UNIQUE (tx_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS events (
                id           INTEGER PRIMARY KEY AUTOINCREMENT,
                chain_id     INTEGER NOT NULL,
                block_number INTEGER,
                tx_hash      TEXT    NOT NULL,
                log_index    INTEGER NOT NULL,
                contract     TEXT    NOT NULL,
                name         TEXT    NOT NULL,
                args_json    TEXT    NOT NULL,
                ts_ms        INTEGER NOT NULL,
                day_key      TEXT    NOT NULL,
                UNIQUE (tx_hash, log_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;

        for ddl in [
            "CREATE INDEX IF NOT EXISTS idx_txs_time ON txs (block_time_ms);",
            "CREATE INDEX IF NOT EXISTS idx_txs_event ON txs (event);",
            "CREATE INDEX IF NOT EXISTS idx_events_day ON events (day_key);",
        ] {
            sqlx::query(ddl).execute(&self.pool).await.map_err(storage_err)?;
        }

        Ok(())
    }

    /// Close the pool, waiting for in-flight queries.
    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn tx_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM txs")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    pub async fn event_count(&self) -> Result<u64, IndexerError> {
        let row = sqlx::query("SELECT COUNT(*) AS cnt FROM events")
            .fetch_one(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.get::<i64, _>("cnt") as u64)
    }

    async fn select_txs(
        &self,
        filter: &EventQuery,
        window: Option<(DateTime<Utc>, DateTime<Utc>)>,
        order_and_limit: &str,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT chain_id, block_number, block_hash, tx_hash, log_index, contract, event,
                    args_json, from_addr, to_addr, status, block_time_ms
             FROM txs WHERE 1 = 1",
        );
        if !filter.events.is_empty() {
            qb.push(" AND event IN (");
            let mut names = qb.separated(", ");
            for name in &filter.events {
                names.push_bind(name.clone());
            }
            names.push_unseparated(")");
        }
        if let Some(contract) = &filter.contract {
            qb.push(" AND contract = ").push_bind(contract.to_lowercase());
        }
        if let Some(who) = &filter.participant {
            let who = who.to_lowercase();
            qb.push(" AND (from_addr = ")
                .push_bind(who.clone())
                .push(" OR to_addr = ")
                .push_bind(who)
                .push(")");
        }
        if let Some((from, to)) = window {
            qb.push(" AND block_time_ms >= ")
                .push_bind(from.timestamp_millis())
                .push(" AND block_time_ms < ")
                .push_bind(to.timestamp_millis());
        }
        qb.push(" ").push(order_and_limit);

        let rows = qb.build().fetch_all(&self.pool).await.map_err(storage_err)?;
        rows.iter().map(tx_from_row).collect()
    }
}

fn tx_from_row(row: &SqliteRow) -> Result<TxRecord, IndexerError> {
    let args: Args = serde_json::from_str(row.get::<&str, _>("args_json")).map_err(storage_err)?;
    let status: TxStatus = row.get::<&str, _>("status").parse().map_err(storage_err)?;
    let ms: i64 = row.get("block_time_ms");
    Ok(TxRecord {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        block_number: row.get::<Option<i64>, _>("block_number").map(|n| n as u64),
        block_hash: row.get("block_hash"),
        tx_hash: row.get("tx_hash"),
        log_index: row.get("log_index"),
        contract: row.get("contract"),
        event: row.get("event"),
        args,
        from: row.get("from_addr"),
        to: row.get("to_addr"),
        status,
        block_time: DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| IndexerError::Storage(format!("bad block_time_ms {ms}")))?,
    })
}

fn event_from_row(row: &SqliteRow) -> Result<EventRecord, IndexerError> {
    let args: Args = serde_json::from_str(row.get::<&str, _>("args_json")).map_err(storage_err)?;
    let ms: i64 = row.get("ts_ms");
    Ok(EventRecord {
        chain_id: row.get::<i64, _>("chain_id") as u64,
        block_number: row.get::<Option<i64>, _>("block_number").map(|n| n as u64),
        tx_hash: row.get("tx_hash"),
        log_index: row.get("log_index"),
        contract: row.get("contract"),
        name: row.get("name"),
        args,
        ts: DateTime::from_timestamp_millis(ms)
            .ok_or_else(|| IndexerError::Storage(format!("bad ts_ms {ms}")))?,
        day_key: row.get("day_key"),
    })
}

#[async_trait]
impl CursorStore for SqliteStorage {
    async fn get_cursor(&self, key: &str) -> Result<Option<u64>, IndexerError> {
        let row = sqlx::query("SELECT block_number FROM cursors WHERE cursor_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await
            .map_err(storage_err)?;
        Ok(row.map(|r| r.get::<i64, _>("block_number") as u64))
    }

    async fn set_cursor(&self, key: &str, block_number: u64) -> Result<(), IndexerError> {
        sqlx::query(
            "INSERT INTO cursors (cursor_key, block_number, updated_at)
             VALUES (?, ?, ?)
             ON CONFLICT (cursor_key) DO UPDATE SET
                block_number = excluded.block_number,
                updated_at   = excluded.updated_at",
        )
        .bind(key)
        .bind(block_number as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        debug!(key, block = block_number, "cursor saved");
        Ok(())
    }

    async fn seed_cursor(&self, key: &str, block_number: u64) -> Result<bool, IndexerError> {
        let done = sqlx::query(
            "INSERT INTO cursors (cursor_key, block_number, updated_at) VALUES (?, ?, ?)
             ON CONFLICT (cursor_key) DO NOTHING",
        )
        .bind(key)
        .bind(block_number as i64)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(done.rows_affected() > 0)
    }
}

#[async_trait]
impl EventStore for SqliteStorage {
    async fn insert_tx_if_absent(&self, record: &TxRecord) -> Result<bool, IndexerError> {
        let args = serde_json::to_string(&record.args).map_err(storage_err)?;
        let done = sqlx::query(
            "INSERT INTO txs (chain_id, block_number, block_hash, tx_hash, log_index, contract,
                              event, args_json, from_addr, to_addr, status, block_time_ms)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(record.chain_id as i64)
        .bind(record.block_number.map(|n| n as i64))
        .bind(&record.block_hash)
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(&record.contract)
        .bind(&record.event)
        .bind(&args)
        .bind(&record.from)
        .bind(&record.to)
        .bind(record.status.as_str())
        .bind(record.block_time.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn insert_event_if_absent(&self, record: &EventRecord) -> Result<bool, IndexerError> {
        let args = serde_json::to_string(&record.args).map_err(storage_err)?;
        let done = sqlx::query(
            "INSERT INTO events (chain_id, block_number, tx_hash, log_index, contract, name,
                                 args_json, ts_ms, day_key)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (tx_hash, log_index) DO NOTHING",
        )
        .bind(record.chain_id as i64)
        .bind(record.block_number.map(|n| n as i64))
        .bind(&record.tx_hash)
        .bind(record.log_index)
        .bind(&record.contract)
        .bind(&record.name)
        .bind(&args)
        .bind(record.ts.timestamp_millis())
        .bind(&record.day_key)
        .execute(&self.pool)
        .await
        .map_err(storage_err)?;
        Ok(done.rows_affected() > 0)
    }

    async fn query_recent(
        &self,
        filter: &EventQuery,
        limit: usize,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        let tail = format!(
            "ORDER BY block_time_ms DESC, block_number DESC, log_index DESC LIMIT {}",
            limit.min(i64::MAX as usize)
        );
        self.select_txs(filter, None, &tail).await
    }

    async fn query_range(
        &self,
        filter: &EventQuery,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<TxRecord>, IndexerError> {
        self.select_txs(
            filter,
            Some((from, to)),
            "ORDER BY block_time_ms ASC, block_number ASC, log_index ASC",
        )
        .await
    }

    async fn events_by_day(&self, day_key: &str) -> Result<Vec<EventRecord>, IndexerError> {
        let rows = sqlx::query(
            "SELECT chain_id, block_number, tx_hash, log_index, contract, name, args_json, ts_ms, day_key
             FROM events WHERE day_key = ? ORDER BY block_number, log_index",
        )
        .bind(day_key)
        .fetch_all(&self.pool)
        .await
        .map_err(storage_err)?;
        rows.iter().map(event_from_row).collect()
    }
}
