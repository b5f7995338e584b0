//! Storage backend selection from the connection string.

use std::sync::Arc;

use tracing::info;

use kwhindex_core::{CursorStore, EventStore, IndexerError};
use kwhindex_storage::postgres::PostgresStorage;
use kwhindex_storage::sqlite::SqliteStorage;
use kwhindex_storage::{mask_credentials, InMemoryStorage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Memory,
    Sqlite,
    Postgres,
}

impl Backend {
    /// Pick a backend from the URL scheme.
    pub fn detect(url: &str) -> Option<Self> {
        let url = url.trim();
        if url == "memory" || url.starts_with("memory:") {
            Some(Self::Memory)
        } else if url.starts_with("sqlite:") || url.ends_with(".db") || url.ends_with(".sqlite") {
            Some(Self::Sqlite)
        } else if url.starts_with("postgres://") || url.starts_with("postgresql://") {
            Some(Self::Postgres)
        } else {
            None
        }
    }
}

pub enum Storage {
    Memory(Arc<InMemoryStorage>),
    Sqlite(Arc<SqliteStorage>),
    Postgres(Arc<PostgresStorage>),
}

impl Storage {
    /// Connect and prepare the schema. Failure here is fatal for the binary.
    pub async fn open(url: &str) -> Result<Self, IndexerError> {
        let backend = Backend::detect(url).ok_or_else(|| {
            IndexerError::Config(format!("unsupported database URL: {}", mask_credentials(url)))
        })?;
        let storage = match backend {
            Backend::Memory => Self::Memory(Arc::new(InMemoryStorage::new())),
            Backend::Sqlite => Self::Sqlite(Arc::new(SqliteStorage::open(url.trim()).await?)),
            Backend::Postgres => Self::Postgres(Arc::new(PostgresStorage::connect(url.trim()).await?)),
        };
        info!(backend = ?backend, url = %mask_credentials(url), "storage ready");
        Ok(storage)
    }

    pub fn cursors(&self) -> Arc<dyn CursorStore> {
        match self {
            Self::Memory(s) => s.clone() as Arc<dyn CursorStore>,
            Self::Sqlite(s) => s.clone(),
            Self::Postgres(s) => s.clone(),
        }
    }

    pub fn events(&self) -> Arc<dyn EventStore> {
        match self {
            Self::Memory(s) => s.clone() as Arc<dyn EventStore>,
            Self::Sqlite(s) => s.clone(),
            Self::Postgres(s) => s.clone(),
        }
    }

    pub async fn close(&self) {
        match self {
            Self::Memory(_) => {}
            Self::Sqlite(s) => s.close().await,
            Self::Postgres(s) => s.close().await,
        }
    }
}
