//! SQLite persistence for harvested records.
//!
//! [`Store`] owns the pool; all reads and writes go through a [`Session`],
//! which holds one pooled connection for as long as the caller needs it
//! (typically one repository pass of the harvest pipeline).

use std::path::{Path, PathBuf};

use sqlx::pool::PoolConnection;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::Sqlite;
use thiserror::Error;
use tokio::fs;
use tracing::info;

mod reconcile;
mod records;
mod repositories;
mod schema;
mod values;

pub use reconcile::{FieldChange, FieldReport};
pub use records::{
    RejectReason, RepositoryContext, StaleRecord, StoredRecord, WriteOutcome, WriteReport,
};
pub use repositories::{Repository, StoredRepository};
pub use schema::DB_VERSION;

pub const CRATE_NAME: &str = "harvest-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Database(#[from] sqlx::Error),
    #[error("creating database directory {path}: {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("stored record id {0:?} is not a UUID")]
    MalformedRecordId(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if needed) the database file and bring its schema up to date.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .await
                .map_err(|source| StoreError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;

        let store = Self { pool };
        let mut session = store.session().await?;
        schema::initialize(&mut session).await?;
        info!(path = %path.display(), dbversion = DB_VERSION, "opened harvest store");
        Ok(store)
    }

    pub async fn session(&self) -> Result<Session> {
        Ok(Session {
            conn: self.pool.acquire().await?,
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}

/// One pooled connection. Statements autocommit individually except where noted.
pub struct Session {
    conn: PoolConnection<Sqlite>,
}

pub(crate) fn now_timestamp() -> i64 {
    chrono::Utc::now().timestamp()
}
