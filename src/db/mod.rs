//! Database module for SQLite persistence
//!
//! Stores file blobs and the activity log. Each pooled backend handle is one
//! `SqliteConnection`; see [`SqliteManager`].

mod files;
mod schema;

pub use files::*;
pub use schema::*;

use std::str::FromStr;
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Connection, SqliteConnection};

use crate::pool::ConnectionManager;

/// Storage backend errors
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// Opens, probes and closes SQLite connections for the backend pool
pub struct SqliteManager {
    options: SqliteConnectOptions,
}

impl SqliteManager {
    /// Build a manager from a connection string such as `sqlite:./fileshare.db`
    pub fn new(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5));

        Ok(Self { options })
    }
}

#[async_trait::async_trait]
impl ConnectionManager for SqliteManager {
    type Connection = SqliteConnection;

    async fn connect(&self) -> Result<SqliteConnection, StoreError> {
        Ok(SqliteConnection::connect_with(&self.options).await?)
    }

    async fn initialize(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        initialize_schema(conn).await
    }

    async fn is_valid(&self, conn: &mut SqliteConnection) -> bool {
        conn.ping().await.is_ok()
    }

    async fn close(&self, conn: SqliteConnection) {
        if let Err(e) = conn.close().await {
            tracing::debug!("Error closing database connection: {}", e);
        }
    }
}
