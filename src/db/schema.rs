//! Database schema initialization

use sqlx::SqliteConnection;

use super::StoreError;

/// Initialize the database schema. Safe to run against an existing database.
pub async fn initialize_schema(conn: &mut SqliteConnection) -> Result<(), StoreError> {
    sqlx::query(SCHEMA_SQL).execute(&mut *conn).await?;

    tracing::info!("Database schema ready");
    Ok(())
}

const SCHEMA_SQL: &str = r#"
-- Stored files, keyed by sanitized name (last writer wins)
CREATE TABLE IF NOT EXISTS files (
    filename TEXT PRIMARY KEY,
    content BLOB NOT NULL,
    size INTEGER NOT NULL,
    checksum TEXT NOT NULL,
    upload_time TEXT NOT NULL
);

-- Append-only activity log
CREATE TABLE IF NOT EXISTS activity_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    client TEXT NOT NULL,
    action TEXT NOT NULL,
    filename TEXT NOT NULL,
    timestamp TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_activity_log_client ON activity_log(client);
"#;
