//! File and activity log database operations

use std::fmt;

use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

use super::StoreError;

/// A stored file, content included
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct StoredFile {
    pub filename: String,
    pub content: Vec<u8>,
    pub size: i64,
    pub checksum: String,
    pub upload_time: String,
}

/// Name and size, as shown by LIST
#[derive(Debug, Clone, PartialEq, Eq, sqlx::FromRow)]
pub struct FileSummary {
    pub filename: String,
    pub size: i64,
}

/// Activity log row
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct LogRecord {
    pub id: i64,
    pub client: String,
    pub action: String,
    pub filename: String,
    pub timestamp: String,
}

/// Logged file operations
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileAction {
    Upload,
    Download,
    Delete,
}

impl FileAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Upload => "UPLOAD",
            Self::Download => "DOWNLOAD",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for FileAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// File repository over a single backend connection
pub struct FileRepository<'a> {
    conn: &'a mut SqliteConnection,
}

impl<'a> FileRepository<'a> {
    pub fn new(conn: &'a mut SqliteConnection) -> Self {
        Self { conn }
    }

    /// Insert or overwrite a file
    pub async fn store(&mut self, filename: &str, content: &[u8], checksum: &str) -> Result<(), StoreError> {
        let now = Utc::now().to_rfc3339();

        sqlx::query(
            r#"
            INSERT INTO files (filename, content, size, checksum, upload_time)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(filename) DO UPDATE SET
                content = excluded.content,
                size = excluded.size,
                checksum = excluded.checksum,
                upload_time = excluded.upload_time
            "#,
        )
        .bind(filename)
        .bind(content)
        .bind(content.len() as i64)
        .bind(checksum)
        .bind(&now)
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Fetch a file by name
    pub async fn fetch(&mut self, filename: &str) -> Result<Option<StoredFile>, StoreError> {
        let file = sqlx::query_as::<_, StoredFile>(
            r#"
            SELECT filename, content, size, checksum, upload_time
            FROM files
            WHERE filename = ?
            "#,
        )
        .bind(filename)
        .fetch_optional(&mut *self.conn)
        .await?;

        Ok(file)
    }

    /// Delete a file. Returns whether it existed.
    pub async fn delete(&mut self, filename: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM files WHERE filename = ?")
            .bind(filename)
            .execute(&mut *self.conn)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    /// All files, ordered by name
    pub async fn list(&mut self) -> Result<Vec<FileSummary>, StoreError> {
        let files = sqlx::query_as::<_, FileSummary>(
            "SELECT filename, size FROM files ORDER BY filename",
        )
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(files)
    }

    /// Append an activity log row
    pub async fn append_log(
        &mut self,
        client: &str,
        action: FileAction,
        filename: &str,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO activity_log (client, action, filename, timestamp)
            VALUES (?, ?, ?, ?)
            "#,
        )
        .bind(client)
        .bind(action.as_str())
        .bind(filename)
        .bind(timestamp.to_rfc3339())
        .execute(&mut *self.conn)
        .await?;

        Ok(())
    }

    /// Most recent log rows first
    pub async fn recent_logs(&mut self, limit: i64) -> Result<Vec<LogRecord>, StoreError> {
        let records = sqlx::query_as::<_, LogRecord>(
            r#"
            SELECT id, client, action, filename, timestamp
            FROM activity_log
            ORDER BY id DESC
            LIMIT ?
            "#,
        )
        .bind(limit)
        .fetch_all(&mut *self.conn)
        .await?;

        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::{initialize_schema, SqliteManager};
    use crate::pool::ConnectionManager;
    use tempfile::TempDir;

    async fn open_db(dir: &TempDir) -> SqliteConnection {
        let url = format!("sqlite://{}", dir.path().join("test.db").display());
        let manager = SqliteManager::new(&url).unwrap();
        let mut conn = manager.connect().await.unwrap();
        manager.initialize(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_store_fetch_overwrite() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir).await;
        let mut repo = FileRepository::new(&mut conn);

        repo.store("report.txt", b"first", "aa").await.unwrap();
        repo.store("report.txt", b"second version", "bb").await.unwrap();

        let file = repo.fetch("report.txt").await.unwrap().unwrap();
        assert_eq!(file.content, b"second version");
        assert_eq!(file.size, 14);
        assert_eq!(file.checksum, "bb");

        assert!(repo.fetch("missing.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_and_list() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir).await;
        let mut repo = FileRepository::new(&mut conn);

        assert!(repo.list().await.unwrap().is_empty());

        repo.store("b.txt", b"bb", "x").await.unwrap();
        repo.store("a.txt", b"a", "y").await.unwrap();

        let files = repo.list().await.unwrap();
        assert_eq!(
            files,
            vec![
                FileSummary { filename: "a.txt".into(), size: 1 },
                FileSummary { filename: "b.txt".into(), size: 2 },
            ]
        );

        assert!(repo.delete("a.txt").await.unwrap());
        assert!(!repo.delete("a.txt").await.unwrap());
        assert_eq!(repo.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recent_logs_newest_first() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir).await;
        let mut repo = FileRepository::new(&mut conn);

        let now = Utc::now();
        repo.append_log("alice", FileAction::Upload, "a.txt", now).await.unwrap();
        repo.append_log("bob", FileAction::Download, "a.txt", now).await.unwrap();
        repo.append_log("alice", FileAction::Delete, "a.txt", now).await.unwrap();

        let logs = repo.recent_logs(2).await.unwrap();
        assert_eq!(logs.len(), 2);
        assert_eq!(logs[0].action, "DELETE");
        assert_eq!(logs[1].client, "bob");
    }

    #[tokio::test]
    async fn test_schema_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let mut conn = open_db(&dir).await;
        FileRepository::new(&mut conn).store("keep.txt", b"x", "c").await.unwrap();

        initialize_schema(&mut conn).await.unwrap();

        let kept = FileRepository::new(&mut conn).fetch("keep.txt").await.unwrap();
        assert!(kept.is_some());
    }
}
