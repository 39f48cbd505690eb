//! Per-filename reader/writer locks
//!
//! UPLOAD's store step and DELETE take the write side, DOWNLOAD the read side.
//! Entries exist only while some session holds or waits on them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

type LockTable = DashMap<String, Arc<RwLock<()>>>;

/// Lock table keyed by sanitized filename
#[derive(Default, Clone)]
pub struct FileLocks {
    table: Arc<LockTable>,
}

enum Held {
    Read(OwnedRwLockReadGuard<()>),
    Write(OwnedRwLockWriteGuard<()>),
}

/// Held lock on one filename. Dropping it unlocks and prunes the entry.
pub struct FileGuard {
    held: Option<Held>,
    key: String,
    table: Arc<LockTable>,
}

impl FileLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared access to `filename`
    pub async fn read(&self, filename: &str) -> FileGuard {
        let guard = self.entry(filename).read_owned().await;
        self.guard(filename, Held::Read(guard))
    }

    /// Exclusive access to `filename`
    pub async fn write(&self, filename: &str) -> FileGuard {
        let guard = self.entry(filename).write_owned().await;
        self.guard(filename, Held::Write(guard))
    }

    /// Filenames currently locked or awaited
    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn entry(&self, filename: &str) -> Arc<RwLock<()>> {
        Arc::clone(self.table.entry(filename.to_string()).or_default().value())
    }

    fn guard(&self, filename: &str, held: Held) -> FileGuard {
        FileGuard {
            held: Some(held),
            key: filename.to_string(),
            table: Arc::clone(&self.table),
        }
    }
}

impl FileGuard {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.held, Some(Held::Write(_)))
    }
}

impl Drop for FileGuard {
    fn drop(&mut self) {
        // Unlock first so our own reference no longer counts
        self.held.take();
        self.table
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_readers_share() {
        let locks = FileLocks::new();
        let first = locks.read("a.txt").await;
        let second = tokio::time::timeout(Duration::from_millis(100), locks.read("a.txt"))
            .await
            .expect("second reader should not wait");

        assert!(!first.is_exclusive());
        drop(first);
        drop(second);
        assert!(locks.is_empty());
    }

    #[tokio::test]
    async fn test_writer_excludes_readers() {
        let locks = FileLocks::new();
        let writer = locks.write("a.txt").await;
        assert!(writer.is_exclusive());

        let blocked = tokio::time::timeout(Duration::from_millis(50), locks.read("a.txt")).await;
        assert!(blocked.is_err());

        // Other names are unaffected
        let other = tokio::time::timeout(Duration::from_millis(50), locks.write("b.txt")).await;
        assert!(other.is_ok());

        drop(writer);
        let reader = tokio::time::timeout(Duration::from_millis(100), locks.read("a.txt")).await;
        assert!(reader.is_ok());
    }

    #[tokio::test]
    async fn test_entry_kept_while_waited_on() {
        let locks = FileLocks::new();
        let writer = locks.write("a.txt").await;

        let waiting = {
            let locks = locks.clone();
            tokio::spawn(async move {
                let _guard = locks.write("a.txt").await;
            })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        drop(writer);
        assert_eq!(locks.len(), 1);

        waiting.await.unwrap();
        assert!(locks.is_empty());
    }
}
