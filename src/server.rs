//! Connection acceptor
//!
//! Accepts TCP connections and hands each one to the worker pool as a
//! session job. Submission waits when the pool is saturated, so a flood of
//! connections slows the accept loop down instead of being dropped.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::net::TcpListener;
use tokio::sync::watch;

use crate::error::{Result, ServerError};
use crate::session;
use crate::state::ServerState;
use crate::worker::{WorkerPool, WorkerPoolConfig};

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Count of sessions currently alive
#[derive(Debug, Clone, Default)]
pub struct ActiveConnections(Arc<AtomicUsize>);

impl ActiveConnections {
    pub fn count(&self) -> usize {
        self.0.load(Ordering::SeqCst)
    }

    fn track(&self) -> ConnectionGuard {
        self.0.fetch_add(1, Ordering::SeqCst);
        ConnectionGuard(Arc::clone(&self.0))
    }
}

/// Decrements the active count when the session it belongs to ends
struct ConnectionGuard(Arc<AtomicUsize>);

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A bound, not yet running server
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    state: ServerState,
    active: ActiveConnections,
}

impl Server {
    /// Bind the configured address. Failure here is fatal for the process.
    pub async fn bind(state: ServerState) -> Result<Self> {
        let addr = state.config().bind_addr();

        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener.local_addr()?;

        Ok(Self {
            listener,
            local_addr,
            state,
            active: ActiveConnections::default(),
        })
    }

    /// Address actually bound (useful with port 0)
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for observing the active-connection count
    pub fn active_connections(&self) -> ActiveConnections {
        self.active.clone()
    }

    /// Accept connections until `shutdown` completes, then drain sessions.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            local_addr,
            state,
            active,
        } = self;
        let config = state.config().clone();

        let mut workers = WorkerPool::new(WorkerPoolConfig {
            core_size: config.workers.core_size,
            max_size: config.workers.max_size,
            queue_capacity: config.workers.queue_capacity,
            keep_alive: config.worker_keep_alive(),
        });
        let (stop_sessions, session_signal) = watch::channel(false);

        tracing::info!(addr = %local_addr, "File sharing server listening");

        tokio::pin!(shutdown);

        loop {
            let (stream, peer) = tokio::select! {
                biased;

                _ = &mut shutdown => break,

                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("Accept failed: {}", e);
                        tokio::time::sleep(ACCEPT_BACKOFF).await;
                        continue;
                    }
                },
            };

            let guard = active.track();
            tracing::debug!(peer = %peer, active = active.count(), "Accepted connection");

            let state = state.clone();
            let signal = session_signal.clone();
            let job = async move {
                let _guard = guard;
                session::handle_connection(stream, state, signal).await;
            }
            .boxed();

            // Submission can wait on a saturated pool; stay responsive to shutdown
            tokio::select! {
                biased;

                _ = &mut shutdown => break,

                submitted = workers.submit(job) => {
                    if let Err(e) = submitted {
                        tracing::error!("Failed to dispatch connection: {}", e);
                        break;
                    }
                }
            }
        }

        drop(listener);
        tracing::info!(active = active.count(), "Stopped accepting connections");

        // Only fails when no session is listening, which is fine
        let _ = stop_sessions.send(true);
        workers.shutdown(config.shutdown_timeout()).await;

        tracing::info!(active = active.count(), "Server stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::db::SqliteManager;
    use crate::pool::Pool;
    use tempfile::TempDir;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    fn test_state(dir: &TempDir, port: u16) -> ServerState {
        let url = format!("sqlite://{}", dir.path().join("server.db").display());
        let mut config = Config::default();
        config.server.host = "127.0.0.1".to_string();
        config.server.port = port;
        config.server.shutdown_timeout_secs = 2;
        config.workers.core_size = 2;
        config.workers.max_size = 4;

        let pool = Pool::new(SqliteManager::new(&url).unwrap(), config.pool_config());
        ServerState::new(config, pool)
    }

    #[tokio::test]
    async fn test_bind_conflict_is_fatal() {
        let dir = TempDir::new().unwrap();
        let first = Server::bind(test_state(&dir, 0)).await.unwrap();
        let taken = first.local_addr().port();

        let second = Server::bind(test_state(&dir, taken)).await;
        assert!(matches!(second, Err(ServerError::Bind { .. })));
    }

    #[tokio::test]
    async fn test_active_count_and_shutdown() {
        let dir = TempDir::new().unwrap();
        let server = Server::bind(test_state(&dir, 0)).await.unwrap();
        let addr = server.local_addr();
        let active = server.active_connections();

        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);

        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("Welcome to the file sharing server"));
        assert_eq!(active.count(), 1);

        writer.write_all(b"CLIENT_ID alice\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("Welcome alice!"));

        stop.send(()).unwrap();

        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "Server shutting down\n");

        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(active.count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_deadline_cleans_up_stuck_session() {
        let dir = TempDir::new().unwrap();
        let state = test_state(&dir, 0);
        let server = Server::bind(state.clone()).await.unwrap();
        let addr = server.local_addr();

        let (stop, stopped) = oneshot::channel::<()>();
        let running = tokio::spawn(server.run(async {
            let _ = stopped.await;
        }));

        let stream = TcpStream::connect(addr).await.unwrap();
        let (reader, mut writer) = stream.into_split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        reader.read_line(&mut line).await.unwrap();

        writer.write_all(b"CLIENT_ID alice\nUPLOAD a.txt\n").await.unwrap();
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert!(line.starts_with("Welcome alice!"));
        line.clear();
        reader.read_line(&mut line).await.unwrap();
        assert_eq!(line, "READY\n");

        // Half a frame header, then nothing: the session never sees the shutdown signal
        writer.write_all(&100i64.to_be_bytes()).await.unwrap();
        assert!(state.registry().is_registered("alice"));

        stop.send(()).unwrap();
        tokio::time::timeout(Duration::from_secs(5), running)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert!(!state.registry().is_registered("alice"));

        // EOF or reset both mean the server let go of the socket
        let mut rest = Vec::new();
        let closed = tokio::time::timeout(Duration::from_secs(2), reader.read_to_end(&mut rest)).await;
        assert!(closed.is_ok(), "socket should close once the session is aborted");
        assert!(rest.is_empty());
    }
}
