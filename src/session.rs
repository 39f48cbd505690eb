//! Client Session
//!
//! One session per connection, moving forward through
//! `Connected → Identified → CommandLoop → Closed`:
//! - handshake (`CLIENT_ID <name> [UTILITY]`) and registry membership
//! - a sequential command loop over the shared text/binary stream
//! - cleanup on every exit path
//!
//! Everything written to the client goes through one writer task. A response
//! queued as a single [`Outbound`] reaches the wire unbroken, so notifications
//! from other sessions can only land between responses.

use std::time::Duration;

use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::Instrument;
use uuid::Uuid;

use crate::broadcast::PeerSender;
use crate::db::{FileAction, FileRepository, StoreError, StoredFile};
use crate::error::{ProtocolError, SessionError};
use crate::protocol::{
    multi_line, parse_log_count, ClientIdentity, Command, Outbound, COMMAND_SUMMARY, GOODBYE,
    MAX_LINE_LENGTH, SHUTTING_DOWN, TRANSFER_MARKER, UPLOAD_READY, WELCOME,
};
use crate::state::ServerState;
use crate::transfer::{
    compute_checksum, encode_frame, encode_not_found, receive_file, validate_filename, TransferError,
    TransferLimits,
};

/// How long the writer gets to drain once the session is over
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Session lifecycle. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SessionState {
    Connected,
    Identified,
    CommandLoop,
    Closed,
}

enum Flow {
    Continue,
    Close,
}

enum Input {
    Line(String),
    Eof,
    Shutdown,
}

// ============================================================================
// Entry points
// ============================================================================

/// Run a session on an accepted TCP connection
pub async fn handle_connection(stream: TcpStream, state: ServerState, shutdown: watch::Receiver<bool>) {
    let peer = stream
        .peer_addr()
        .map(|addr| addr.to_string())
        .unwrap_or_else(|_| "unknown".to_string());

    if let Err(e) = stream.set_nodelay(true) {
        tracing::debug!("Failed to set TCP_NODELAY for {}: {}", peer, e);
    }

    let (reader, writer) = stream.into_split();
    serve(reader, writer, peer, state, shutdown).await;
}

/// Run a session over any byte stream pair until it closes
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    peer: String,
    state: ServerState,
    shutdown: watch::Receiver<bool>,
) where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let span = tracing::info_span!("session", id = %Uuid::new_v4(), peer = %peer);

    async move {
        tracing::info!("Connection accepted");

        let (outbound, queue) = mpsc::channel(state.config().transfer.outbound_queue);
        let mut writer_task = WriterTask(tokio::spawn(write_outbound(writer, queue).in_current_span()));

        let mut session = Session::new(reader, outbound, state, shutdown);
        session.run().await;
        session.close();

        match tokio::time::timeout(FLUSH_TIMEOUT, &mut writer_task.0).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => tracing::debug!("Outbound writer stopped: {}", e),
            Ok(Err(e)) => tracing::warn!("Outbound writer task failed: {}", e),
            Err(_) => tracing::warn!("Outbound writer did not drain within {:?}", FLUSH_TIMEOUT),
        }

        tracing::info!("Session closed");
    }
    .instrument(span)
    .await
}

/// Aborts the writer when dropped. A session future dropped mid-command
/// (worker pool abort at shutdown) takes its writer and the socket with it.
struct WriterTask(JoinHandle<std::io::Result<()>>);

impl Drop for WriterTask {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Registry membership of one interactive session. Dropping it unregisters
/// the client and announces the departure, on every exit path.
struct Registration {
    server: ServerState,
    name: String,
    sender: PeerSender,
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.server.registry().unregister(&self.name, &self.sender);
    }
}

/// Single writer for one client. Ends once every sender is gone.
async fn write_outbound<W>(mut writer: W, mut queue: mpsc::Receiver<Outbound>) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(message) = queue.recv().await {
        writer.write_all(&message.into_bytes()).await?;
        writer.flush().await?;
    }
    writer.shutdown().await
}

// ============================================================================
// Session
// ============================================================================

struct Session<R> {
    state: SessionState,
    identity: Option<ClientIdentity>,
    registration: Option<Registration>,
    // Dropped before `reader`: the writer stops first, then the read half goes
    outbound: mpsc::Sender<Outbound>,
    reader: BufReader<R>,
    server: ServerState,
    shutdown: watch::Receiver<bool>,
    read_timeout: Duration,
    limits: TransferLimits,
}

impl<R> Session<R>
where
    R: AsyncRead + Unpin + Send,
{
    fn new(
        reader: R,
        outbound: mpsc::Sender<Outbound>,
        server: ServerState,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let read_timeout = server.config().read_timeout();
        let limits = server.config().transfer_limits();

        Self {
            state: SessionState::Connected,
            identity: None,
            registration: None,
            outbound,
            reader: BufReader::with_capacity(limits.buffer_size, reader),
            server,
            shutdown,
            read_timeout,
            limits,
        }
    }

    async fn run(&mut self) {
        let result = match self.handshake().await {
            Ok(Flow::Continue) => self.command_loop().await,
            Ok(Flow::Close) => Ok(()),
            Err(e) => Err(e),
        };

        if let Err(e) = result {
            self.report_failure(e).await;
        }
    }

    async fn handshake(&mut self) -> Result<Flow, SessionError> {
        self.send(Outbound::line(WELCOME)).await?;

        let line = match self.next_line().await? {
            Input::Line(line) => line,
            Input::Eof => return Ok(Flow::Close),
            Input::Shutdown => {
                self.send(Outbound::line(SHUTTING_DOWN)).await?;
                return Ok(Flow::Close);
            }
        };

        let identity = ClientIdentity::parse_handshake(&line)?;

        if identity.is_interactive() {
            self.server
                .registry()
                .register(&identity.name, self.outbound.clone())
                .map_err(ProtocolError::from)?;
            self.registration = Some(Registration {
                server: self.server.clone(),
                name: identity.name.clone(),
                sender: self.outbound.clone(),
            });
        }

        tracing::info!(client = %identity.name, kind = ?identity.kind, "Client identified");

        let welcome = format!("Welcome {}! {}", identity.name, COMMAND_SUMMARY);
        self.identity = Some(identity);
        self.advance(SessionState::Identified);
        self.send(Outbound::line(welcome)).await?;

        Ok(Flow::Continue)
    }

    async fn command_loop(&mut self) -> Result<(), SessionError> {
        self.advance(SessionState::CommandLoop);

        loop {
            let line = match self.next_line().await? {
                Input::Line(line) => line,
                Input::Eof => {
                    tracing::debug!("Client disconnected");
                    return Ok(());
                }
                Input::Shutdown => {
                    self.send(Outbound::line(SHUTTING_DOWN)).await?;
                    return Ok(());
                }
            };

            let Some(command) = Command::parse(&line) else {
                continue;
            };

            match self.dispatch(command).await {
                Ok(Flow::Continue) => {}
                Ok(Flow::Close) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    tracing::warn!(client = %self.client_name(), "Command failed: {}", e);
                    self.send(Outbound::line(e.client_message())).await?;
                }
            }
        }
    }

    async fn dispatch(&mut self, command: Command) -> Result<Flow, SessionError> {
        tracing::debug!(client = %self.client_name(), command = ?command, "Dispatching");

        match command {
            Command::Upload(name) => self.upload(&name).await?,
            Command::Download(name) => self.download(&name).await?,
            Command::Delete(name) => self.delete(&name).await?,
            Command::List => self.list().await?,
            Command::Logs(count) => self.logs(count.as_deref()).await?,
            Command::Help => self.send(Outbound::line(COMMAND_SUMMARY)).await?,
            Command::Quit => {
                self.send(Outbound::line(GOODBYE)).await?;
                return Ok(Flow::Close);
            }
            Command::Unknown(verb) => {
                self.send(Outbound::line(format!("ERROR: Unknown command: {}", verb)))
                    .await?
            }
        }

        Ok(Flow::Continue)
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn upload(&mut self, raw: &str) -> Result<(), SessionError> {
        let filename = validate_filename(raw)?;
        let client = self.client_name();

        self.send(Outbound::line(UPLOAD_READY)).await?;
        let file = receive_file(&mut self.reader, &self.limits).await?;
        let checksum = file.checksum_hex();

        // The payload is already verified; only the store step is exclusive
        {
            let _guard = self.server.locks().write(&filename).await;
            let mut conn = self.server.pool().acquire_with_retry().await?;
            let stored = store_upload(&mut conn, &client, &filename, &file.content, &checksum).await;
            conn.release().await;
            stored?;
        }

        tracing::info!(client = %client, file = %filename, size = file.size(), "File uploaded");

        self.send(Outbound::line(format!(
            "Upload successful: {} ({} bytes, sha256 {})",
            filename,
            file.size(),
            checksum
        )))
        .await?;

        if self.is_interactive() {
            self.server.registry().notify_upload(&client, &filename, file.size());
        }
        Ok(())
    }

    /// Marker, frame and status go out as one message. A rejected request
    /// still gets the marker followed by the size sentinel.
    async fn download(&mut self, raw: &str) -> Result<(), SessionError> {
        let client = self.client_name();
        let mut response = format!("{}\n", TRANSFER_MARKER).into_bytes();

        match self.fetch_for_download(&client, raw).await {
            Ok(file) => {
                let digest = compute_checksum(&file.content);
                response.extend_from_slice(&encode_frame(&file.content, &digest));
                response.extend_from_slice(
                    format!("Download successful: {} ({} bytes)\n", file.filename, file.content.len())
                        .as_bytes(),
                );
                self.send(Outbound::Data(response)).await?;

                tracing::info!(client = %client, file = %file.filename, size = file.size, "File downloaded");

                if self.is_interactive() {
                    self.server.registry().notify_download(&client, &file.filename);
                }
            }
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                tracing::debug!(client = %client, "Download rejected: {}", e);
                response.extend_from_slice(&encode_not_found());
                response.extend_from_slice(format!("{}\n", e.client_message()).as_bytes());
                self.send(Outbound::Data(response)).await?;
            }
        }
        Ok(())
    }

    async fn fetch_for_download(&self, client: &str, raw: &str) -> Result<StoredFile, SessionError> {
        let filename = validate_filename(raw)?;

        let _guard = self.server.locks().read(&filename).await;
        let mut conn = self.server.pool().acquire_with_retry().await?;
        let fetched = fetch_verified(&mut conn, client, &filename).await;
        conn.release().await;
        fetched
    }

    async fn delete(&mut self, raw: &str) -> Result<(), SessionError> {
        let filename = validate_filename(raw)?;
        let client = self.client_name();

        let deleted = {
            let _guard = self.server.locks().write(&filename).await;
            let mut conn = self.server.pool().acquire_with_retry().await?;
            let result = delete_logged(&mut conn, &client, &filename).await;
            conn.release().await;
            result?
        };

        if !deleted {
            return Err(SessionError::NotFound(filename));
        }

        tracing::info!(client = %client, file = %filename, "File deleted");
        self.send(Outbound::line(format!("File deleted: {}", filename))).await?;

        if self.is_interactive() {
            self.server.registry().notify_delete(&client, &filename);
        }
        Ok(())
    }

    async fn list(&mut self) -> Result<(), SessionError> {
        let mut conn = self.server.pool().acquire_with_retry().await?;
        let files = FileRepository::new(&mut conn).list().await;
        conn.release().await;

        let lines = files?
            .into_iter()
            .map(|file| format!("{} ({} bytes)", file.filename, file.size));

        self.send(Outbound::line(multi_line("Available files:", lines, "No files available.")))
            .await
    }

    async fn logs(&mut self, argument: Option<&str>) -> Result<(), SessionError> {
        let count = parse_log_count(argument)?;

        let mut conn = self.server.pool().acquire_with_retry().await?;
        let records = FileRepository::new(&mut conn).recent_logs(count).await;
        conn.release().await;

        let lines = records?.into_iter().map(|record| {
            format!(
                "[{}] {} {} {}",
                record.timestamp, record.client, record.action, record.filename
            )
        });

        let header = format!("Recent activity (last {}):", count);
        self.send(Outbound::line(multi_line(&header, lines, "No activity recorded.")))
            .await
    }

    // ========================================================================
    // Plumbing
    // ========================================================================

    /// Read one control line, bounded by the read timeout and the length cap
    async fn next_line(&mut self) -> Result<Input, SessionError> {
        if *self.shutdown.borrow() {
            return Ok(Input::Shutdown);
        }

        let timeout = self.read_timeout;
        let mut buf = Vec::new();

        let outcome = {
            let mut limited = (&mut self.reader).take(MAX_LINE_LENGTH);
            let read = limited.read_until(b'\n', &mut buf);
            tokio::select! {
                result = tokio::time::timeout(timeout, read) => Some(result),
                _ = wait_for_shutdown(&mut self.shutdown) => None,
            }
        };

        let n = match outcome {
            None => return Ok(Input::Shutdown),
            Some(result) => result.map_err(|_| SessionError::Timeout(timeout))??,
        };

        if n == 0 {
            return Ok(Input::Eof);
        }
        if buf.last() != Some(&b'\n') && n as u64 >= MAX_LINE_LENGTH {
            return Err(ProtocolError::LineTooLong(MAX_LINE_LENGTH).into());
        }

        let line = String::from_utf8_lossy(&buf);
        Ok(Input::Line(line.trim_end_matches(|c| c == '\r' || c == '\n').to_string()))
    }

    async fn send(&self, message: Outbound) -> Result<(), SessionError> {
        match tokio::time::timeout(self.limits.io_timeout, self.outbound.send(message)).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(SessionError::Disconnected),
            Err(_) => Err(SessionError::Timeout(self.limits.io_timeout)),
        }
    }

    async fn report_failure(&self, err: SessionError) {
        match &err {
            SessionError::Connection(e) => tracing::debug!("Connection lost: {}", e),
            SessionError::Disconnected => tracing::debug!("Client stopped receiving"),
            other => {
                tracing::warn!(client = %self.client_name(), "Closing session: {}", other);
                // Best effort; the stream may already be gone
                let _ = self.send(Outbound::line(other.client_message())).await;
            }
        }
    }

    fn advance(&mut self, next: SessionState) {
        debug_assert!(next > self.state, "session state moved backwards");
        tracing::debug!(from = ?self.state, to = ?next, "Session state change");
        self.state = next;
    }

    fn client_name(&self) -> String {
        self.identity
            .as_ref()
            .map(|identity| identity.name.clone())
            .unwrap_or_default()
    }

    fn is_interactive(&self) -> bool {
        self.identity
            .as_ref()
            .map_or(false, ClientIdentity::is_interactive)
    }

    /// Leave the registry and release I/O. Consuming `self` makes it run once;
    /// a session dropped without reaching here is cleaned up by the guards.
    fn close(mut self) {
        self.advance(SessionState::Closed);
        drop(self.registration.take());
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    // A dropped sender means nobody can ask for shutdown any more
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

// ============================================================================
// Backend operations
// ============================================================================

async fn store_upload(
    conn: &mut SqliteConnection,
    client: &str,
    filename: &str,
    content: &[u8],
    checksum: &str,
) -> Result<(), StoreError> {
    let mut tx = conn.begin().await?;
    {
        let mut repo = FileRepository::new(&mut tx);
        repo.store(filename, content, checksum).await?;
        repo.append_log(client, FileAction::Upload, filename, Utc::now()).await?;
    }
    tx.commit().await?;
    Ok(())
}

async fn fetch_verified(
    conn: &mut SqliteConnection,
    client: &str,
    filename: &str,
) -> Result<StoredFile, SessionError> {
    let mut repo = FileRepository::new(conn);

    let file = repo
        .fetch(filename)
        .await?
        .ok_or_else(|| SessionError::NotFound(filename.to_string()))?;

    let actual = hex::encode(compute_checksum(&file.content));
    if actual != file.checksum {
        tracing::error!(file = %filename, "Stored content does not match its checksum");
        return Err(TransferError::Integrity {
            expected: file.checksum,
            actual,
        }
        .into());
    }

    repo.append_log(client, FileAction::Download, filename, Utc::now()).await?;
    Ok(file)
}

async fn delete_logged(conn: &mut SqliteConnection, client: &str, filename: &str) -> Result<bool, StoreError> {
    let mut tx = conn.begin().await?;
    let deleted = {
        let mut repo = FileRepository::new(&mut tx);
        let deleted = repo.delete(filename).await?;
        if deleted {
            repo.append_log(client, FileAction::Delete, filename, Utc::now()).await?;
        }
        deleted
    };
    tx.commit().await?;
    Ok(deleted)
}
