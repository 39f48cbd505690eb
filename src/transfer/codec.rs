//! Frame encoding and decoding
//!
//! The receiving side never trusts the header: sizes are validated before a
//! single payload byte is buffered, every read is bounded by the transfer
//! timeout, and the payload is hashed while it streams in.

use std::future::Future;
use std::io;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt};

use super::checksum::{checksums_match, StreamingChecksum, CHECKSUM_LEN};
use super::TransferError;
use crate::error::ValidationError;

/// `size` value meaning "not found / rejected" on download
pub const NOT_FOUND_SENTINEL: i64 = -1;

/// Largest accepted checksum field
pub const MAX_CHECKSUM_LEN: i32 = 64;

/// Fixed header: i64 size + i32 checksum length
const HEADER_LEN: usize = 12;

/// Limits applied while receiving a frame
#[derive(Debug, Clone, Copy)]
pub struct TransferLimits {
    /// Largest accepted payload
    pub max_file_size: u64,
    /// Upper bound on a single read
    pub buffer_size: usize,
    /// Deadline for each individual read
    pub io_timeout: Duration,
}

impl Default for TransferLimits {
    fn default() -> Self {
        Self {
            max_file_size: 100 * 1024 * 1024,
            buffer_size: 8192,
            io_timeout: Duration::from_secs(60),
        }
    }
}

/// A payload whose checksum has been verified
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub content: Vec<u8>,
    pub checksum: [u8; CHECKSUM_LEN],
}

impl ReceivedFile {
    pub fn size(&self) -> u64 {
        self.content.len() as u64
    }

    pub fn checksum_hex(&self) -> String {
        hex::encode(self.checksum)
    }
}

/// Encode a complete frame
pub fn encode_frame(content: &[u8], checksum: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + checksum.len() + content.len());
    frame.extend_from_slice(&(content.len() as i64).to_be_bytes());
    frame.extend_from_slice(&(checksum.len() as i32).to_be_bytes());
    frame.extend_from_slice(checksum);
    frame.extend_from_slice(content);
    frame
}

/// Encode the not-found sentinel (size only, no further fields)
pub fn encode_not_found() -> Vec<u8> {
    NOT_FOUND_SENTINEL.to_be_bytes().to_vec()
}

/// Receive an upload frame.
///
/// Returns only after the payload has been read in full and its SHA-256
/// matched the declared checksum.
pub async fn receive_file<R>(
    reader: &mut R,
    limits: &TransferLimits,
) -> Result<ReceivedFile, TransferError>
where
    R: AsyncRead + Unpin,
{
    let size = timed(limits, reader.read_i64()).await?;
    receive_body(reader, size, limits).await
}

/// Receive a download frame. `Ok(None)` is the not-found sentinel.
pub async fn receive_download<R>(
    reader: &mut R,
    limits: &TransferLimits,
) -> Result<Option<ReceivedFile>, TransferError>
where
    R: AsyncRead + Unpin,
{
    let size = timed(limits, reader.read_i64()).await?;
    if size == NOT_FOUND_SENTINEL {
        return Ok(None);
    }
    receive_body(reader, size, limits).await.map(Some)
}

/// Everything after the size field
async fn receive_body<R>(
    reader: &mut R,
    size: i64,
    limits: &TransferLimits,
) -> Result<ReceivedFile, TransferError>
where
    R: AsyncRead + Unpin,
{
    let checksum_len = timed(limits, reader.read_i32()).await?;

    if let Err(e) = validate_header(size, checksum_len, limits.max_file_size) {
        // The remainder can only be skipped when both lengths are plausible
        if (1..=MAX_CHECKSUM_LEN).contains(&checksum_len) && size >= 0 {
            discard(reader, checksum_len as u64 + size as u64, limits).await?;
            return Err(TransferError::Invalid(e));
        }
        return Err(TransferError::Unrecoverable(e));
    }

    let mut declared = vec![0u8; checksum_len as usize];
    timed(limits, reader.read_exact(&mut declared)).await?;

    let (content, checksum) = read_payload(reader, size as usize, limits).await?;

    if !checksums_match(&checksum, &declared) {
        tracing::warn!(
            size = size,
            expected = %hex::encode(&declared),
            actual = %hex::encode(checksum),
            "Discarding payload with mismatched checksum"
        );
        return Err(TransferError::Integrity {
            expected: hex::encode(&declared),
            actual: hex::encode(checksum),
        });
    }

    Ok(ReceivedFile { content, checksum })
}

fn validate_header(size: i64, checksum_len: i32, max_file_size: u64) -> Result<(), ValidationError> {
    if size <= 0 {
        return Err(ValidationError::InvalidSize(size));
    }
    if size as u64 > max_file_size {
        return Err(ValidationError::FileTooLarge {
            size,
            max: max_file_size,
        });
    }
    if checksum_len <= 0 || checksum_len > MAX_CHECKSUM_LEN {
        return Err(ValidationError::InvalidChecksumLength(checksum_len));
    }
    Ok(())
}

async fn read_payload<R>(
    reader: &mut R,
    size: usize,
    limits: &TransferLimits,
) -> Result<(Vec<u8>, [u8; CHECKSUM_LEN]), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut content = Vec::with_capacity(size);
    let mut hasher = StreamingChecksum::new();
    let mut buf = vec![0u8; limits.buffer_size.max(1)];
    let mut remaining = size;

    while remaining > 0 {
        let want = remaining.min(buf.len());
        let n = timed(limits, reader.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(unexpected_eof(size - remaining, size));
        }
        hasher.update(&buf[..n]);
        content.extend_from_slice(&buf[..n]);
        remaining -= n;
    }

    Ok((content, hasher.finalize()))
}

/// Read and drop `len` bytes so the next command line starts where expected
async fn discard<R>(reader: &mut R, len: u64, limits: &TransferLimits) -> Result<(), TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; limits.buffer_size.max(1)];
    let mut remaining = len;

    while remaining > 0 {
        let want = remaining.min(buf.len() as u64) as usize;
        let n = timed(limits, reader.read(&mut buf[..want])).await?;
        if n == 0 {
            return Err(unexpected_eof((len - remaining) as usize, len as usize));
        }
        remaining -= n as u64;
    }

    tracing::debug!(bytes = len, "Discarded rejected frame remainder");
    Ok(())
}

async fn timed<F, T>(limits: &TransferLimits, fut: F) -> Result<T, TransferError>
where
    F: Future<Output = io::Result<T>>,
{
    tokio::time::timeout(limits.io_timeout, fut)
        .await
        .map_err(|_| TransferError::Timeout(limits.io_timeout))?
        .map_err(TransferError::from)
}

fn unexpected_eof(received: usize, expected: usize) -> TransferError {
    TransferError::Io(io::Error::new(
        io::ErrorKind::UnexpectedEof,
        format!("stream ended after {} of {} bytes", received, expected),
    ))
}
