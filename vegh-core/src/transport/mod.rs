//! Snapshot upload, single-shot or chunked.
//!
//! Archives below the configured threshold go out as one request. Larger
//! archives (or any archive when chunking is forced) are split into
//! fixed-size chunks that share a session id and are uploaded through a
//! bounded in-flight window. Each chunk carries its own SHA-256 and every
//! request carries the SHA-256 of the whole archive so the receiver can
//! verify reassembly.
//!
//! Requests are retried with exponential backoff; authentication failures
//! are never retried. The whole transfer runs under one timeout and one
//! cancellation token.

pub mod http;

pub use http::HttpSink;

use crate::config::TransferConfig;
use crate::integrity::{compute_hash, sha256_file};
use crate::observability;
use crate::{NetworkError, Result, SnapError};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use vegh_retry::{classify, with_policy, RetryError, RetryPolicy, RetryableError};

/// Lifecycle of one chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkState {
    Pending,
    Sent,
    Acked,
    Retrying,
    Failed,
}

impl ChunkState {
    /// `Pending -> Sent -> {Acked, Retrying -> Sent, Failed}`
    pub fn can_transition_to(self, next: ChunkState) -> bool {
        use ChunkState::*;
        matches!(
            (self, next),
            (Pending, Sent) | (Sent, Acked) | (Sent, Retrying) | (Sent, Failed) | (Retrying, Sent)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, ChunkState::Acked | ChunkState::Failed)
    }
}

/// Byte range of one chunk within the archive
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    pub index: usize,
    pub offset: u64,
    pub len: u64,
}

/// Split `total_len` bytes into `chunk_size` spans; the last one may be short
///
/// An empty archive yields a single empty span so that a session always has
/// at least one request.
pub fn plan_chunks(total_len: u64, chunk_size: u64) -> Result<Vec<ChunkSpan>> {
    if chunk_size == 0 {
        return Err(SnapError::configuration("chunk_size must be greater than zero"));
    }
    if total_len == 0 {
        return Ok(vec![ChunkSpan {
            index: 0,
            offset: 0,
            len: 0,
        }]);
    }

    let count = total_len.div_ceil(chunk_size);
    Ok((0..count)
        .map(|i| {
            let offset = i * chunk_size;
            ChunkSpan {
                index: i as usize,
                offset,
                len: chunk_size.min(total_len - offset),
            }
        })
        .collect())
}

/// Tunables for one transfer
#[derive(Debug, Clone)]
pub struct TransferOptions {
    pub chunk_size: u64,
    pub chunk_threshold: u64,
    /// Chunk even when the archive is below the threshold
    pub force_chunk: bool,
    pub concurrency: usize,
    pub retry: RetryPolicy,
    /// Deadline for the whole transfer
    pub timeout: Duration,
    /// Deadline for each request sent by [`send`]
    pub request_timeout: Duration,
}

impl TransferOptions {
    pub fn from_config(config: &TransferConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            chunk_threshold: config.chunk_threshold,
            force_chunk: false,
            concurrency: config.concurrency,
            retry: config.retry_policy(),
            timeout: config.timeout(),
            request_timeout: config.request_timeout(),
        }
    }

    pub fn with_force_chunk(mut self, force: bool) -> Self {
        self.force_chunk = force;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(SnapError::configuration("chunk_size must be greater than zero"));
        }
        if self.concurrency == 0 {
            return Err(SnapError::configuration("concurrency must be at least 1"));
        }
        Ok(())
    }

    /// Whether an archive of `size` bytes goes out in chunks
    pub fn uses_chunks(&self, size: u64) -> bool {
        self.force_chunk || size >= self.chunk_threshold
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::from_config(&TransferConfig::default())
    }
}

/// Whole-archive facts sent with every request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveInfo {
    pub file_name: String,
    pub size: u64,
    pub sha256: String,
}

/// Per-chunk facts of a chunked request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkInfo {
    pub session_id: Uuid,
    pub index: usize,
    pub total: usize,
    pub offset: u64,
    pub sha256: String,
}

/// One request handed to a [`ChunkSink`]
#[derive(Debug, Clone)]
pub struct UploadRequest {
    pub archive: Arc<ArchiveInfo>,
    /// `None` for a single-shot upload
    pub chunk: Option<ChunkInfo>,
    pub body: Bytes,
}

/// What the receiver answered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SinkResponse {
    pub status: u16,
    pub body: String,
}

/// Destination for upload requests
///
/// Implementations perform one delivery attempt. A response of any status is
/// `Ok`; `Err` is reserved for failures where no response arrived.
#[async_trait]
pub trait ChunkSink: Send + Sync {
    async fn deliver(&self, request: &UploadRequest) -> std::result::Result<SinkResponse, NetworkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    SingleShot,
    Chunked,
}

/// Outcome of a completed transfer
#[derive(Debug, Clone)]
pub struct TransferResult {
    pub mode: TransferMode,
    pub session_id: Option<Uuid>,
    pub archive: ArchiveInfo,
    pub chunk_states: Vec<ChunkState>,
    /// Requests issued, retries included
    pub requests: usize,
    /// Body of the last acknowledgement
    pub response_body: String,
}

impl TransferResult {
    pub fn chunk_count(&self) -> usize {
        self.chunk_states.len()
    }

    pub fn all_acked(&self) -> bool {
        self.chunk_states.iter().all(|s| *s == ChunkState::Acked)
    }
}

/// Why a single attempt failed
#[derive(Error, Debug, Clone, PartialEq, Eq)]
enum AttemptError {
    #[error("credentials rejected with status {status}: {body}")]
    Auth { status: u16, body: String },

    #[error("{0}")]
    Network(NetworkError),
}

impl RetryableError for AttemptError {
    fn is_transient(&self) -> bool {
        matches!(
            self,
            AttemptError::Network(
                NetworkError::Rejected { .. } | NetworkError::Connect(_) | NetworkError::RequestTimeout(_)
            )
        )
    }
}

/// Shared state table for every chunk of a transfer
#[derive(Debug, Clone)]
struct ChunkTracker {
    states: Arc<Mutex<Vec<ChunkState>>>,
    requests: Arc<Mutex<usize>>,
}

impl ChunkTracker {
    fn new(count: usize) -> Self {
        Self {
            states: Arc::new(Mutex::new(vec![ChunkState::Pending; count])),
            requests: Arc::new(Mutex::new(0)),
        }
    }

    fn advance(&self, index: usize, next: ChunkState) {
        let Ok(mut states) = self.states.lock() else {
            return;
        };
        if let Some(state) = states.get_mut(index) {
            if state.can_transition_to(next) {
                *state = next;
            } else {
                debug!(chunk = index, from = ?*state, to = ?next, "ignoring invalid chunk transition");
            }
        }
    }

    fn count_request(&self) {
        if let Ok(mut requests) = self.requests.lock() {
            *requests += 1;
        }
    }

    fn snapshot(&self) -> (Vec<ChunkState>, usize) {
        let states = self.states.lock().map(|s| s.clone()).unwrap_or_default();
        let requests = self.requests.lock().map(|r| *r).unwrap_or_default();
        (states, requests)
    }
}

/// Upload the snapshot at `archive_path` to `endpoint` over HTTP
pub async fn send(
    archive_path: &Path,
    endpoint: &str,
    auth_token: Option<&str>,
    options: &TransferOptions,
    cancel: CancellationToken,
) -> Result<TransferResult> {
    let sink = Arc::new(HttpSink::new(endpoint, auth_token, options.request_timeout)?);
    send_with_sink(archive_path, sink, options, cancel).await
}

/// Upload the snapshot at `archive_path` through `sink`
///
/// # Errors
/// * `SnapError::Configuration` - invalid options
/// * `SnapError::Resource` - the archive cannot be read
/// * `SnapError::Auth` - the receiver rejected the credentials
/// * `SnapError::Network` - timeout, cancellation or a chunk that exhausted its retries
pub async fn send_with_sink<S: ChunkSink + 'static>(
    archive_path: &Path,
    sink: Arc<S>,
    options: &TransferOptions,
    cancel: CancellationToken,
) -> Result<TransferResult> {
    options.validate()?;

    let archive = Arc::new(describe_archive(archive_path).await?);
    let chunked = options.uses_chunks(archive.size);
    let spans = if chunked {
        plan_chunks(archive.size, options.chunk_size)?
    } else {
        vec![ChunkSpan {
            index: 0,
            offset: 0,
            len: archive.size,
        }]
    };
    let session_id = chunked.then(Uuid::new_v4);
    let tracker = ChunkTracker::new(spans.len());

    info!(
        archive = %archive.file_name,
        size = archive.size,
        chunked,
        chunks = spans.len(),
        session = ?session_id,
        "starting transfer"
    );

    // Child token so a timeout can stop in-flight work without cancelling the caller's token
    let transfer_cancel = cancel.child_token();
    let work = run_transfer(
        archive_path,
        Arc::clone(&sink),
        Arc::clone(&archive),
        spans,
        session_id,
        options,
        tracker.clone(),
        transfer_cancel.clone(),
    );

    let outcome = tokio::select! {
        result = tokio::time::timeout(options.timeout, work) => match result {
            Ok(inner) => inner,
            Err(_) => Err(SnapError::Network(NetworkError::Timeout(options.timeout))),
        },
        _ = cancel.cancelled() => Err(SnapError::Network(NetworkError::Cancelled)),
    };
    transfer_cancel.cancel();

    let response_body = match outcome {
        Ok(body) => body,
        Err(e) => {
            warn!(archive = %archive.file_name, error = %e, "transfer failed");
            return Err(e);
        }
    };

    let (chunk_states, requests) = tracker.snapshot();
    let result = TransferResult {
        mode: if chunked {
            TransferMode::Chunked
        } else {
            TransferMode::SingleShot
        },
        session_id,
        archive: (*archive).clone(),
        chunk_states,
        requests,
        response_body,
    };

    info!(
        archive = %result.archive.file_name,
        chunks = result.chunk_count(),
        requests = result.requests,
        "transfer complete"
    );
    Ok(result)
}

async fn describe_archive(path: &Path) -> Result<ArchiveInfo> {
    let size = tokio::fs::metadata(path)
        .await
        .map_err(|e| SnapError::resource(path, e))?
        .len();
    let owned = path.to_path_buf();
    let sha256 = tokio::task::spawn_blocking(move || sha256_file(&owned))
        .await
        .map_err(|e| SnapError::resource(path, std::io::Error::other(e)))??;
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "snapshot.snap".to_string());

    Ok(ArchiveInfo {
        file_name,
        size,
        sha256,
    })
}

#[allow(clippy::too_many_arguments)]
async fn run_transfer<S: ChunkSink + 'static>(
    archive_path: &Path,
    sink: Arc<S>,
    archive: Arc<ArchiveInfo>,
    spans: Vec<ChunkSpan>,
    session_id: Option<Uuid>,
    options: &TransferOptions,
    tracker: ChunkTracker,
    cancel: CancellationToken,
) -> Result<String> {
    let total = spans.len();
    let mut uploads = stream::iter(spans)
        .map(|span| {
            upload_span(
                archive_path,
                Arc::clone(&sink),
                Arc::clone(&archive),
                span,
                session_id.map(|id| (id, total)),
                &options.retry,
                tracker.clone(),
                cancel.clone(),
            )
        })
        .buffer_unordered(options.concurrency);

    let mut last_body = String::new();
    while let Some(result) = uploads.next().await {
        // Returning drops the stream, which aborts chunks still in flight
        last_body = result?;
    }
    Ok(last_body)
}

#[allow(clippy::too_many_arguments)]
async fn upload_span<S: ChunkSink + 'static>(
    archive_path: &Path,
    sink: Arc<S>,
    archive: Arc<ArchiveInfo>,
    span: ChunkSpan,
    session: Option<(Uuid, usize)>,
    policy: &RetryPolicy,
    tracker: ChunkTracker,
    cancel: CancellationToken,
) -> Result<String> {
    if cancel.is_cancelled() {
        return Err(SnapError::Network(NetworkError::Cancelled));
    }

    let body = read_span(archive_path, span).await?;
    let chunk = session.map(|(session_id, total)| ChunkInfo {
        session_id,
        index: span.index,
        total,
        offset: span.offset,
        sha256: compute_hash(&body),
    });
    let request = Arc::new(UploadRequest {
        archive,
        chunk,
        body,
    });

    let max_attempts = policy.max_attempts.max(1);
    let result = with_policy("upload_chunk", policy, |attempt| {
        let sink = Arc::clone(&sink);
        let request = Arc::clone(&request);
        let tracker = tracker.clone();
        let cancel = cancel.clone();
        let index = span.index;

        Box::pin(async move {
            if cancel.is_cancelled() {
                return Err(classify("upload_chunk", AttemptError::Network(NetworkError::Cancelled)));
            }
            if attempt > 1 {
                observability::record_retry();
            }
            tracker.advance(index, ChunkState::Sent);
            tracker.count_request();

            let started = Instant::now();
            let outcome = tokio::select! {
                outcome = sink.deliver(&request) => outcome,
                _ = cancel.cancelled() => Err(NetworkError::Cancelled),
            };
            observability::record_request(started.elapsed());

            match judge(outcome) {
                Ok(body) => {
                    tracker.advance(index, ChunkState::Acked);
                    debug!(chunk = index, attempt, "chunk acknowledged");
                    Ok(body)
                }
                Err(e) => {
                    let err = classify("upload_chunk", e);
                    let retrying = matches!(err, RetryError::Transient { .. }) && attempt < max_attempts;
                    tracker.advance(index, if retrying { ChunkState::Retrying } else { ChunkState::Failed });
                    Err(err)
                }
            }
        })
    })
    .await;

    result.map_err(|err| {
        observability::record_chunk_failure();
        into_snap_error(span.index, err)
    })
}

/// Classify a delivery outcome
fn judge(outcome: std::result::Result<SinkResponse, NetworkError>) -> std::result::Result<String, AttemptError> {
    let response = outcome.map_err(AttemptError::Network)?;
    match response.status {
        200..=299 => Ok(response.body),
        401 | 403 => Err(AttemptError::Auth {
            status: response.status,
            body: response.body,
        }),
        status => Err(AttemptError::Network(NetworkError::Rejected {
            status,
            body: response.body,
        })),
    }
}

fn into_snap_error(chunk: usize, err: RetryError) -> SnapError {
    let attempts = err.attempts();
    let source = err.into_source();
    let attempt_error = match source.downcast::<AttemptError>() {
        Ok(inner) => *inner,
        Err(other) => {
            return SnapError::Network(NetworkError::Connect(other.to_string()));
        }
    };

    match (attempt_error, attempts) {
        (AttemptError::Auth { status, body }, _) => {
            SnapError::auth(format!("status {status}: {body}"))
        }
        (AttemptError::Network(NetworkError::Cancelled), _) => SnapError::Network(NetworkError::Cancelled),
        (AttemptError::Network(last), Some(attempts)) => SnapError::Network(NetworkError::RetriesExhausted {
            chunk,
            attempts,
            last_error: last.to_string(),
        }),
        (AttemptError::Network(last), None) => SnapError::Network(last),
    }
}

async fn read_span(path: &Path, span: ChunkSpan) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path)
        .await
        .map_err(|e| SnapError::resource(path, e))?;
    file.seek(std::io::SeekFrom::Start(span.offset))
        .await
        .map_err(|e| SnapError::resource(path, e))?;

    let mut buffer = BytesMut::zeroed(span.len as usize);
    file.read_exact(&mut buffer)
        .await
        .map_err(|e| SnapError::resource(path, e))?;
    Ok(buffer.freeze())
}
