//! src/services/upload_service.rs
//!
//! UploadService — the chunk-append and completion protocols over a
//! `BlobSink` for payload bytes and SQLite for session metadata. This file
//! owns the protocol state machine: offset sequencing, expiry, checksum
//! verification, and the injected validate/completion hooks. It does not
//! know anything about HTTP; handlers translate requests into the plain
//! structs below.

use crate::{
    models::session::{UploadSession, UploadStatus},
    services::blob_sink::BlobSink,
};
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::future::BoxFuture;
use md5::Context;
use serde::Serialize;
use sqlx::SqlitePool;
use std::{
    collections::HashMap,
    io,
    sync::{Arc, Mutex as StdMutex},
};
use tokio::{io::AsyncReadExt, sync::Mutex as AsyncMutex};
use tracing::{debug, warn};
use uuid::Uuid;

/// Protocol errors. Every variant except `Sqlx`/`Io` is recoverable by the
/// client; the mapping to HTTP statuses lives in `errors.rs`.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("no chunk file was submitted")]
    MissingChunk,
    #[error("request is missing the content-range header")]
    MissingRangeHeader,
    #[error("{0}")]
    MissingParameters(String),
    #[error("offsets do not match")]
    OffsetMismatch { offset: i64 },
    #[error("chunk size doesn't match headers")]
    SizeMismatch,
    #[error("size of file exceeds the limit ({max_bytes} bytes)")]
    SizeLimitExceeded { max_bytes: i64 },
    #[error("upload has already been marked as complete")]
    AlreadyComplete,
    #[error("upload has expired")]
    Expired,
    #[error("md5 checksum does not match")]
    ChecksumMismatch,
    #[error("upload `{0}` not found")]
    NotFound(String),
    #[error("{0}")]
    Forbidden(String),
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),
    #[error(transparent)]
    Io(#[from] io::Error),
}

pub type UploadResult<T> = Result<T, UploadError>;

/// Declared position of a chunk within the full file, from the
/// `Content-Range: bytes {start}-{end}/{total}` header. End is inclusive.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    pub end: i64,
    pub total: i64,
}

/// One chunk-append request, already lifted out of its transport.
/// `upload_id` absent means "start a new session".
#[derive(Debug, Default)]
pub struct ChunkRequest {
    pub upload_id: Option<String>,
    pub filename: Option<String>,
    pub owner_id: Option<String>,
    pub chunk: Option<Bytes>,
    pub content_range: Option<ContentRange>,
}

/// Completion request: finalize the session, optionally verifying the
/// client-supplied whole-file MD5 first.
#[derive(Debug, Default)]
pub struct CompleteRequest {
    pub upload_id: Option<String>,
    pub checksum: Option<String>,
    pub owner_id: Option<String>,
}

/// Success payload shared by append, completion, and the status probe.
#[derive(Debug, Serialize)]
pub struct UploadProgress {
    pub upload_id: String,
    pub offset: i64,
    pub expires_at: DateTime<Utc>,
}

/// Handle to a finished upload, passed to the completion hook. The reader is
/// open at the start of the assembled object; `size` reports the session's
/// final offset.
pub struct UploadedFile {
    pub name: String,
    pub size: i64,
    pub file: tokio::fs::File,
}

/// Request facts offered to the validate hook.
pub struct RequestContext<'a> {
    pub upload_id: Option<&'a str>,
    pub owner_id: Option<&'a str>,
    pub filename: Option<&'a str>,
}

/// Caller-supplied veto over any append or completion; return an error to
/// reject the request for a domain reason (quota, content policy, ...).
pub type ValidateHook =
    Arc<dyn for<'a> Fn(&RequestContext<'a>) -> UploadResult<()> + Send + Sync>;

/// Caller-supplied side effect invoked once per successful completion with
/// the finished file. Failures here are logged, never retried, and do not
/// roll the session back; behave accordingly.
pub type CompletionHook =
    Arc<dyn Fn(UploadedFile) -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// Policy knobs for the protocol, fixed at construction.
#[derive(Clone, Debug)]
pub struct UploadPolicy {
    /// Reject uploads whose declared total exceeds this. `None` = unlimited.
    pub max_bytes: Option<i64>,
    /// Sessions expire `expiration_window` after creation.
    pub expiration_window: Duration,
    /// When true, a chunk without a content-range header is an error.
    /// When false, the request is treated as carrying the entire file —
    /// some single-chunk clients never send the header and depend on this.
    pub fail_if_no_header: bool,
    /// Whether completion requires and verifies a whole-file MD5.
    pub do_checksum_check: bool,
}

/// UploadService drives both protocols:
/// - Append a chunk (validate against session state, append via `BlobSink`,
///   advance the offset, persist the session)
/// - Complete an upload (verify integrity, flip status, fire the hook)
///
/// Sessions survive client disconnects; the offset in the session row tells
/// a reconnecting client exactly where to resume. Per-session async mutexes
/// serialize concurrent requests for the same session so two appends can
/// never race past the offset check together.
#[derive(Clone)]
pub struct UploadService {
    /// Shared SQLite connection pool holding session rows.
    pub db: Arc<SqlitePool>,

    /// Payload storage backend, chosen at construction.
    pub sink: BlobSink,

    policy: UploadPolicy,
    validate: Option<ValidateHook>,
    on_completion: Option<CompletionHook>,
    locks: Arc<StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>>,
}

const CHECKSUM_READ_BUF: usize = 64 * 1024;

impl UploadService {
    pub fn new(db: Arc<SqlitePool>, sink: BlobSink, policy: UploadPolicy) -> Self {
        Self {
            db,
            sink,
            policy,
            validate: None,
            on_completion: None,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Install the extra-validation hook, run before any session state is
    /// touched.
    pub fn with_validate_hook(mut self, hook: ValidateHook) -> Self {
        self.validate = Some(hook);
        self
    }

    /// Install the completion side-effect hook.
    pub fn with_completion_hook(mut self, hook: CompletionHook) -> Self {
        self.on_completion = Some(hook);
        self
    }

    pub fn policy(&self) -> &UploadPolicy {
        &self.policy
    }

    /// Append one chunk to a session, creating the session when no
    /// `upload_id` is supplied. Checks run in a fixed order and the first
    /// failure wins; the offset only advances after the sink reports the
    /// bytes durable.
    pub async fn append_chunk(&self, req: ChunkRequest) -> UploadResult<UploadProgress> {
        let chunk = req.chunk.as_ref().ok_or(UploadError::MissingChunk)?;
        self.run_validate_hook(&req.upload_id, &req.owner_id, &req.filename)?;

        // Serialize everything from resolve to persist for one session.
        // Freshly created sessions need no lock: nobody else knows the id
        // until we return it.
        let guard_lock = match &req.upload_id {
            Some(id) => Some(self.session_lock(id)),
            None => None,
        };
        let _guard = match &guard_lock {
            Some(lock) => Some(lock.lock().await),
            None => None,
        };

        let (mut session, new) = match &req.upload_id {
            Some(id) => {
                let session = self.fetch_session(id, req.owner_id.as_deref()).await?;
                (session, false)
            }
            None => (self.create_session(&req).await?, true),
        };

        let now = Utc::now();
        if session.is_expired(self.policy.expiration_window, now) {
            // Expired sessions never make progress again; their registry
            // entry would otherwise outlive them.
            self.drop_session_lock(&session.upload_id);
            return Err(UploadError::Expired);
        }
        if session.status == UploadStatus::Complete {
            return Err(UploadError::AlreadyComplete);
        }

        let range = match req.content_range {
            Some(range) => range,
            None if self.policy.fail_if_no_header => {
                return Err(UploadError::MissingRangeHeader);
            }
            // No header: treat this request as the entire file.
            None => ContentRange {
                start: 0,
                end: chunk.len() as i64 - 1,
                total: chunk.len() as i64,
            },
        };
        // Checked: a hostile header like `bytes 0-{i64::MAX}/{i64::MAX}`
        // must become a structured rejection, not an overflow. Zero stays
        // allowed for the synthesized empty-chunk fallback.
        let chunk_size = range
            .end
            .checked_sub(range.start)
            .and_then(|d| d.checked_add(1))
            .filter(|size| *size >= 0)
            .ok_or(UploadError::SizeMismatch)?;

        if let Some(max_bytes) = self.policy.max_bytes {
            if range.total > max_bytes {
                return Err(UploadError::SizeLimitExceeded { max_bytes });
            }
        }
        if session.offset != range.start {
            // Report the current offset so the client can resynchronize.
            return Err(UploadError::OffsetMismatch {
                offset: session.offset,
            });
        }
        if chunk.len() as i64 != chunk_size {
            return Err(UploadError::SizeMismatch);
        }

        let new_offset = self
            .sink
            .append(&session.storage_ref, session.offset, chunk, Some(chunk_size))
            .await?;
        session.offset = new_offset;
        session.checksum = None;

        if new {
            self.insert_session(&session).await?;
        } else {
            self.update_session(&session).await?;
        }
        debug!(
            upload_id = %session.upload_id,
            offset = session.offset,
            "appended chunk of {chunk_size} bytes"
        );

        Ok(self.progress(&session))
    }

    /// Finalize an upload: verify integrity, flip the status, and hand the
    /// assembled file to the completion hook. All-or-nothing: any rejection
    /// leaves the session exactly as it was.
    pub async fn complete_upload(&self, req: CompleteRequest) -> UploadResult<UploadProgress> {
        let upload_id = match (&req.upload_id, self.policy.do_checksum_check) {
            (Some(id), true) if req.checksum.is_some() => id.clone(),
            (Some(_), true) | (None, true) => {
                return Err(UploadError::MissingParameters(
                    "both 'upload_id' and 'md5' are required".into(),
                ));
            }
            (Some(id), false) => id.clone(),
            (None, false) => {
                return Err(UploadError::MissingParameters(
                    "'upload_id' is required".into(),
                ));
            }
        };

        let lock = self.session_lock(&upload_id);
        let _guard = lock.lock().await;

        let mut session = self.fetch_session(&upload_id, req.owner_id.as_deref()).await?;
        self.run_validate_hook(&req.upload_id, &req.owner_id, &None)?;

        if session.status == UploadStatus::Complete {
            return Err(UploadError::AlreadyComplete);
        }
        if session.is_expired(self.policy.expiration_window, Utc::now()) {
            self.drop_session_lock(&session.upload_id);
            return Err(UploadError::Expired);
        }

        if self.policy.do_checksum_check {
            let supplied = req.checksum.as_deref().unwrap_or_default();
            let computed = self.checksum(&mut session).await?;
            if computed != supplied {
                return Err(UploadError::ChecksumMismatch);
            }
        }

        session.status = UploadStatus::Complete;
        session.completed_at = Some(Utc::now());
        self.update_session(&session).await?;

        if let Some(hook) = &self.on_completion {
            let file = self.sink.open_read(&session.storage_ref).await?;
            let uploaded = UploadedFile {
                name: session.filename.clone(),
                size: session.offset,
                file,
            };
            if let Err(err) = hook(uploaded).await {
                // The hook's failure handling belongs to the caller; the
                // upload itself is already complete and durable.
                warn!(upload_id = %session.upload_id, "completion hook failed: {err:#}");
            }
        }

        self.drop_session_lock(&session.upload_id);
        Ok(self.progress(&session))
    }

    /// Progress probe for reconnecting clients: where to resume from.
    pub async fn session_progress(
        &self,
        upload_id: &str,
        owner_id: Option<&str>,
    ) -> UploadResult<UploadProgress> {
        let session = self.fetch_session(upload_id, owner_id).await?;
        Ok(self.progress(&session))
    }

    /// Delete a session's metadata row and its backing blob together.
    /// Leaving either behind is a storage leak.
    pub async fn delete_session(&self, upload_id: &str, owner_id: Option<&str>) -> UploadResult<()> {
        let lock = self.session_lock(upload_id);
        let _guard = lock.lock().await;

        let session = self.fetch_session(upload_id, owner_id).await?;
        sqlx::query("DELETE FROM upload_sessions WHERE upload_id = ?")
            .bind(&session.upload_id)
            .execute(&*self.db)
            .await?;
        self.sink.delete(&session.storage_ref).await?;
        drop(_guard);
        self.drop_session_lock(upload_id);
        Ok(())
    }

    /// Whole-file MD5 of the assembled object, as lowercase hex. Uses the
    /// cached value when the offset hasn't moved since it was computed;
    /// otherwise streams the full object through the hash in one pass.
    pub async fn checksum(&self, session: &mut UploadSession) -> UploadResult<String> {
        if let Some(cached) = &session.checksum {
            return Ok(cached.clone());
        }

        let mut file = self.sink.open_read(&session.storage_ref).await?;
        let mut digest = Context::new();
        let mut buf = vec![0u8; CHECKSUM_READ_BUF];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            digest.consume(&buf[..n]);
        }
        let hex = format!("{:x}", digest.compute());

        session.checksum = Some(hex.clone());
        sqlx::query("UPDATE upload_sessions SET checksum = ? WHERE upload_id = ?")
            .bind(&hex)
            .bind(&session.upload_id)
            .execute(&*self.db)
            .await?;
        Ok(hex)
    }

    fn progress(&self, session: &UploadSession) -> UploadProgress {
        UploadProgress {
            upload_id: session.upload_id.clone(),
            offset: session.offset,
            expires_at: session.expires_at(self.policy.expiration_window),
        }
    }

    fn run_validate_hook(
        &self,
        upload_id: &Option<String>,
        owner_id: &Option<String>,
        filename: &Option<String>,
    ) -> UploadResult<()> {
        if let Some(hook) = &self.validate {
            hook(&RequestContext {
                upload_id: upload_id.as_deref(),
                owner_id: owner_id.as_deref(),
                filename: filename.as_deref(),
            })?;
        }
        Ok(())
    }

    /// Create a fresh session with a clean zero-length backing object.
    /// The row is not persisted yet; the first append's persist step does
    /// that, so a failed first append leaves no trace.
    async fn create_session(&self, req: &ChunkRequest) -> UploadResult<UploadSession> {
        let upload_id = Uuid::new_v4().simple().to_string();
        let storage_ref = format!("{upload_id}.part");
        self.sink.reset(&storage_ref).await?;

        Ok(UploadSession {
            upload_id,
            storage_ref,
            filename: req.filename.clone().unwrap_or_else(|| "unnamed".into()),
            offset: 0,
            created_at: Utc::now(),
            completed_at: None,
            status: UploadStatus::Uploading,
            owner_id: req.owner_id.clone(),
            checksum: None,
        })
    }

    /// Fetch a session by id, scoped to the requesting owner. A session that
    /// belongs to someone else is indistinguishable from a missing one.
    async fn fetch_session(
        &self,
        upload_id: &str,
        owner_id: Option<&str>,
    ) -> UploadResult<UploadSession> {
        let session = sqlx::query_as::<_, UploadSession>(
            "SELECT upload_id, storage_ref, filename, offset, created_at,
                    completed_at, status, owner_id, checksum
             FROM upload_sessions WHERE upload_id = ?",
        )
        .bind(upload_id)
        .fetch_one(&*self.db)
        .await
        .map_err(|err| match err {
            sqlx::Error::RowNotFound => UploadError::NotFound(upload_id.to_string()),
            other => UploadError::Sqlx(other),
        })?;

        if let Some(owner) = &session.owner_id {
            if owner_id != Some(owner.as_str()) {
                return Err(UploadError::NotFound(upload_id.to_string()));
            }
        }
        Ok(session)
    }

    async fn insert_session(&self, session: &UploadSession) -> UploadResult<()> {
        sqlx::query(
            "INSERT INTO upload_sessions (
                upload_id, storage_ref, filename, offset, created_at,
                completed_at, status, owner_id, checksum
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&session.upload_id)
        .bind(&session.storage_ref)
        .bind(&session.filename)
        .bind(session.offset)
        .bind(session.created_at)
        .bind(session.completed_at)
        .bind(session.status)
        .bind(&session.owner_id)
        .bind(&session.checksum)
        .execute(&*self.db)
        .await?;
        Ok(())
    }

    async fn update_session(&self, session: &UploadSession) -> UploadResult<()> {
        let result = sqlx::query(
            "UPDATE upload_sessions
             SET offset = ?, completed_at = ?, status = ?, checksum = ?
             WHERE upload_id = ?",
        )
        .bind(session.offset)
        .bind(session.completed_at)
        .bind(session.status)
        .bind(&session.checksum)
        .bind(&session.upload_id)
        .execute(&*self.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(UploadError::NotFound(session.upload_id.clone()));
        }
        Ok(())
    }

    /// Per-session mutex, created on first use. Holding it across
    /// resolve → append → persist stops two requests for the same session
    /// racing past the offset check together.
    fn session_lock(&self, upload_id: &str) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks
            .entry(upload_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    /// Drop a registry entry once a session reaches a terminal state so the
    /// map doesn't grow with every finished upload.
    fn drop_session_lock(&self, upload_id: &str) {
        let mut locks = self.locks.lock().expect("lock registry poisoned");
        locks.remove(upload_id);
    }
}
