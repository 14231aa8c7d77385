//! Represents one resumable chunked upload, in progress or finished.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Lifecycle state of an upload session.
///
/// Stored as an integer so callers embedding this crate can extend the
/// numbering with their own terminal states (failed, aborted) without a
/// schema change.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, sqlx::Type)]
#[repr(i32)]
pub enum UploadStatus {
    Uploading = 1,
    Complete = 2,
}

/// A chunked upload session.
///
/// The session row is the single source of truth for resumption: `offset` is
/// the number of bytes durably appended to `storage_ref`, and doubles as the
/// required `start` of the next chunk. The two are only ever advanced
/// together; a failed append leaves both untouched.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug)]
pub struct UploadSession {
    /// Client-facing handle, a collision-resistant random token generated at
    /// creation. Immutable.
    pub upload_id: String,

    /// Name of the backing blob/file. Assigned at creation, immutable, and
    /// exclusively owned by this session for its lifetime.
    pub storage_ref: String,

    /// Original client filename. Metadata only.
    pub filename: String,

    /// Bytes durably appended so far. Monotonically non-decreasing.
    pub offset: i64,

    /// When the session was created. Set once.
    pub created_at: DateTime<Utc>,

    /// When the session transitioned to `Complete`. Set exactly once.
    pub completed_at: Option<DateTime<Utc>>,

    /// Current lifecycle state.
    pub status: UploadStatus,

    /// Principal that started the upload; when present, all later lookups of
    /// this session are scoped to the same principal.
    pub owner_id: Option<String>,

    /// Cached whole-file MD5 hex digest. Cleared whenever `offset` advances,
    /// recomputed lazily on the next read.
    pub checksum: Option<String>,
}

impl UploadSession {
    /// Derived expiry instant: `created_at + window`. Never stored.
    pub fn expires_at(&self, window: Duration) -> DateTime<Utc> {
        self.created_at + window
    }

    /// Expiration is lazy: evaluated against `now` on every access rather
    /// than by a background sweep.
    pub fn is_expired(&self, window: Duration, now: DateTime<Utc>) -> bool {
        now >= self.expires_at(window)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn session_created_at(created_at: DateTime<Utc>) -> UploadSession {
        UploadSession {
            upload_id: "abc".into(),
            storage_ref: "abc.part".into(),
            filename: "a.txt".into(),
            offset: 0,
            created_at,
            completed_at: None,
            status: UploadStatus::Uploading,
            owner_id: None,
            checksum: None,
        }
    }

    #[test]
    fn expires_exactly_at_window_boundary() {
        let created = Utc::now();
        let window = Duration::hours(24);
        let s = session_created_at(created);

        assert!(!s.is_expired(window, created));
        assert!(!s.is_expired(window, created + Duration::hours(23)));
        // Boundary is inclusive: `now >= created_at + window`.
        assert!(s.is_expired(window, created + window));
        assert!(s.is_expired(window, created + Duration::hours(25)));
    }

    #[test]
    fn expires_at_is_derived_from_created_at() {
        let created = Utc::now();
        let s = session_created_at(created);
        assert_eq!(s.expires_at(Duration::seconds(30)), created + Duration::seconds(30));
    }
}
