//! Defines routes for the chunked upload API.
//!
//! ## Structure
//! - **Upload endpoints**
//!   - `POST   /uploads` — append a chunk (multipart `file` + optional
//!     `upload_id` field, optional `Content-Range` header); creates the
//!     session when no `upload_id` is supplied
//!   - `POST   /uploads/complete` — verify checksum and finalize a session
//!   - `GET    /uploads/{upload_id}` — progress probe (offset + expiry)
//!   - `DELETE /uploads/{upload_id}` — delete session record and blob
//!
//! Requests may carry an `x-upload-owner` header; sessions started with an
//! owner are only visible to that owner afterwards.

use crate::{
    handlers::{
        health_handlers::{healthz, readyz},
        upload_handlers::{append_chunk, complete_upload, delete_upload, upload_status},
    },
    services::upload_service::UploadService,
};
use axum::{
    Router,
    routing::{get, post},
};

/// Build and return the router for all upload routes.
///
/// The router carries shared state (`UploadService`) to all handlers.
pub fn routes() -> Router<UploadService> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Upload protocol
        .route("/uploads", post(append_chunk))
        .route("/uploads/complete", post(complete_upload))
        .route(
            "/uploads/{upload_id}",
            get(upload_status).delete(delete_upload),
        )
}
