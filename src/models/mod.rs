//! Data model for the chunked upload service.
//!
//! A single entity backs the whole protocol: the upload session. It maps to
//! its SQLite table via `sqlx::FromRow` and serializes naturally as JSON via
//! `serde`.

pub mod session;
