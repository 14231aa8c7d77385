//! HTTP handlers for the chunked upload protocol.
//! Translates multipart/JSON requests into plain protocol structs and
//! delegates all state handling to `UploadService`.

use crate::{
    errors::AppError,
    services::upload_service::{
        ChunkRequest, CompleteRequest, ContentRange, UploadService,
    },
};
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
};
use serde::Deserialize;

/// Multipart field carrying the chunk bytes.
const FILE_FIELD: &str = "file";
/// Multipart field carrying the session handle on continuation requests.
const UPLOAD_ID_FIELD: &str = "upload_id";
/// Header naming the requesting principal. Authentication itself happens
/// upstream; by the time a request lands here the value is trusted.
const OWNER_HEADER: &str = "x-upload-owner";

/// Request body for `POST /uploads/complete`.
#[derive(Debug, Deserialize)]
pub struct CompleteUploadReq {
    pub upload_id: Option<String>,
    pub md5: Option<String>,
}

/// Parse a `Content-Range` value of the form `bytes {start}-{end}/{total}`
/// (inclusive end, 0-indexed, digits only). Anything else is treated as if
/// the header were absent, which matches how lenient upload clients behave.
pub fn parse_content_range(value: &str) -> Option<ContentRange> {
    let rest = value.strip_prefix("bytes ")?;
    let (range, total) = rest.split_once('/')?;
    let (start, end) = range.split_once('-')?;
    Some(ContentRange {
        start: parse_digits(start)?,
        end: parse_digits(end)?,
        total: parse_digits(total)?,
    })
}

fn parse_digits(s: &str) -> Option<i64> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    s.parse().ok()
}

fn owner_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get(OWNER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// `POST /uploads` — append one chunk, creating the session when no
/// `upload_id` field is present. Responds with `{upload_id, offset,
/// expires_at}` so the client knows where the next chunk starts.
pub async fn append_chunk(
    State(service): State<UploadService>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<impl IntoResponse, AppError> {
    let mut req = ChunkRequest {
        owner_id: owner_from_headers(&headers),
        content_range: headers
            .get(header::CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range),
        ..Default::default()
    };

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?
    {
        let name = field.name().map(str::to_string);
        match name.as_deref() {
            Some(FILE_FIELD) => {
                req.filename = field.file_name().map(str::to_string);
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                req.chunk = Some(bytes);
            }
            Some(UPLOAD_ID_FIELD) => {
                let value = field
                    .text()
                    .await
                    .map_err(|err| AppError::new(StatusCode::BAD_REQUEST, err.to_string()))?;
                if !value.is_empty() {
                    req.upload_id = Some(value);
                }
            }
            _ => {}
        }
    }

    let progress = service.append_chunk(req).await?;
    Ok(Json(progress))
}

/// `POST /uploads/complete` — verify and finalize a session.
pub async fn complete_upload(
    State(service): State<UploadService>,
    headers: HeaderMap,
    Json(body): Json<CompleteUploadReq>,
) -> Result<impl IntoResponse, AppError> {
    let progress = service
        .complete_upload(CompleteRequest {
            upload_id: body.upload_id,
            checksum: body.md5,
            owner_id: owner_from_headers(&headers),
        })
        .await?;
    Ok(Json(progress))
}

/// `GET /uploads/{upload_id}` — progress probe for reconnecting clients.
pub async fn upload_status(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    let progress = service
        .session_progress(&upload_id, owner_from_headers(&headers).as_deref())
        .await?;
    Ok(Json(progress))
}

/// `DELETE /uploads/{upload_id}` — drop the session record and its backing
/// blob together.
pub async fn delete_upload(
    State(service): State<UploadService>,
    Path(upload_id): Path<String>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, AppError> {
    service
        .delete_session(&upload_id, owner_from_headers(&headers).as_deref())
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_range() {
        assert_eq!(
            parse_content_range("bytes 0-49/100"),
            Some(ContentRange {
                start: 0,
                end: 49,
                total: 100
            })
        );
        assert_eq!(
            parse_content_range("bytes 50-99/100"),
            Some(ContentRange {
                start: 50,
                end: 99,
                total: 100
            })
        );
    }

    #[test]
    fn rejects_malformed_ranges() {
        assert_eq!(parse_content_range(""), None);
        assert_eq!(parse_content_range("bytes"), None);
        assert_eq!(parse_content_range("bytes 0-49"), None);
        assert_eq!(parse_content_range("bytes a-b/c"), None);
        assert_eq!(parse_content_range("bytes -1-49/100"), None);
        assert_eq!(parse_content_range("bytes 0-49/100 trailing"), None);
        assert_eq!(parse_content_range("bits 0-49/100"), None);
    }

    #[test]
    fn single_byte_range_parses() {
        assert_eq!(
            parse_content_range("bytes 0-0/1"),
            Some(ContentRange {
                start: 0,
                end: 0,
                total: 1
            })
        );
    }
}
