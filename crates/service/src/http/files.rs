use axum::body::Body;
use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use base64::Engine;
use http::header::{CONTENT_DISPOSITION, CONTENT_TYPE};
use http::HeaderMap;
use serde::Deserialize;

use common::crypt4gh::{ByteRange, PublicKey};

use crate::auth::AuthError;
use crate::http::PUBLIC_KEY_HEADER;
use crate::streaming::{self, DestinationFormat, StreamError};
use crate::ServiceState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadQuery {
    #[serde(default)]
    pub destination_format: Option<String>,
    #[serde(default)]
    pub start_coordinate: Option<String>,
    #[serde(default)]
    pub end_coordinate: Option<String>,
}

/// `GET /files/:file_id` — stream one archived file
///
/// Plaintext by default; `destinationFormat=crypt4gh` plus a `Public-Key`
/// header returns a container re-encrypted for the caller. A byte range
/// applies only when both coordinates are present.
pub async fn handler(
    State(state): State<ServiceState>,
    Path(file_id): Path<String>,
    Query(query): Query<DownloadQuery>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
    headers: HeaderMap,
) -> Result<Response, DownloadError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(DownloadError::MissingCredential)?;
    let authorized = state.authorizer().authorize(bearer.token()).await?;

    let format = match query.destination_format.as_deref() {
        Some(format) if !format.is_empty() => format.parse()?,
        _ => DestinationFormat::default(),
    };
    let range = parse_range(&query)?;
    let recipient = headers
        .get(PUBLIC_KEY_HEADER)
        .map(parse_public_key)
        .transpose()?;

    let file_stream = streaming::stream(
        state.database(),
        state.archive(),
        state.server_key(),
        &authorized,
        &file_id,
        recipient.as_ref(),
        format,
        range,
    )
    .await?;

    let filename = match file_stream.format {
        DestinationFormat::Crypt4gh => format!("{}.enc", file_stream.filename),
        DestinationFormat::Plain => file_stream.filename.clone(),
    };
    let disposition = format!("attachment; filename=\"{}\"", filename);

    Ok((
        http::StatusCode::OK,
        [
            (CONTENT_TYPE, "application/octet-stream"),
            (CONTENT_DISPOSITION, disposition.as_str()),
        ],
        Body::from_stream(file_stream.bytes),
    )
        .into_response())
}

/// A byte range applies only when both coordinates are present
fn parse_range(query: &DownloadQuery) -> Result<Option<ByteRange>, DownloadError> {
    let (Some(start), Some(end)) = (
        query.start_coordinate.as_deref().filter(|s| !s.is_empty()),
        query.end_coordinate.as_deref().filter(|s| !s.is_empty()),
    ) else {
        return Ok(None);
    };
    let start: u64 = start
        .parse()
        .map_err(|_| DownloadError::BadRequest(format!("invalid start coordinate: {}", start)))?;
    let end: u64 = end
        .parse()
        .map_err(|_| DownloadError::BadRequest(format!("invalid end coordinate: {}", end)))?;
    let range = ByteRange::new(start, end)
        .map_err(|e| DownloadError::BadRequest(e.to_string()))?;
    Ok(Some(range))
}

/// The `Public-Key` header carries a base64-encoded PEM block
fn parse_public_key(value: &http::HeaderValue) -> Result<PublicKey, DownloadError> {
    let raw = value
        .to_str()
        .map_err(|_| DownloadError::BadRequest("public key header is not ASCII".to_string()))?;
    let pem_text = match base64::engine::general_purpose::STANDARD.decode(raw.trim()) {
        Ok(decoded) => String::from_utf8(decoded)
            .map_err(|_| DownloadError::BadRequest("public key is not UTF-8".to_string()))?,
        // tolerate an unencoded PEM, some clients send it as-is
        Err(_) => raw.to_string(),
    };
    PublicKey::from_pem(&pem_text)
        .map_err(|e| DownloadError::BadRequest(format!("invalid public key: {}", e)))
}

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    Stream(#[from] StreamError),
    #[error("{0}")]
    BadRequest(String),
}

impl IntoResponse for DownloadError {
    fn into_response(self) -> Response {
        match self {
            DownloadError::MissingCredential | DownloadError::Auth(_) => {
                (http::StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            DownloadError::Stream(StreamError::Forbidden) => {
                (http::StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
            DownloadError::Stream(
                err @ (StreamError::UnknownFormat(_)
                | StreamError::MissingRecipientKey
                | StreamError::Range(_)),
            ) => (http::StatusCode::BAD_REQUEST, err.to_string()).into_response(),
            DownloadError::BadRequest(message) => {
                (http::StatusCode::BAD_REQUEST, message).into_response()
            }
            DownloadError::Stream(err) => {
                tracing::error!(error = %err, "download failed");
                (
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected error".to_string(),
                )
                    .into_response()
            }
        }
    }
}
