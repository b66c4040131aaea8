//! Asynchronous export orchestrator
//!
//! Consumes export jobs from the queue: authorizes the embedded
//! credential, resolves the target to its files and drives the streaming
//! orchestrator for each one into the caller's outbox. Delivery is
//! at-most-one-attempt — failures are logged by the consumer and never
//! requeued, so a duplicate delivery can at worst repeat an
//! overwrite-safe write.

use std::collections::HashSet;

use serde::Deserialize;

use common::crypt4gh::{ByteRange, KeyError, PublicKey, SecretKey};
use common::metadata::MetadataProvider;

use crate::auth::{self, AuthError, VisaAuthorizer};
use crate::storage::{ArchiveStore, Outbox, StorageError};
use crate::streaming::{self, DestinationFormat, StreamError};

/// Errors terminating one export job
#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("malformed export request: {0}")]
    MalformedJob(#[from] serde_json::Error),
    #[error("export request names neither a dataset nor a file")]
    MissingTarget,
    #[error("invalid coordinate in export request: {0}")]
    BadCoordinate(String),
    #[error("invalid recipient key: {0}")]
    RecipientKey(#[from] KeyError),
    #[error("authorization failed: {0}")]
    Auth(#[from] AuthError),
    #[error("streaming failed: {0}")]
    Stream(#[from] StreamError),
    #[error("outbox write failed: {0}")]
    Storage(#[from] StorageError),
    #[error("metadata store error: {0}")]
    Metadata(String),
}

/// An inbound export job, strictly matching the queue message schema
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ExportRequest {
    pub jwt_token: String,
    #[serde(default)]
    pub dataset_id: Option<String>,
    #[serde(default)]
    pub file_id: Option<String>,
    pub public_key: String,
    #[serde(default)]
    pub start_coordinate: Option<String>,
    #[serde(default)]
    pub end_coordinate: Option<String>,
}

/// What one job exports: a whole dataset or a single file
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExportTarget {
    Dataset(String),
    File(String),
}

impl ExportRequest {
    /// A dataset id takes precedence over a file id; neither is an error
    pub fn target(&self) -> Result<ExportTarget, ExportError> {
        if let Some(dataset_id) = self.dataset_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(ExportTarget::Dataset(dataset_id.to_string()));
        }
        if let Some(file_id) = self.file_id.as_deref().filter(|id| !id.is_empty()) {
            return Ok(ExportTarget::File(file_id.to_string()));
        }
        Err(ExportError::MissingTarget)
    }

    /// A byte range applies only when both coordinates are present
    pub fn range(&self) -> Result<Option<ByteRange>, ExportError> {
        let (Some(start), Some(end)) = (
            self.start_coordinate.as_deref().filter(|s| !s.is_empty()),
            self.end_coordinate.as_deref().filter(|s| !s.is_empty()),
        ) else {
            return Ok(None);
        };
        let start: u64 = start
            .parse()
            .map_err(|_| ExportError::BadCoordinate(start.to_string()))?;
        let end: u64 = end
            .parse()
            .map_err(|_| ExportError::BadCoordinate(end.to_string()))?;
        let range = ByteRange::new(start, end)
            .map_err(|e| ExportError::BadCoordinate(e.to_string()))?;
        Ok(Some(range))
    }
}

/// Process one raw queue delivery
///
/// The consumer logs the error and acks the delivery either way; nothing
/// here is retried.
pub async fn process_message<M: MetadataProvider>(
    meta: &M,
    archive: &ArchiveStore,
    outbox: &Outbox,
    authorizer: &VisaAuthorizer,
    server_key: &SecretKey,
    payload: &[u8],
) -> Result<(), ExportError> {
    let request: ExportRequest = serde_json::from_slice(payload)?;
    let user = auth::subject(&request.jwt_token)?;
    let target = request.target()?;
    let range = request.range()?;
    tracing::info!(user = %user, ?target, "export request received");

    let authorized = authorizer.authorize(&request.jwt_token).await?;
    let recipient = PublicKey::from_pem(&request.public_key)?;

    match target {
        ExportTarget::Dataset(dataset_id) => {
            let released = meta
                .latest_event(&dataset_id)
                .await
                .map_err(|e| ExportError::Metadata(e.to_string()))?
                .map(|event| event.is_release())
                .unwrap_or(false);
            if !released {
                tracing::warn!(dataset_id = %dataset_id, "dataset is not released, skipping export");
                return Ok(());
            }
            let files = meta
                .files_in_dataset(&dataset_id)
                .await
                .map_err(|e| ExportError::Metadata(e.to_string()))?;
            tracing::info!(dataset_id = %dataset_id, files = files.len(), "exporting dataset");
            // sequential per file; the first failure aborts the rest of
            // the job, already-written files stay
            for file in files {
                export_file(
                    meta, archive, outbox, server_key, &authorized, &user, &file.file_id,
                    &recipient, range,
                )
                .await?;
            }
        }
        ExportTarget::File(file_id) => {
            export_file(
                meta, archive, outbox, server_key, &authorized, &user, &file_id, &recipient,
                range,
            )
            .await?;
        }
    }
    Ok(())
}

/// Export one file: always re-encrypted for the job's recipient key
#[allow(clippy::too_many_arguments)]
async fn export_file<M: MetadataProvider>(
    meta: &M,
    archive: &ArchiveStore,
    outbox: &Outbox,
    server_key: &SecretKey,
    authorized: &HashSet<String>,
    user: &str,
    file_id: &str,
    recipient: &PublicKey,
    range: Option<ByteRange>,
) -> Result<(), ExportError> {
    let file_stream = streaming::stream(
        meta,
        archive,
        server_key,
        authorized,
        file_id,
        Some(recipient),
        DestinationFormat::Crypt4gh,
        range,
    )
    .await?;

    tracing::info!(file_id, user = %user, filename = %file_stream.filename, "exporting file");
    let outcome = outbox
        .write(user, &file_stream.filename, file_stream.bytes)
        .await?;
    tracing::info!(file_id, ?outcome, "file exported");
    Ok(())
}
