use std::collections::HashSet;

use axum::extract::{Json, Path, State};
use axum::response::{IntoResponse, Response};
use axum_extra::headers::authorization::Bearer;
use axum_extra::headers::Authorization;
use axum_extra::TypedHeader;
use serde::Serialize;

use common::metadata::{ArchivedFile, MetadataProvider};

use crate::auth::AuthError;
use crate::ServiceState;

/// File descriptor served by the metadata endpoints
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FileRecord {
    pub file_id: String,
    pub dataset_id: String,
    pub display_file_name: String,
    pub file_name: String,
    pub file_size: Option<i64>,
    pub decrypted_file_size: Option<i64>,
    pub decrypted_file_checksum: Option<String>,
    pub decrypted_file_checksum_type: Option<String>,
    pub file_status: String,
}

impl FileRecord {
    fn new(file: ArchivedFile, dataset_id: &str) -> Self {
        Self {
            file_id: file.file_id,
            dataset_id: dataset_id.to_string(),
            display_file_name: file.display_name,
            file_name: file.file_path,
            file_size: file.file_size,
            decrypted_file_size: file.decrypted_size,
            decrypted_file_checksum: file.decrypted_checksum,
            decrypted_file_checksum_type: file.decrypted_checksum_type,
            file_status: file.status,
        }
    }
}

/// `GET /metadata/datasets` — the caller's authorized datasets that exist
/// in the store
pub async fn datasets(
    State(state): State<ServiceState>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Vec<String>>, MetadataError> {
    let authorized = authorize(&state, bearer).await?;
    let known = state
        .database()
        .known_datasets(&authorized)
        .await
        .map_err(|e| MetadataError::Metadata(e.to_string()))?;
    Ok(Json(known))
}

/// `GET /metadata/datasets/:dataset_id/files` — files of one authorized
/// dataset; the path segment may be a dataset id or a reference alias
pub async fn files(
    State(state): State<ServiceState>,
    Path(dataset_id): Path<String>,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<Json<Vec<FileRecord>>, MetadataError> {
    let authorized = authorize(&state, bearer).await?;
    let resolved = resolve_dataset(state.database(), &authorized, &dataset_id).await?;

    let files = state
        .database()
        .files_in_dataset(&resolved)
        .await
        .map_err(|e| MetadataError::Metadata(e.to_string()))?;
    Ok(Json(
        files
            .into_iter()
            .map(|file| FileRecord::new(file, &resolved))
            .collect(),
    ))
}

/// Resolve the path segment to an authorized dataset id
///
/// The segment is either a dataset id the caller holds a visa for, or an
/// external reference alias pointing at one. Anything else is denied.
pub async fn resolve_dataset<M: MetadataProvider>(
    meta: &M,
    authorized: &HashSet<String>,
    dataset_id: &str,
) -> Result<String, MetadataError> {
    if authorized.contains(dataset_id) {
        return Ok(dataset_id.to_string());
    }
    let alias = meta
        .dataset_by_reference(dataset_id)
        .await
        .map_err(|e| MetadataError::Metadata(e.to_string()))?;
    match alias {
        Some(alias) if authorized.contains(&alias.dataset_id) => Ok(alias.dataset_id),
        _ => {
            tracing::info!(dataset_id = %dataset_id, "user has no permission for the requested dataset");
            Err(MetadataError::Forbidden)
        }
    }
}

async fn authorize(
    state: &ServiceState,
    bearer: Option<TypedHeader<Authorization<Bearer>>>,
) -> Result<HashSet<String>, MetadataError> {
    let TypedHeader(Authorization(bearer)) = bearer.ok_or(MetadataError::MissingCredential)?;
    Ok(state.authorizer().authorize(bearer.token()).await?)
}

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error("missing bearer credential")]
    MissingCredential,
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error("access denied")]
    Forbidden,
    #[error("metadata store error: {0}")]
    Metadata(String),
}

impl IntoResponse for MetadataError {
    fn into_response(self) -> Response {
        match self {
            MetadataError::MissingCredential | MetadataError::Auth(_) => {
                (http::StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
            }
            MetadataError::Forbidden => {
                (http::StatusCode::FORBIDDEN, "Forbidden").into_response()
            }
            MetadataError::Metadata(message) => {
                tracing::error!(error = %message, "metadata lookup failed");
                (
                    http::StatusCode::INTERNAL_SERVER_ERROR,
                    "Unexpected error".to_string(),
                )
                    .into_response()
            }
        }
    }
}

#[cfg(test)]
mod test {
    use common::metadata::MemoryMetadataProvider;

    use super::*;

    #[tokio::test]
    async fn test_resolve_dataset_direct_and_via_alias() {
        let meta = MemoryMetadataProvider::new();
        meta.add_alias("EGAD-REF-1", "D1");
        let authorized: HashSet<String> = ["D1".to_string()].into();

        assert_eq!(
            resolve_dataset(&meta, &authorized, "D1").await.unwrap(),
            "D1"
        );
        assert_eq!(
            resolve_dataset(&meta, &authorized, "EGAD-REF-1").await.unwrap(),
            "D1"
        );
    }

    #[tokio::test]
    async fn test_resolve_dataset_denies_unauthorized() {
        let meta = MemoryMetadataProvider::new();
        meta.add_alias("EGAD-REF-2", "D2");
        let authorized: HashSet<String> = ["D1".to_string()].into();

        // unknown id, and an alias pointing at a dataset without a visa
        assert!(matches!(
            resolve_dataset(&meta, &authorized, "D2").await,
            Err(MetadataError::Forbidden)
        ));
        assert!(matches!(
            resolve_dataset(&meta, &authorized, "EGAD-REF-2").await,
            Err(MetadataError::Forbidden)
        ));
    }
}
