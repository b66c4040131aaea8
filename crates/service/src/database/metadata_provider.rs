use std::collections::HashSet;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;

use common::metadata::{ArchivedFile, DatasetAlias, DatasetEvent, MetadataProvider};

use super::Database;

#[derive(Debug, FromRow)]
struct FileRow {
    file_id: String,
    file_path: String,
    display_name: String,
    file_size: Option<i64>,
    checksum: Option<String>,
    checksum_type: Option<String>,
    decrypted_size: Option<i64>,
    decrypted_checksum: Option<String>,
    decrypted_checksum_type: Option<String>,
    status: String,
    header: String,
}

impl From<FileRow> for ArchivedFile {
    fn from(row: FileRow) -> Self {
        ArchivedFile {
            file_id: row.file_id,
            file_path: row.file_path,
            display_name: row.display_name,
            file_size: row.file_size,
            checksum: row.checksum,
            checksum_type: row.checksum_type,
            decrypted_size: row.decrypted_size,
            decrypted_checksum: row.decrypted_checksum,
            decrypted_checksum_type: row.decrypted_checksum_type,
            status: row.status,
            header: row.header,
        }
    }
}

#[derive(Debug, FromRow)]
struct EventRow {
    dataset_id: String,
    event: String,
    event_date: DateTime<Utc>,
}

const FILE_COLUMNS: &str = "file_id, file_path, display_name, file_size, checksum, \
     checksum_type, decrypted_size, decrypted_checksum, decrypted_checksum_type, \
     status, header";

#[async_trait]
impl MetadataProvider for Database {
    type Error = sqlx::Error;

    async fn file(&self, file_id: &str) -> Result<Option<ArchivedFile>, Self::Error> {
        let row = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {} FROM files WHERE file_id = $1",
            FILE_COLUMNS
        ))
        .bind(file_id)
        .fetch_optional(&**self)
        .await?;
        Ok(row.map(Into::into))
    }

    async fn datasets_for_file(&self, file_id: &str) -> Result<Vec<String>, Self::Error> {
        sqlx::query_scalar::<_, String>(
            "SELECT dataset_id FROM file_datasets WHERE file_id = $1",
        )
        .bind(file_id)
        .fetch_all(&**self)
        .await
    }

    async fn files_in_dataset(&self, dataset_id: &str) -> Result<Vec<ArchivedFile>, Self::Error> {
        let rows = sqlx::query_as::<_, FileRow>(&format!(
            "SELECT {} FROM files \
             WHERE file_id IN (SELECT file_id FROM file_datasets WHERE dataset_id = $1) \
             ORDER BY file_id",
            FILE_COLUMNS
        ))
        .bind(dataset_id)
        .fetch_all(&**self)
        .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    async fn known_datasets(
        &self,
        dataset_ids: &HashSet<String>,
    ) -> Result<Vec<String>, Self::Error> {
        let ids: Vec<String> = dataset_ids.iter().cloned().collect();
        sqlx::query_scalar::<_, String>(
            "SELECT DISTINCT dataset_id FROM file_datasets \
             WHERE dataset_id = ANY($1) ORDER BY dataset_id",
        )
        .bind(ids)
        .fetch_all(&**self)
        .await
    }

    async fn latest_event(&self, dataset_id: &str) -> Result<Option<DatasetEvent>, Self::Error> {
        let row = sqlx::query_as::<_, EventRow>(
            "SELECT dataset_id, event, event_date FROM dataset_event_log \
             WHERE dataset_id = $1 ORDER BY event_date DESC LIMIT 1",
        )
        .bind(dataset_id)
        .fetch_optional(&**self)
        .await?;
        Ok(row.map(|row| DatasetEvent {
            dataset_id: row.dataset_id,
            event: row.event,
            event_date: row.event_date,
        }))
    }

    async fn dataset_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<DatasetAlias>, Self::Error> {
        let dataset_id = sqlx::query_scalar::<_, String>(
            "SELECT dataset_id FROM dataset_references WHERE reference_id = $1",
        )
        .bind(reference_id)
        .fetch_optional(&**self)
        .await?;
        Ok(dataset_id.map(|dataset_id| DatasetAlias {
            reference_id: reference_id.to_string(),
            dataset_id,
        }))
    }
}
