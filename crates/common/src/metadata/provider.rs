use std::collections::HashSet;
use std::fmt::{Debug, Display};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event kind marking a dataset as exportable
pub const RELEASE_EVENT: &str = "released";

/// A permanently encrypted file in the archive
///
/// Owned by the ingestion side; immutable and read-only here. `file_path`
/// is either a POSIX path under the archive root or an all-decimal object
/// key, and `header` is the hex-encoded Crypt4GH container header stored
/// out-of-band from the ciphertext body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArchivedFile {
    pub file_id: String,
    pub file_path: String,
    pub display_name: String,
    pub file_size: Option<i64>,
    pub checksum: Option<String>,
    pub checksum_type: Option<String>,
    pub decrypted_size: Option<i64>,
    pub decrypted_checksum: Option<String>,
    pub decrypted_checksum_type: Option<String>,
    pub status: String,
    pub header: String,
}

/// One entry of a dataset's append-only lifecycle log
///
/// The most recent event by timestamp decides whether the dataset is
/// released.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEvent {
    pub dataset_id: String,
    pub event: String,
    pub event_date: DateTime<Utc>,
}

impl DatasetEvent {
    pub fn is_release(&self) -> bool {
        self.event == RELEASE_EVENT
    }
}

/// Alternate lookup key mapping an external reference to a dataset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetAlias {
    pub reference_id: String,
    pub dataset_id: String,
}

/// Read-only view over the archive metadata store
#[async_trait]
pub trait MetadataProvider: Send + Sync + Clone + 'static {
    type Error: Display + Debug + Send + Sync;

    async fn file(&self, file_id: &str) -> Result<Option<ArchivedFile>, Self::Error>;

    /// Datasets the file belongs to (many-to-many memberships)
    async fn datasets_for_file(&self, file_id: &str) -> Result<Vec<String>, Self::Error>;

    async fn files_in_dataset(&self, dataset_id: &str) -> Result<Vec<ArchivedFile>, Self::Error>;

    /// The subset of `dataset_ids` that exists in the store
    async fn known_datasets(
        &self,
        dataset_ids: &HashSet<String>,
    ) -> Result<Vec<String>, Self::Error>;

    async fn latest_event(&self, dataset_id: &str) -> Result<Option<DatasetEvent>, Self::Error>;

    async fn dataset_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<DatasetAlias>, Self::Error>;

    /// True iff some dataset owning `file_id` is in the authorized set
    async fn can_access(
        &self,
        file_id: &str,
        authorized: &HashSet<String>,
    ) -> Result<bool, Self::Error> {
        let owners = self.datasets_for_file(file_id).await?;
        Ok(owners.iter().any(|dataset| authorized.contains(dataset)))
    }
}
