use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::provider::{ArchivedFile, DatasetAlias, DatasetEvent, MetadataProvider};

/// In-memory metadata provider backed by HashMaps, for tests
#[derive(Debug, Clone, Default)]
pub struct MemoryMetadataProvider {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Debug, Default)]
struct Inner {
    files: HashMap<String, ArchivedFile>,
    /// (file_id, dataset_id) membership pairs
    memberships: Vec<(String, String)>,
    /// lifecycle log, append-only
    events: Vec<DatasetEvent>,
    aliases: HashMap<String, String>,
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MemoryMetadataError {
    #[error("memory provider error: {0}")]
    Internal(String),
}

impl MemoryMetadataProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_file(&self, file: ArchivedFile) {
        let mut inner = self.inner.write().expect("metadata lock poisoned");
        inner.files.insert(file.file_id.clone(), file);
    }

    pub fn link(&self, file_id: &str, dataset_id: &str) {
        let mut inner = self.inner.write().expect("metadata lock poisoned");
        inner
            .memberships
            .push((file_id.to_string(), dataset_id.to_string()));
    }

    pub fn push_event(&self, event: DatasetEvent) {
        let mut inner = self.inner.write().expect("metadata lock poisoned");
        inner.events.push(event);
    }

    pub fn add_alias(&self, reference_id: &str, dataset_id: &str) {
        let mut inner = self.inner.write().expect("metadata lock poisoned");
        inner
            .aliases
            .insert(reference_id.to_string(), dataset_id.to_string());
    }
}

#[async_trait]
impl MetadataProvider for MemoryMetadataProvider {
    type Error = MemoryMetadataError;

    async fn file(&self, file_id: &str) -> Result<Option<ArchivedFile>, Self::Error> {
        let inner = self.read()?;
        Ok(inner.files.get(file_id).cloned())
    }

    async fn datasets_for_file(&self, file_id: &str) -> Result<Vec<String>, Self::Error> {
        let inner = self.read()?;
        Ok(inner
            .memberships
            .iter()
            .filter(|(file, _)| file == file_id)
            .map(|(_, dataset)| dataset.clone())
            .collect())
    }

    async fn files_in_dataset(&self, dataset_id: &str) -> Result<Vec<ArchivedFile>, Self::Error> {
        let inner = self.read()?;
        Ok(inner
            .memberships
            .iter()
            .filter(|(_, dataset)| dataset == dataset_id)
            .filter_map(|(file, _)| inner.files.get(file).cloned())
            .collect())
    }

    async fn known_datasets(
        &self,
        dataset_ids: &HashSet<String>,
    ) -> Result<Vec<String>, Self::Error> {
        let inner = self.read()?;
        let mut known: Vec<String> = inner
            .memberships
            .iter()
            .map(|(_, dataset)| dataset.clone())
            .filter(|dataset| dataset_ids.contains(dataset))
            .collect();
        known.sort();
        known.dedup();
        Ok(known)
    }

    async fn latest_event(&self, dataset_id: &str) -> Result<Option<DatasetEvent>, Self::Error> {
        let inner = self.read()?;
        Ok(inner
            .events
            .iter()
            .filter(|event| event.dataset_id == dataset_id)
            .max_by_key(|event| event.event_date)
            .cloned())
    }

    async fn dataset_by_reference(
        &self,
        reference_id: &str,
    ) -> Result<Option<DatasetAlias>, Self::Error> {
        let inner = self.read()?;
        Ok(inner.aliases.get(reference_id).map(|dataset_id| DatasetAlias {
            reference_id: reference_id.to_string(),
            dataset_id: dataset_id.clone(),
        }))
    }
}

impl MemoryMetadataProvider {
    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, MemoryMetadataError> {
        self.inner
            .read()
            .map_err(|e| MemoryMetadataError::Internal(format!("lock poisoned: {}", e)))
    }
}
