use std::sync::Arc;

use common::crypt4gh::{KeyError, SecretKey};

use crate::auth::{AuthError, TrustMaterial, VisaAuthorizer};
use crate::config::Config;
use crate::database::{Database, DatabaseSetupError};
use crate::storage::{ArchiveStore, Outbox, StorageError, StorageKind};

/// Shared state of the data-out services
#[derive(Clone)]
pub struct ServiceState {
    inner: Arc<StateInner>,
}

struct StateInner {
    database: Database,
    authorizer: VisaAuthorizer,
    archive: ArchiveStore,
    outbox: Option<Outbox>,
    server_key: SecretKey,
}

impl ServiceState {
    pub async fn from_config(config: &Config) -> Result<Self, StateSetupError> {
        // 1. metadata store
        tracing::info!(url = %config.database_url, "connecting to metadata store");
        let database = Database::connect(&config.database_url).await?;

        // 2. server key, possibly passphrase-protected
        let pem = std::fs::read_to_string(&config.crypt4gh.private_key_path)
            .map_err(StateSetupError::KeyFile)?;
        let passphrase = match &config.crypt4gh.passphrase_path {
            Some(path) => Some(
                std::fs::read_to_string(path)
                    .map_err(StateSetupError::KeyFile)?
                    .trim_end()
                    .to_string(),
            ),
            None => None,
        };
        let server_key = SecretKey::from_pem(&pem, passphrase.as_deref())?;

        // 3. trust material for the visa authorizer
        let passport_pem = read_optional_pem(config.aai.passport_public_key_path.as_deref())?;
        let visa_pem = read_optional_pem(config.aai.visa_public_key_path.as_deref())?;
        let authorizer = VisaAuthorizer::new(TrustMaterial {
            passport_pem,
            visa_pem,
            userinfo_endpoint: config.aai.userinfo_endpoint_url.clone(),
            openid_configuration_url: config.aai.openid_configuration_url.clone(),
        })?;

        // 4. archive backends
        let archive = match &config.archive.s3 {
            Some(s3) => ArchiveStore::s3(s3, &config.archive.posix_root)?,
            None => ArchiveStore::posix(&config.archive.posix_root),
        };

        // 5. outbox, when the export path is enabled
        let outbox = match &config.outbox {
            Some(outbox_config) => Some(match outbox_config.kind {
                StorageKind::Posix => Outbox::posix(&outbox_config.posix_root),
                StorageKind::S3 => {
                    let s3 = outbox_config.s3.as_ref().ok_or_else(|| {
                        StateSetupError::Storage(StorageError::S3Config(
                            "outbox kind is S3 but no S3_OUT section is configured".to_string(),
                        ))
                    })?;
                    Outbox::s3(s3)?
                }
            }),
            None => None,
        };

        Ok(Self {
            inner: Arc::new(StateInner {
                database,
                authorizer,
                archive,
                outbox,
                server_key,
            }),
        })
    }

    pub fn database(&self) -> &Database {
        &self.inner.database
    }

    pub fn authorizer(&self) -> &VisaAuthorizer {
        &self.inner.authorizer
    }

    pub fn archive(&self) -> &ArchiveStore {
        &self.inner.archive
    }

    pub fn outbox(&self) -> Option<&Outbox> {
        self.inner.outbox.as_ref()
    }

    pub fn server_key(&self) -> &SecretKey {
        &self.inner.server_key
    }
}

fn read_optional_pem(path: Option<&std::path::Path>) -> Result<Option<String>, StateSetupError> {
    match path {
        Some(path) => match std::fs::read_to_string(path) {
            Ok(pem) => Ok(Some(pem)),
            // mirror the original behavior: an unreadable static key file
            // falls back to dynamic discovery rather than aborting startup
            Err(err) => {
                tracing::warn!(path = %path.display(), error = %err,
                    "trust material unreadable, falling back to dynamic key discovery");
                Ok(None)
            }
        },
        None => Ok(None),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StateSetupError {
    #[error("database setup error: {0}")]
    Database(#[from] DatabaseSetupError),
    #[error("cannot read key material: {0}")]
    KeyFile(std::io::Error),
    #[error("cannot parse server key: {0}")]
    Key(#[from] KeyError),
    #[error("cannot set up visa authorizer: {0}")]
    Auth(#[from] AuthError),
    #[error("storage setup error: {0}")]
    Storage(#[from] StorageError),
}
