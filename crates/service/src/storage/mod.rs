//! Archive and outbox storage backends
//!
//! The archive is a read-only byte source (POSIX directory or S3 bucket);
//! the outbox is a per-user write destination for exports. Both are pure
//! I/O adapters — path resolution is the only logic they carry.

use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use bytes::Bytes;
use futures::{Stream, StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, WriteMultipart};
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio_util::io::StreamReader;

/// Errors raised by the storage backends
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("unknown storage kind: {0}")]
    UnknownKind(String),
    #[error("incomplete S3 configuration: {0}")]
    S3Config(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("object store error: {0}")]
    Object(#[from] object_store::Error),
}

/// Closed set of storage backends; unknown configuration values fail fast
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    Posix,
    S3,
}

impl FromStr for StorageKind {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "POSIX" | "posix" => Ok(StorageKind::Posix),
            "S3" | "s3" => Ok(StorageKind::S3),
            other => Err(StorageError::UnknownKind(other.to_string())),
        }
    }
}

/// Credentials and location of one S3 bucket
#[derive(Debug, Clone)]
pub struct S3Config {
    pub endpoint: String,
    pub region: String,
    pub bucket: String,
    pub access_key: String,
    pub secret_key: String,
    /// Allow plain-http endpoints (local development stacks)
    pub allow_http: bool,
}

impl S3Config {
    fn build(&self) -> Result<Arc<dyn ObjectStore>, StorageError> {
        let store = AmazonS3Builder::new()
            .with_endpoint(&self.endpoint)
            .with_region(&self.region)
            .with_bucket_name(&self.bucket)
            .with_access_key_id(&self.access_key)
            .with_secret_access_key(&self.secret_key)
            .with_allow_http(self.allow_http)
            .build()
            .map_err(|e| StorageError::S3Config(e.to_string()))?;
        Ok(Arc::new(store))
    }
}

/// Read-only access to archived ciphertext bodies
///
/// Routes per file: stored paths that are all decimal digits are object
/// keys in the archive bucket, everything else is a filesystem path under
/// the archive root. Both backends can be live at once.
#[derive(Clone)]
pub struct ArchiveStore {
    posix_root: PathBuf,
    object: Option<Arc<dyn ObjectStore>>,
}

impl ArchiveStore {
    pub fn new(
        posix_root: impl Into<PathBuf>,
        object: Option<Arc<dyn ObjectStore>>,
    ) -> Self {
        Self {
            posix_root: posix_root.into(),
            object,
        }
    }

    pub fn posix(root: impl Into<PathBuf>) -> Self {
        Self::new(root, None)
    }

    pub fn s3(config: &S3Config, posix_root: impl Into<PathBuf>) -> Result<Self, StorageError> {
        Ok(Self::new(posix_root, Some(config.build()?)))
    }

    /// Back the archive with an arbitrary object store (tests)
    pub fn object(store: Arc<dyn ObjectStore>) -> Self {
        Self::new("/", Some(store))
    }

    /// Open the raw byte stream for a stored path
    pub async fn open(
        &self,
        file_path: &str,
    ) -> Result<Box<dyn AsyncRead + Send + Unpin>, StorageError> {
        if Self::is_object_key(file_path) {
            let store = self.object.as_ref().ok_or_else(|| {
                StorageError::S3Config("archive object store not configured".to_string())
            })?;
            let key = ObjectPath::from(file_path);
            let result = store.get(&key).await?;
            let reader = StreamReader::new(
                result
                    .into_stream()
                    .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e)),
            );
            Ok(Box::new(reader))
        } else {
            let path = resolve_posix_path(&self.posix_root, file_path);
            tracing::info!(path = %path.display(), "opening archive file");
            let file = tokio::fs::File::open(path).await?;
            Ok(Box::new(file))
        }
    }

    /// True when the stored path addresses an object key rather than a
    /// filesystem path
    pub fn is_object_key(file_path: &str) -> bool {
        !file_path.is_empty() && file_path.bytes().all(|b| b.is_ascii_digit())
    }
}

/// Join a stored path onto the archive root, collapsing double slashes; a
/// root of `/` passes the stored path through untouched
fn resolve_posix_path(root: &std::path::Path, file_path: &str) -> PathBuf {
    let root = root.to_string_lossy();
    let mut joined = if root == "/" {
        file_path.to_string()
    } else {
        format!("{}/{}", root, file_path)
    };
    while joined.contains("//") {
        joined = joined.replace("//", "/");
    }
    PathBuf::from(joined)
}

/// Outcome of one outbox write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboxWrite {
    Written { location: String },
    /// POSIX destinations that already exist are left alone
    Skipped { location: String },
}

/// Per-user write destination for export results
#[derive(Clone)]
pub struct Outbox {
    backend: OutboxBackend,
}

#[derive(Clone)]
enum OutboxBackend {
    Posix { root: PathBuf },
    Object { store: Arc<dyn ObjectStore> },
}

impl Outbox {
    pub fn posix(root: impl Into<PathBuf>) -> Self {
        Self {
            backend: OutboxBackend::Posix { root: root.into() },
        }
    }

    pub fn s3(config: &S3Config) -> Result<Self, StorageError> {
        Ok(Self {
            backend: OutboxBackend::Object {
                store: config.build()?,
            },
        })
    }

    /// Back the outbox with an arbitrary object store (tests)
    pub fn object(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            backend: OutboxBackend::Object { store },
        }
    }

    /// Stream `bytes` to the user's outbox location
    ///
    /// POSIX: writes `<root>/<user>/<filename>`, skipping with a warning
    /// when the destination already exists. Object store: uploads under
    /// `<user>/<filename>`, overwriting any existing object.
    pub async fn write<S, E>(
        &self,
        user: &str,
        filename: &str,
        bytes: S,
    ) -> Result<OutboxWrite, StorageError>
    where
        S: Stream<Item = Result<Bytes, E>> + Send + Unpin,
        E: std::error::Error + Send + Sync + 'static,
    {
        match &self.backend {
            OutboxBackend::Posix { root } => {
                let destination = root.join(user).join(filename);
                let location = destination.display().to_string();
                if tokio::fs::try_exists(&destination).await? {
                    tracing::warn!(%location, "file exists in the outbox already, skipping");
                    return Ok(OutboxWrite::Skipped { location });
                }
                if let Some(parent) = destination.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                let mut file = tokio::fs::File::create(&destination).await?;
                let mut bytes = bytes;
                while let Some(chunk) = bytes.next().await {
                    let chunk = chunk
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    file.write_all(&chunk).await?;
                }
                file.flush().await?;
                Ok(OutboxWrite::Written { location })
            }
            OutboxBackend::Object { store } => {
                let key = ObjectPath::from(format!("{}/{}", user, filename));
                let location = key.to_string();
                let upload = store.put_multipart(&key).await?;
                let mut writer = WriteMultipart::new(upload);
                let mut bytes = bytes;
                while let Some(chunk) = bytes.next().await {
                    let chunk = chunk
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    writer.write(&chunk);
                }
                writer.finish().await?;
                Ok(OutboxWrite::Written { location })
            }
        }
    }
}
