//! Synchronous streaming orchestrator
//!
//! Ties the permission gate, the archive reader and the container codec
//! together into one output stream per request. The ciphertext body is
//! never re-encrypted: plaintext output decrypts it on the fly, crypt4gh
//! output swaps the header and copies the body through untouched.

use std::collections::HashSet;
use std::str::FromStr;

use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use tokio_util::io::ReaderStream;

use common::crypt4gh::{
    decrypt_body, BodyError, ByteRange, Header, HeaderError, PublicKey, SecretKey,
};
use common::metadata::MetadataProvider;

use crate::storage::{ArchiveStore, StorageError};

/// Errors raised while putting a file stream together
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error("access denied")]
    Forbidden,
    #[error("recipient public key required for crypt4gh output")]
    MissingRecipientKey,
    #[error("unknown destination format: {0}")]
    UnknownFormat(String),
    #[error("stored header is not valid hex: {0}")]
    HeaderEncoding(#[from] hex::FromHexError),
    #[error("container header error: {0}")]
    Header(#[from] HeaderError),
    #[error("invalid byte range: {0}")]
    Range(#[from] BodyError),
    #[error("metadata store error: {0}")]
    Metadata(String),
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Output shape of a download: plaintext or a re-encrypted container
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DestinationFormat {
    #[default]
    Plain,
    Crypt4gh,
}

impl FromStr for DestinationFormat {
    type Err = StreamError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.eq_ignore_ascii_case("plain") {
            Ok(DestinationFormat::Plain)
        } else if s.eq_ignore_ascii_case("crypt4gh") {
            Ok(DestinationFormat::Crypt4gh)
        } else {
            Err(StreamError::UnknownFormat(s.to_string()))
        }
    }
}

/// One assembled response stream plus the name to serve it under
pub struct FileStream {
    pub filename: String,
    pub format: DestinationFormat,
    pub bytes: BoxStream<'static, Result<Bytes, BodyError>>,
}

impl std::fmt::Debug for FileStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileStream")
            .field("filename", &self.filename)
            .field("format", &self.format)
            .field("bytes", &"<stream>")
            .finish()
    }
}

/// Assemble the output stream for one authorized download
///
/// The authorized dataset set is passed in explicitly — authorization has
/// already happened and no ambient request state is consulted. Unknown
/// files deny access the same way unpermitted ones do, so the response
/// never leaks whether a file exists.
pub async fn stream<M: MetadataProvider>(
    meta: &M,
    archive: &ArchiveStore,
    server_key: &SecretKey,
    authorized: &HashSet<String>,
    file_id: &str,
    recipient: Option<&PublicKey>,
    format: DestinationFormat,
    range: Option<ByteRange>,
) -> Result<FileStream, StreamError> {
    let permitted = meta
        .can_access(file_id, authorized)
        .await
        .map_err(|e| StreamError::Metadata(e.to_string()))?;
    if !permitted {
        tracing::info!(file_id, "user has no permission for the requested file");
        return Err(StreamError::Forbidden);
    }
    tracing::info!(file_id, "user has permission for the requested file");

    let file = meta
        .file(file_id)
        .await
        .map_err(|e| StreamError::Metadata(e.to_string()))?
        .ok_or_else(|| {
            tracing::warn!(file_id, "file is linked to a dataset but missing from the store");
            StreamError::Forbidden
        })?;

    let header_bytes = hex::decode(&file.header)?;
    let header = Header::parse(&header_bytes)?;
    let body = archive.open(&file.file_path).await?;

    match format {
        DestinationFormat::Crypt4gh => {
            let recipient = recipient.ok_or(StreamError::MissingRecipientKey)?;
            let mut resealed = header.reseal(server_key, recipient)?;
            if let Some(range) = range {
                resealed.append_edit_list(range.edit_lengths(), server_key, recipient)?;
            }
            let header_bytes = resealed.serialize();
            let bytes = futures::stream::once(async move {
                Ok::<_, BodyError>(Bytes::from(header_bytes))
            })
            .chain(ReaderStream::new(body).map(|chunk| chunk.map_err(BodyError::Io)))
            .boxed();
            Ok(FileStream {
                filename: file.display_name,
                format,
                bytes,
            })
        }
        DestinationFormat::Plain => {
            let material = header.unseal(server_key)?;
            let bytes = decrypt_body(body, material, range).boxed();
            Ok(FileStream {
                filename: file.display_name,
                format,
                bytes,
            })
        }
    }
}
