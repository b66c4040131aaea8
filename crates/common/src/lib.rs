//! Core domain for the LEGA data-out services
//!
//! This crate holds everything that is independent of any particular
//! transport or storage backend:
//!
//! - **Container codec**: parsing, re-keying and streaming decryption of
//!   Crypt4GH encrypted containers ([`crypt4gh`])
//! - **Metadata model**: archived files, dataset memberships, lifecycle
//!   events and the provider trait the service layer implements
//!   ([`metadata`])

pub mod crypt4gh;
pub mod metadata;

pub mod prelude {
    pub use crate::crypt4gh::{
        BodyError, ByteRange, Header, HeaderError, KeyError, PublicKey, SecretKey,
        SessionMaterial,
    };
    pub use crate::metadata::{ArchivedFile, DatasetAlias, DatasetEvent, MetadataProvider};
}
