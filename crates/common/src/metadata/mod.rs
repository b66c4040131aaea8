//! Archive metadata model
//!
//! The metadata store itself (Postgres in production) lives behind the
//! [`MetadataProvider`] trait; the service crate implements it with sqlx
//! and tests use the in-memory provider here. Everything in the store is
//! read-only from the data-out path's perspective.

mod memory;
mod provider;

pub use memory::{MemoryMetadataError, MemoryMetadataProvider};
pub use provider::{
    ArchivedFile, DatasetAlias, DatasetEvent, MetadataProvider, RELEASE_EVENT,
};
