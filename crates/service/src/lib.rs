//! Service layer shared by the LEGA data-out binaries
//!
//! Composes the pieces of the data-out pipeline:
//!
//! - [`auth`] — GA4GH visa authorization from bearer credentials
//! - [`database`] — Postgres metadata provider
//! - [`storage`] — archive reader and outbox writer backends
//! - [`streaming`] — the synchronous per-request orchestrator
//! - [`export`] — the asynchronous bulk-export orchestrator
//! - [`http`] — the axum surface served by the gateway binary

pub mod auth;
pub mod config;
pub mod database;
pub mod export;
pub mod http;
pub mod state;
pub mod storage;
pub mod streaming;

pub use config::Config;
pub use state::ServiceState;
