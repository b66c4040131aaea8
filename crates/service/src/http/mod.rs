//! HTTP surface served by the gateway binary

mod files;
mod health;
mod metadata;

use axum::routing::get;
use axum::Router;
use http::header::{ACCEPT, AUTHORIZATION, ORIGIN};
use http::Method;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ServiceState;

/// Header carrying the requester's base64-encoded PEM public key
pub const PUBLIC_KEY_HEADER: &str = "public-key";

pub fn router(state: ServiceState) -> Router {
    let cors_layer = CorsLayer::new()
        .allow_methods(vec![Method::GET])
        .allow_headers(vec![
            ACCEPT,
            AUTHORIZATION,
            ORIGIN,
            http::HeaderName::from_static(PUBLIC_KEY_HEADER),
        ])
        .allow_origin(Any)
        .allow_credentials(false);

    Router::new()
        .route("/files/:file_id", get(files::handler))
        .route("/metadata/datasets", get(metadata::datasets))
        .route("/metadata/datasets/:dataset_id/files", get(metadata::files))
        .route("/_status/healthz", get(health::handler))
        .with_state(state)
        .layer(cors_layer)
        .layer(TraceLayer::new_for_http())
}
