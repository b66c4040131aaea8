use axum::extract::State;
use axum::response::IntoResponse;

use crate::ServiceState;

/// Readiness probe: the service is healthy when the metadata store answers
pub async fn handler(State(state): State<ServiceState>) -> impl IntoResponse {
    match state.database().ping().await {
        Ok(()) => (http::StatusCode::OK, "ok"),
        Err(err) => {
            tracing::error!(error = %err, "metadata store unreachable");
            (http::StatusCode::SERVICE_UNAVAILABLE, "unavailable")
        }
    }
}
