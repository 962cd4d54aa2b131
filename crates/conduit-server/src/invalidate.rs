use axum::Json;
use axum::extract::State;
use axum::response::{IntoResponse, Response};
use conduit_core::HttpError;
use conduit_gateway::Gateway;
use http::{HeaderMap, StatusCode};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

pub(crate) const SECRET_HEADER: &str = "x-internal-secret";

#[derive(Clone)]
pub struct InvalidateState {
    pub gateway: Gateway,
    pub internal_secret: SecretString,
}

#[derive(Deserialize)]
pub struct InvalidateBody {
    pub key: String,
}

#[derive(Serialize)]
struct InvalidateResponse {
    key: String,
    version: i64,
}

/// Purge a cache here and publish a version bump to every other instance
pub async fn invalidate_handler(
    State(state): State<InvalidateState>,
    headers: HeaderMap,
    Json(body): Json<InvalidateBody>,
) -> Response {
    let secret = headers.get(SECRET_HEADER).and_then(|v| v.to_str().ok());
    if secret != Some(state.internal_secret.expose_secret()) {
        return StatusCode::UNAUTHORIZED.into_response();
    }

    match state.gateway.invalidate(&body.key).await {
        Ok(version) => Json(InvalidateResponse {
            key: body.key.trim().to_owned(),
            version,
        })
        .into_response(),
        Err(e) => {
            tracing::warn!(key = %body.key, error = %e, "invalidation request failed");
            (e.status_code(), Json(e.to_body())).into_response()
        }
    }
}
