//! Coordinator HTTP Routes
//!
//! `GET /key`, `POST /login`, and the long-poll `POST /poll`. Bodies are
//! read raw and decoded by hand so malformed JSON maps to a plain 400.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use meshlink_types::api::{ControlKey, LoginRequest, PollRequest};
use tracing::debug;

use crate::coordinator::Coordinator;
use crate::error::ControlError;
use crate::store::StoreError;

/// Router for the coordinator endpoints
pub fn router(coordinator: Arc<Coordinator>) -> Router {
    Router::new()
        .route("/key", get(handle_control_key))
        .route("/login", post(handle_login))
        .route("/poll", post(handle_poll))
        .with_state(coordinator)
}

impl IntoResponse for ControlError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::NoAddresses | Self::Store(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, self.to_string()).into_response()
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(body: &[u8]) -> Result<T, ControlError> {
    serde_json::from_slice(body).map_err(|err| ControlError::BadRequest(err.to_string()))
}

async fn handle_control_key(State(coordinator): State<Arc<Coordinator>>) -> Json<ControlKey> {
    Json(ControlKey {
        control_key: coordinator.public_key(),
    })
}

async fn handle_login(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> Result<Response, ControlError> {
    let req: LoginRequest = decode_body(&body)?;
    let resp = coordinator.login(req).await?;
    Ok(Json(resp).into_response())
}

async fn handle_poll(
    State(coordinator): State<Arc<Coordinator>>,
    body: Bytes,
) -> Result<Response, ControlError> {
    let req: PollRequest = decode_body(&body)?;

    let node = match coordinator.node_by_key(&req.node_key).await {
        Ok(node) => node,
        Err(ControlError::Store(StoreError::NotFound)) | Err(ControlError::NotFound) => {
            return Err(ControlError::NotFound)
        }
        Err(err) => return Err(err),
    };
    if node.is_expired() {
        return Err(ControlError::Unauthorized("node key is expired"));
    }

    let signal = coordinator.subscribe(node.id);

    tokio::select! {
        _ = signal.notified() => {
            let snapshot = coordinator.poll_snapshot(&node).await?;
            debug!(id = node.id, peers = snapshot.peers.len(), "poll woke with update");
            Ok(Json(snapshot).into_response())
        }
        _ = tokio::time::sleep(coordinator.poll_timeout()) => {
            Ok(StatusCode::REQUEST_TIMEOUT.into_response())
        }
    }
}
