//! Route handlers.

use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use super::envelope::{Envelope, plain_error};
use super::page;
use crate::dispatch::MessageDispatcher;
use crate::error::SessionError;
use crate::session::{Ensured, SessionManager, SessionStatus};
use crate::store::DeviceStore;

const LOGOUT_SUCCESS: &str = "Successfully logged out and session deleted.";

/// Shared state for all routes.
#[derive(Clone)]
pub struct AppState {
    pub sessions: SessionManager,
    pub dispatcher: MessageDispatcher,
    pub store: Arc<dyn DeviceStore>,
}

/// Body of `POST /api/kirim`.
///
/// Missing fields default to empty so they fail validation rather than
/// parsing.
#[derive(Debug, Deserialize)]
pub struct SendTextRequest {
    #[serde(default)]
    pub mobile_no: String,
    #[serde(default)]
    pub text_message: String,
}

/// GET /scan
pub async fn scan(State(state): State<AppState>) -> Response {
    match state.sessions.ensure_session().await {
        Ok(Ensured::Created {
            session,
            pairing: Some(artifact),
        }) => {
            tracing::info!(session_id = %session.id(), "Serving pairing code");
            Html(page::render_scanner(&artifact.data_uri())).into_response()
        }
        Ok(ensured) => {
            tracing::info!(
                session_id = %ensured.session().id(),
                state = %ensured.session().state(),
                "Scan requested while a session is active"
            );
            plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                &SessionError::AlreadySessioned.to_string(),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to start pairing");
            plain_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to generate QR code",
            )
        }
    }
}

/// POST /api/kirim
pub async fn send_text(State(state): State<AppState>, body: Bytes) -> Response {
    let request: SendTextRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(e) => {
            tracing::debug!(error = %e, "Rejected malformed send request");
            return plain_error(StatusCode::BAD_REQUEST, "Invalid JSON");
        }
    };

    match state
        .dispatcher
        .send_to_phone(&request.mobile_no, &request.text_message)
        .await
    {
        Ok(receipt) => Json(Envelope::success(receipt)).into_response(),
        Err(SessionError::NotConnected) => plain_error(
            StatusCode::INTERNAL_SERVER_ERROR,
            &SessionError::NotConnected.to_string(),
        ),
        Err(e @ SessionError::InvalidMessage(_)) => {
            (StatusCode::BAD_REQUEST, Json(Envelope::error(e.to_string()))).into_response()
        }
        Err(e) => Json(Envelope::error(e.to_string())).into_response(),
    }
}

/// POST /api/keluarwa
pub async fn logout(State(state): State<AppState>) -> Response {
    match state.sessions.terminate().await {
        Ok(()) => Json(Envelope::success_message(LOGOUT_SUCCESS)).into_response(),
        Err(SessionError::NoActiveSession) => plain_error(
            StatusCode::BAD_REQUEST,
            &SessionError::NoActiveSession.to_string(),
        ),
        Err(e) => {
            tracing::warn!(error = %e, "Logout request failed");
            Json(Envelope::error(e.to_string())).into_response()
        }
    }
}

/// GET /api/status
pub async fn status(State(state): State<AppState>) -> Json<Envelope<SessionStatus>> {
    Json(Envelope::success(state.sessions.status()))
}

/// GET /healthz
pub async fn healthz(State(state): State<AppState>) -> Response {
    match state.store.health_check().await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            tracing::warn!(error = %e, "Device store health check failed");
            plain_error(StatusCode::SERVICE_UNAVAILABLE, "device store unavailable")
        }
    }
}
