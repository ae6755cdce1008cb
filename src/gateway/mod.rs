//! HTTP surface over the session manager.
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/scan` | pairing page with the QR code as a data URI |
//! | POST | `/api/kirim` | send a text message |
//! | POST | `/api/keluarwa` | log out and forget the device |
//! | GET | `/api/status` | session snapshot |
//! | GET | `/healthz` | device store probe |

mod envelope;
mod handlers;
mod page;
mod server;

use axum::Router;
use axum::routing::{get, post};
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

pub use envelope::{Envelope, Meta, Status, plain_error};
pub use handlers::{AppState, SendTextRequest};
pub use page::render_scanner;
pub use server::{GatewayConfig, GatewayServer};

/// Build the gateway router.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/scan", get(handlers::scan))
        .route("/api/kirim", post(handlers::send_text))
        .route("/api/keluarwa", post(handlers::logout))
        .route("/api/status", get(handlers::status))
        .route("/healthz", get(handlers::healthz))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}
