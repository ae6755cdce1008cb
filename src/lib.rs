//! kirimwa: an HTTP bridge over one multi-device messaging session.
//!
//! The process owns a single protocol client. `GET /scan` pairs it by QR
//! code, `POST /api/kirim` sends text through it and `POST /api/keluarwa`
//! logs it out. See [`session::SessionManager`] for the lifecycle.

pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod pairing;
pub mod session;
pub mod store;

pub use error::{Error, Result};
