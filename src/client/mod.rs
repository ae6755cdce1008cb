//! Messaging protocol client contract.
//!
//! The bridge never speaks the multi-device protocol itself. It drives a
//! [`ProtocolClient`] built for one device identity by a [`ClientFactory`].
//! [`RelayClient`] is the production implementation, talking to a protocol
//! relay over HTTP.

mod jid;
mod relay;
pub mod sse;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};

use crate::error::ClientError;
use crate::store::DeviceIdentity;

pub use jid::Jid;
pub use relay::{RelayClient, RelayClientFactory};

/// One event on the pairing code stream.
///
/// The stream is finite and cannot be restarted: it ends after `Success`,
/// `Timeout` or `Error`, or when the client drops it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// A fresh one-time code, valid for `expires_in`.
    Code { code: String, expires_in: Duration },
    /// The code was scanned and the device is now linked.
    Success { jid: Jid },
    /// Every code expired without being scanned.
    Timeout,
    /// The protocol refused the pairing attempt.
    Error { reason: String },
}

impl PairingEvent {
    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            PairingEvent::Code { .. } => "code",
            PairingEvent::Success { .. } => "success",
            PairingEvent::Timeout => "timeout",
            PairingEvent::Error { .. } => "error",
        }
    }
}

/// Lifecycle and inbound events delivered through [`ProtocolClient::subscribe`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    PairSuccess { jid: Jid },
    LoggedOut { reason: String },
    Disconnected,
    Message { from: Jid, text: String },
}

/// Provider acknowledgement for an outbound message.
///
/// Field names follow the provider's own response so the `data` member of
/// `/api/kirim` is passed through unchanged.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendReceipt {
    #[serde(rename = "ID")]
    pub id: String,
    #[serde(rename = "Timestamp")]
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "ServerID", default)]
    pub server_id: Option<i64>,
}

/// A live protocol client bound to one device identity.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Open the pairing code stream. Must be requested before [`connect`].
    ///
    /// [`connect`]: ProtocolClient::connect
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>, ClientError>;

    /// Open the transport. For an unpaired identity this starts emitting codes.
    async fn connect(&self) -> Result<(), ClientError>;

    /// Close the transport. Never fails; closing a closed client is a no-op.
    async fn disconnect(&self);

    /// Send a plain text message.
    async fn send_text(&self, to: &Jid, body: &str) -> Result<SendReceipt, ClientError>;

    /// Unlink the device on the protocol side.
    async fn logout(&self) -> Result<(), ClientError>;

    /// Subscribe to lifecycle and inbound events.
    fn subscribe(&self) -> broadcast::Receiver<ClientEvent>;
}

/// Builds protocol clients for device identities.
pub trait ClientFactory: Send + Sync {
    fn build(&self, device: &DeviceIdentity) -> Arc<dyn ProtocolClient>;
}
