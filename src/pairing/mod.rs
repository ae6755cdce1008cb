//! Device pairing through one-time codes.
//!
//! [`PairingFlow::begin`] turns the client's pairing event stream into a
//! single rendered code. The connection attempt keeps running after the
//! code is returned; [`PendingPairing::watch`] drains the rest of the
//! stream so the caller learns when the attempt was abandoned.

mod render;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::client::{Jid, PairingEvent, ProtocolClient};
use crate::error::SessionError;

pub use render::{CodeRenderer, PNG_DATA_URI_PREFIX, PairingArtifact, QrPngRenderer};

/// How a pairing attempt ended after its first code was handed out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingResolution {
    /// The code was scanned.
    Paired { jid: Jid },
    /// No scan happened: codes expired, the protocol refused, or the stream dropped.
    Abandoned { reason: String },
}

/// A pairing attempt that produced its first code.
#[derive(Debug)]
pub struct PendingPairing {
    pub artifact: PairingArtifact,
    events: mpsc::Receiver<PairingEvent>,
}

impl PendingPairing {
    /// Consume the remaining events until the attempt resolves.
    ///
    /// Later codes are not rendered; the operator reloads the page for a
    /// fresh one.
    pub async fn watch(mut self) -> PairingResolution {
        while let Some(event) = self.events.recv().await {
            match event {
                PairingEvent::Code { expires_in, .. } => {
                    tracing::debug!(expires_in = ?expires_in, "Pairing code rotated");
                }
                PairingEvent::Success { jid } => {
                    tracing::info!(jid = %jid, "Pairing code scanned");
                    return PairingResolution::Paired { jid };
                }
                PairingEvent::Timeout => {
                    return PairingResolution::Abandoned {
                        reason: "pairing codes expired".to_string(),
                    };
                }
                PairingEvent::Error { reason } => {
                    return PairingResolution::Abandoned { reason };
                }
            }
        }
        PairingResolution::Abandoned {
            reason: "pairing stream closed".to_string(),
        }
    }
}

/// Drives the one-time code exchange for one client.
#[derive(Clone)]
pub struct PairingFlow {
    renderer: Arc<dyn CodeRenderer>,
    timeout: Duration,
}

impl PairingFlow {
    pub fn new(renderer: Arc<dyn CodeRenderer>, timeout: Duration) -> Self {
        Self { renderer, timeout }
    }

    /// Start pairing and wait, at most `timeout`, for the first code.
    ///
    /// On failure the client may still hold an open transport; the caller
    /// disconnects it.
    pub async fn begin(
        &self,
        client: &Arc<dyn ProtocolClient>,
    ) -> Result<PendingPairing, SessionError> {
        let deadline = Instant::now() + self.timeout;

        let mut events = client
            .pairing_events()
            .await
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        tokio::time::timeout_at(deadline, client.connect())
            .await
            .map_err(|_| SessionError::PairingTimeout {
                timeout: self.timeout,
            })?
            .map_err(|e| SessionError::ConnectFailed(e.to_string()))?;

        loop {
            let next = tokio::time::timeout_at(deadline, events.recv())
                .await
                .map_err(|_| SessionError::PairingTimeout {
                    timeout: self.timeout,
                })?;

            match next {
                Some(PairingEvent::Code { code, expires_in }) => {
                    tracing::info!(expires_in = ?expires_in, "Pairing code generated");
                    let artifact = self.renderer.render(&code)?;
                    return Ok(PendingPairing { artifact, events });
                }
                Some(other) => {
                    tracing::info!(event = other.kind(), "Login event");
                }
                None => return Err(SessionError::PairingStreamClosed),
            }
        }
    }
}
