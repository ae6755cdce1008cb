//! Outbound message dispatch.

use std::time::Duration;

use crate::client::{Jid, SendReceipt};
use crate::error::SessionError;
use crate::session::SessionManager;

/// A validated text message, ready to send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub target: Jid,
    pub body: String,
}

impl OutboundMessage {
    pub fn new(target: Jid, body: impl Into<String>) -> Result<Self, SessionError> {
        let body = body.into();
        if target.user.is_empty() || target.server.is_empty() {
            return Err(SessionError::InvalidMessage(format!(
                "target address {} is incomplete",
                target
            )));
        }
        if body.trim().is_empty() {
            return Err(SessionError::InvalidMessage(
                "text_message must not be empty".to_string(),
            ));
        }
        Ok(Self { target, body })
    }

    /// Address a phone number on `server`.
    pub fn to_phone(
        mobile_no: &str,
        body: impl Into<String>,
        server: &str,
    ) -> Result<Self, SessionError> {
        let target = Jid::from_phone(mobile_no, server)
            .map_err(|e| SessionError::InvalidMessage(e.to_string()))?;
        Self::new(target, body)
    }
}

/// Sends messages through the active session.
///
/// One attempt per call; retrying is the caller's decision.
#[derive(Clone)]
pub struct MessageDispatcher {
    sessions: SessionManager,
    address_domain: String,
    send_timeout: Duration,
}

impl MessageDispatcher {
    pub fn new(
        sessions: SessionManager,
        address_domain: impl Into<String>,
        send_timeout: Duration,
    ) -> Self {
        Self {
            sessions,
            address_domain: address_domain.into(),
            send_timeout,
        }
    }

    /// Validate and send a text to a phone number.
    pub async fn send_to_phone(
        &self,
        mobile_no: &str,
        body: &str,
    ) -> Result<SendReceipt, SessionError> {
        let message = OutboundMessage::to_phone(mobile_no, body, &self.address_domain)?;
        self.send(&message).await
    }

    pub async fn send(&self, message: &OutboundMessage) -> Result<SendReceipt, SessionError> {
        let session = self
            .sessions
            .current_session()
            .map_err(|_| SessionError::NotConnected)?;
        if !session.is_connected() {
            return Err(SessionError::NotConnected);
        }

        let sent = tokio::time::timeout(
            self.send_timeout,
            session.client().send_text(&message.target, &message.body),
        )
        .await;

        match sent {
            Ok(Ok(receipt)) => {
                tracing::info!(
                    session_id = %session.id(),
                    to = %message.target,
                    message_id = %receipt.id,
                    "Message sent"
                );
                Ok(receipt)
            }
            Ok(Err(e)) => {
                tracing::warn!(to = %message.target, error = %e, "Message send failed");
                Err(SessionError::SendFailure(e.to_string()))
            }
            Err(_) => {
                tracing::warn!(
                    to = %message.target,
                    timeout = ?self.send_timeout,
                    "Message send timed out"
                );
                Err(SessionError::SendFailure(format!(
                    "send timed out after {:?}",
                    self.send_timeout
                )))
            }
        }
    }
}
