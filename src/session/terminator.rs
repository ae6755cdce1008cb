//! Logout and teardown of the active session.

use std::sync::Arc;
use std::time::Duration;

use super::{Session, SessionState};
use crate::error::SessionError;
use crate::store::DeviceStore;

/// Logs out of the protocol and releases the transport.
#[derive(Clone)]
pub struct SessionTerminator {
    store: Arc<dyn DeviceStore>,
    logout_timeout: Duration,
}

impl SessionTerminator {
    pub fn new(store: Arc<dyn DeviceStore>, logout_timeout: Duration) -> Self {
        Self {
            store,
            logout_timeout,
        }
    }

    /// Log out and disconnect.
    ///
    /// The transport is disconnected whatever the logout outcome; a logout
    /// failure is still reported. Persisted credentials are dropped only
    /// after a successful logout.
    pub async fn terminate(&self, session: Option<&Session>) -> Result<(), SessionError> {
        let session = session.ok_or(SessionError::NoActiveSession)?;

        let logout = match tokio::time::timeout(self.logout_timeout, session.client().logout()).await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(SessionError::LogoutFailure(e.to_string())),
            Err(_) => Err(SessionError::LogoutFailure(format!(
                "timed out after {:?}",
                self.logout_timeout
            ))),
        };

        session.client().disconnect().await;

        match logout {
            Ok(()) => {
                session.set_state(SessionState::Unpaired);
                if let Err(e) = self.store.invalidate(session.device_id()).await {
                    tracing::warn!(
                        device_id = %session.device_id(),
                        error = %e,
                        "Logged out but failed to drop stored credentials"
                    );
                }
                tracing::info!(session_id = %session.id(), "Logged out and session deleted");
                Ok(())
            }
            Err(e) => {
                session.set_state(SessionState::Disconnected);
                tracing::warn!(session_id = %session.id(), error = %e, "Logout failed, transport closed anyway");
                Err(e)
            }
        }
    }
}
