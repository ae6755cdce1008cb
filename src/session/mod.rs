//! Session lifecycle.
//!
//! One process owns at most one [`Session`]: a connected protocol client for
//! the stored device identity. [`SessionManager`] creates, publishes and
//! tears it down; [`SessionTerminator`] performs the logout.
//!
//! ```text
//!   Unpaired ──ensure (unpaired identity)──▶ Pairing ──code scanned──▶ Connected
//!      ▲   └──────ensure (paired identity, connect ok)──────────────────▲  │
//!      │                                                                   ▼
//!      └─────────────── terminate / logged out / pairing abandoned ◀── Disconnected
//! ```

mod manager;
mod terminator;

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::client::{Jid, ProtocolClient};
use crate::store::DeviceIdentity;

pub use manager::{Ensured, SessionManager};
pub use terminator::SessionTerminator;

/// Lifecycle state of the process-wide session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Unpaired,
    Pairing,
    Connected,
    Disconnected,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionState::Unpaired => write!(f, "unpaired"),
            SessionState::Pairing => write!(f, "pairing"),
            SessionState::Connected => write!(f, "connected"),
            SessionState::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Point-in-time view of the session, safe to serialize.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub state: SessionState,
    pub session_id: Option<Uuid>,
    pub device_id: Option<Uuid>,
    pub jid: Option<Jid>,
    pub started_at: Option<DateTime<Utc>>,
}

impl SessionStatus {
    pub fn unpaired() -> Self {
        Self {
            state: SessionState::Unpaired,
            session_id: None,
            device_id: None,
            jid: None,
            started_at: None,
        }
    }
}

/// The live handle around a connected protocol client.
///
/// Only [`SessionManager`] creates sessions, and only publishes them once
/// fully built.
pub struct Session {
    id: Uuid,
    device_id: Uuid,
    client: Arc<dyn ProtocolClient>,
    state: watch::Sender<SessionState>,
    jid: Mutex<Option<Jid>>,
    started_at: DateTime<Utc>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Session {
    pub(crate) fn new(
        client: Arc<dyn ProtocolClient>,
        device: &DeviceIdentity,
        state: SessionState,
    ) -> Self {
        let (state, _) = watch::channel(state);
        Self {
            id: Uuid::new_v4(),
            device_id: device.id,
            client,
            state,
            jid: Mutex::new(device.jid.clone()),
            started_at: Utc::now(),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn device_id(&self) -> Uuid {
        self.device_id
    }

    pub fn client(&self) -> &Arc<dyn ProtocolClient> {
        &self.client
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Connected
    }

    /// Watch state changes, e.g. to wait for a scan to complete.
    pub fn watch_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    /// Address the device is linked to, once paired.
    pub fn jid(&self) -> Option<Jid> {
        self.jid.lock().ok().and_then(|jid| jid.clone())
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state(),
            session_id: Some(self.id),
            device_id: Some(self.device_id),
            jid: self.jid(),
            started_at: Some(self.started_at),
        }
    }

    pub(crate) fn set_state(&self, next: SessionState) {
        let previous = self.state.send_replace(next);
        if previous != next {
            tracing::info!(session_id = %self.id, from = %previous, to = %next, "Session state changed");
        }
    }

    /// Record a completed scan. Returns `false` if the link was already known.
    pub(crate) fn mark_paired(&self, jid: Jid) -> bool {
        let newly_paired = match self.jid.lock() {
            Ok(mut slot) if slot.as_ref() != Some(&jid) => {
                *slot = Some(jid);
                true
            }
            _ => false,
        };
        self.set_state(SessionState::Connected);
        newly_paired
    }

    pub(crate) fn attach_task(&self, handle: JoinHandle<()>) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.retain(|t| !t.is_finished());
            tasks.push(handle);
        }
    }

    pub(crate) fn abort_tasks(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for task in tasks.drain(..) {
                task.abort();
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("device_id", &self.device_id)
            .field("state", &self.state())
            .field("started_at", &self.started_at)
            .finish()
    }
}
