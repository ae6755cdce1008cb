//! Process-wide session state machine.
//!
//! All transitions go through one async mutex around a [`Slot`]. Creating
//! a session runs as a spawned task that commits its own outcome under the
//! lock, so an abandoned HTTP request cannot leave the slot half-updated,
//! and every caller that arrives mid-transition awaits the same outcome
//! instead of starting a second client. Teardown in
//! [`SessionManager::terminate`] is spawned the same way, holding the lock
//! until the slot is vacant.
//!
//! Readers never touch the slot: they read the last published session
//! from a `watch` channel, which only ever holds fully built sessions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::{Mutex, broadcast, watch};
use uuid::Uuid;

use super::{Session, SessionState, SessionStatus, SessionTerminator};
use crate::client::{ClientEvent, ClientFactory, Jid, ProtocolClient};
use crate::config::{ReconnectFallback, SessionConfig};
use crate::error::SessionError;
use crate::pairing::{PairingArtifact, PairingFlow, PairingResolution, PendingPairing};
use crate::store::{DeviceIdentity, DeviceStore};

type SharedTransition = Shared<BoxFuture<'static, Result<Transition, SessionError>>>;

enum Slot {
    Vacant,
    Transitioning {
        generation: u64,
        outcome: SharedTransition,
    },
    Occupied(Arc<Session>),
}

#[derive(Clone)]
struct Transition {
    session: Arc<Session>,
    pairing: Option<PairingArtifact>,
}

/// Everything a successful transition produced, before it is published.
struct Established {
    session: Arc<Session>,
    pending: Option<PendingPairing>,
    events: broadcast::Receiver<ClientEvent>,
}

/// Outcome of [`SessionManager::ensure_session`].
#[derive(Debug, Clone)]
pub enum Ensured {
    /// This call created the session. `pairing` holds the code to scan when
    /// the identity was not yet linked.
    Created {
        session: Arc<Session>,
        pairing: Option<PairingArtifact>,
    },
    /// Another caller was already creating the session; this call waited
    /// for it and got the same session.
    Joined { session: Arc<Session> },
    /// A session already existed.
    Existing { session: Arc<Session> },
}

impl Ensured {
    pub fn session(&self) -> &Arc<Session> {
        match self {
            Ensured::Created { session, .. }
            | Ensured::Joined { session }
            | Ensured::Existing { session } => session,
        }
    }
}

struct Inner {
    store: Arc<dyn DeviceStore>,
    factory: Arc<dyn ClientFactory>,
    pairing: PairingFlow,
    terminator: SessionTerminator,
    config: SessionConfig,
    slot: Arc<Mutex<Slot>>,
    published: watch::Sender<Option<Arc<Session>>>,
    generation: AtomicU64,
}

/// Owner of the single live protocol client.
///
/// Cheap to clone; all clones share the same slot.
#[derive(Clone)]
pub struct SessionManager {
    inner: Arc<Inner>,
}

impl SessionManager {
    pub fn new(
        store: Arc<dyn DeviceStore>,
        factory: Arc<dyn ClientFactory>,
        pairing: PairingFlow,
        config: SessionConfig,
    ) -> Self {
        let terminator = SessionTerminator::new(store.clone(), config.logout_timeout);
        let (published, _) = watch::channel(None);
        Self {
            inner: Arc::new(Inner {
                store,
                factory,
                pairing,
                terminator,
                config,
                slot: Arc::new(Mutex::new(Slot::Vacant)),
                published,
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Return the live session, creating it if none exists.
    ///
    /// For an unpaired identity this resolves as soon as the first pairing
    /// code is available, not when the code is scanned.
    pub async fn ensure_session(&self) -> Result<Ensured, SessionError> {
        let (outcome, leader) = {
            let mut slot = self.inner.slot.lock().await;
            match &*slot {
                Slot::Occupied(session) => {
                    return Ok(Ensured::Existing {
                        session: session.clone(),
                    });
                }
                Slot::Transitioning { outcome, .. } => (outcome.clone(), false),
                Slot::Vacant => {
                    let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
                    let inner = self.inner.clone();
                    let task = tokio::spawn(inner.run_transition(generation));
                    let outcome = async move {
                        task.await
                            .unwrap_or_else(|e| Err(SessionError::Internal(e.to_string())))
                    }
                    .boxed()
                    .shared();
                    *slot = Slot::Transitioning {
                        generation,
                        outcome: outcome.clone(),
                    };
                    (outcome, true)
                }
            }
        };

        let transition = outcome.await?;
        if leader {
            Ok(Ensured::Created {
                session: transition.session,
                pairing: transition.pairing,
            })
        } else {
            Ok(Ensured::Joined {
                session: transition.session,
            })
        }
    }

    /// The published session, without waiting on any transition.
    pub fn current_session(&self) -> Result<Arc<Session>, SessionError> {
        self.inner
            .published
            .borrow()
            .clone()
            .ok_or(SessionError::NoActiveSession)
    }

    pub fn status(&self) -> SessionStatus {
        match self.current_session() {
            Ok(session) => session.status(),
            Err(_) => SessionStatus::unpaired(),
        }
    }

    /// Log out, disconnect and forget the active session.
    ///
    /// Waits for an in-flight transition first. The slot is vacated even
    /// when logout fails, because the transport is closed either way. Once
    /// started, the teardown runs to completion if the caller goes away.
    pub async fn terminate(&self) -> Result<(), SessionError> {
        loop {
            let mut slot = self.inner.slot.clone().lock_owned().await;
            match &*slot {
                Slot::Transitioning { outcome, .. } => {
                    let outcome = outcome.clone();
                    drop(slot);
                    let _ = outcome.await;
                }
                Slot::Vacant => return self.inner.terminator.terminate(None).await,
                Slot::Occupied(session) => {
                    let session = session.clone();
                    let inner = self.inner.clone();
                    let teardown = tokio::spawn(async move {
                        inner.publish(None);
                        let result = inner.terminator.terminate(Some(session.as_ref())).await;
                        *slot = Slot::Vacant;
                        drop(slot);
                        session.abort_tasks();
                        result
                    });
                    return teardown
                        .await
                        .unwrap_or_else(|e| Err(SessionError::Internal(e.to_string())));
                }
            }
        }
    }

    /// Disconnect without logging out, keeping stored credentials.
    pub async fn shutdown(&self) {
        let previous = {
            let mut slot = self.inner.slot.lock().await;
            self.inner.publish(None);
            std::mem::replace(&mut *slot, Slot::Vacant)
        };

        if let Slot::Occupied(session) = previous {
            tracing::info!(session_id = %session.id(), "Disconnecting session for shutdown");
            session.client().disconnect().await;
            session.set_state(SessionState::Disconnected);
            session.abort_tasks();
        }
    }
}

impl Inner {
    fn publish(&self, session: Option<Arc<Session>>) {
        self.published.send_replace(session);
    }

    async fn run_transition(self: Arc<Self>, generation: u64) -> Result<Transition, SessionError> {
        let result = self.establish().await;

        let mut slot = self.slot.lock().await;
        let current = matches!(
            &*slot,
            Slot::Transitioning { generation: g, .. } if *g == generation
        );

        match result {
            Ok(established) if current => {
                let session = established.session.clone();
                *slot = Slot::Occupied(session.clone());
                self.publish(Some(session.clone()));
                drop(slot);

                let pairing = established.pending.as_ref().map(|p| p.artifact.clone());
                self.spawn_watchers(established);
                tracing::info!(
                    session_id = %session.id(),
                    state = %session.state(),
                    "Session established"
                );
                Ok(Transition { session, pairing })
            }
            Ok(established) => {
                drop(slot);
                tracing::info!("Session transition superseded by shutdown, discarding client");
                established.session.client().disconnect().await;
                Err(SessionError::Internal(
                    "session was shut down while connecting".to_string(),
                ))
            }
            Err(e) => {
                if current {
                    *slot = Slot::Vacant;
                }
                tracing::warn!(error = %e, "Session transition failed");
                Err(e)
            }
        }
    }

    async fn establish(&self) -> Result<Established, SessionError> {
        let device = self.store.get_or_create_device().await?;

        if !device.paired() {
            tracing::info!(device_id = %device.id, "Client is not logged in, generating QR code");
            return self.pair(device).await;
        }

        tracing::info!(device_id = %device.id, "Client already logged in, connecting");
        match self.reconnect(&device).await {
            Ok(established) => Ok(established),
            Err(e) if self.config.reconnect_fallback == ReconnectFallback::Repair => {
                tracing::warn!(
                    device_id = %device.id,
                    error = %e,
                    "Reconnect failed, discarding identity and pairing again"
                );
                self.store.invalidate(device.id).await?;
                let fresh = self.store.get_or_create_device().await?;
                self.pair(fresh).await
            }
            Err(e) => Err(e),
        }
    }

    async fn reconnect(&self, device: &DeviceIdentity) -> Result<Established, SessionError> {
        let client = self.factory.build(device);
        let events = client.subscribe();

        let connected = tokio::time::timeout(self.config.connect_timeout, client.connect()).await;
        let failure = match connected {
            Ok(Ok(())) => None,
            Ok(Err(e)) => Some(e.to_string()),
            Err(_) => Some(format!("timed out after {:?}", self.config.connect_timeout)),
        };
        if let Some(reason) = failure {
            client.disconnect().await;
            return Err(SessionError::ConnectFailed(reason));
        }

        Ok(Established {
            session: Arc::new(Session::new(client, device, SessionState::Connected)),
            pending: None,
            events,
        })
    }

    async fn pair(&self, device: DeviceIdentity) -> Result<Established, SessionError> {
        let client: Arc<dyn ProtocolClient> = self.factory.build(&device);
        let events = client.subscribe();

        match self.pairing.begin(&client).await {
            Ok(pending) => Ok(Established {
                session: Arc::new(Session::new(client, &device, SessionState::Pairing)),
                pending: Some(pending),
                events,
            }),
            Err(e) => {
                client.disconnect().await;
                Err(e)
            }
        }
    }

    fn spawn_watchers(self: &Arc<Self>, established: Established) {
        let Established {
            session,
            pending,
            events,
        } = established;

        let pump = tokio::spawn(pump_events(
            Arc::downgrade(self),
            Arc::downgrade(&session),
            events,
        ));
        session.attach_task(pump);

        if let Some(pending) = pending {
            let watcher = tokio::spawn(watch_pairing(
                Arc::downgrade(self),
                Arc::downgrade(&session),
                pending,
            ));
            session.attach_task(watcher);
        }
    }

    async fn on_paired(&self, session: &Session, jid: Jid) {
        if session.mark_paired(jid.clone())
            && let Err(e) = self.store.mark_paired(session.device_id(), &jid).await
        {
            tracing::error!(
                device_id = %session.device_id(),
                error = %e,
                "Failed to persist pairing"
            );
        }
    }

    /// Drop `session_id` from the slot if it is still the active session.
    async fn release(&self, session_id: Uuid, reason: &str, invalidate: bool) {
        let session = {
            let mut slot = self.slot.lock().await;
            match &*slot {
                Slot::Occupied(session) if session.id() == session_id => {
                    let session = session.clone();
                    *slot = Slot::Vacant;
                    self.publish(None);
                    session
                }
                _ => return,
            }
        };

        tracing::info!(session_id = %session_id, reason, "Releasing session");
        session.client().disconnect().await;
        session.set_state(SessionState::Unpaired);
        if invalidate && let Err(e) = self.store.invalidate(session.device_id()).await {
            tracing::warn!(device_id = %session.device_id(), error = %e, "Failed to drop stored credentials");
        }
        session.abort_tasks();
    }
}

async fn pump_events(
    inner: Weak<Inner>,
    session: Weak<Session>,
    mut events: broadcast::Receiver<ClientEvent>,
) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Client event subscriber lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) else {
            return;
        };

        match event {
            ClientEvent::PairSuccess { jid } => {
                tracing::info!(session_id = %session.id(), jid = %jid, "Pairing completed");
                inner.on_paired(&session, jid).await;
            }
            ClientEvent::Connected => {
                if session.jid().is_some() {
                    session.set_state(SessionState::Connected);
                }
            }
            ClientEvent::Disconnected => {
                if session.is_connected() {
                    session.set_state(SessionState::Disconnected);
                }
            }
            ClientEvent::LoggedOut { reason } => {
                tracing::warn!(session_id = %session.id(), reason = %reason, "Logged out remotely");
                inner.release(session.id(), &reason, true).await;
                return;
            }
            ClientEvent::Message { from, text } => {
                tracing::info!(from = %from, text = %text, "Received a message");
            }
        }
    }
}

async fn watch_pairing(inner: Weak<Inner>, session: Weak<Session>, pending: PendingPairing) {
    let resolution = pending.watch().await;
    let (Some(inner), Some(session)) = (inner.upgrade(), session.upgrade()) else {
        return;
    };

    match resolution {
        PairingResolution::Paired { jid } => inner.on_paired(&session, jid).await,
        PairingResolution::Abandoned { reason } => {
            if session.jid().is_none() {
                tracing::info!(session_id = %session.id(), reason = %reason, "Pairing abandoned");
                inner.release(session.id(), &reason, false).await;
            }
        }
    }
}
