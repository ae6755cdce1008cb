//! Common test utilities: a scripted protocol client and a counting factory.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use kirimwa::client::{
    ClientEvent, ClientFactory, Jid, PairingEvent, ProtocolClient, SendReceipt,
};
use kirimwa::config::{ReconnectFallback, SessionConfig};
use kirimwa::dispatch::MessageDispatcher;
use kirimwa::error::ClientError;
use kirimwa::gateway::{AppState, build_router};
use kirimwa::pairing::{PairingFlow, QrPngRenderer};
use kirimwa::session::{SessionManager, SessionState};
use kirimwa::store::{DeviceIdentity, DeviceStore, MemoryDeviceStore};

pub const DOMAIN: &str = "s.whatsapp.net";
pub const FAKE_CODE: &str = "2@Zm9vYmFy,cGFpcmluZw==,aWRlbnRpdHk=";

/// What the pairing stream does once `connect` is called.
#[derive(Debug, Clone, Default)]
pub enum PairingScript {
    /// Emit one code and keep the stream open.
    #[default]
    Code,
    /// Close the stream without a code.
    CloseWithoutCode,
    /// Emit lifecycle noise, then a code.
    NoiseThenCode,
    /// Never emit anything.
    Silent,
}

/// Behaviour of every client the factory builds.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    pub pairing: PairingScript,
    pub connect_delay: Duration,
    pub fail_connect: bool,
    pub fail_send: bool,
    pub fail_logout: bool,
    pub logout_delay: Duration,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Calls {
    pub pairing_requests: usize,
    pub connects: usize,
    pub disconnects: usize,
    pub sends: usize,
    pub logouts: usize,
}

#[derive(Default)]
struct Counters {
    pairing_requests: AtomicUsize,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
    sends: AtomicUsize,
    logouts: AtomicUsize,
}

impl Counters {
    fn snapshot(&self) -> Calls {
        Calls {
            pairing_requests: self.pairing_requests.load(Ordering::SeqCst),
            connects: self.connects.load(Ordering::SeqCst),
            disconnects: self.disconnects.load(Ordering::SeqCst),
            sends: self.sends.load(Ordering::SeqCst),
            logouts: self.logouts.load(Ordering::SeqCst),
        }
    }
}

/// A protocol client driven entirely by its [`Behavior`].
pub struct FakeClient {
    pub device: DeviceIdentity,
    behavior: Behavior,
    counters: Counters,
    pairing_tx: Mutex<Option<mpsc::Sender<PairingEvent>>>,
    events: broadcast::Sender<ClientEvent>,
    sent: Mutex<Vec<(Jid, String)>>,
}

impl FakeClient {
    pub fn new(device: DeviceIdentity, behavior: Behavior) -> Self {
        let (events, _) = broadcast::channel(16);
        Self {
            device,
            behavior,
            counters: Counters::default(),
            pairing_tx: Mutex::new(None),
            events,
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn calls(&self) -> Calls {
        self.counters.snapshot()
    }

    pub fn sent(&self) -> Vec<(Jid, String)> {
        self.sent.lock().unwrap().clone()
    }

    /// Simulate the phone scanning the code.
    pub fn complete_pairing(&self, jid: &Jid) {
        if let Some(tx) = self.pairing_tx.lock().unwrap().take() {
            let _ = tx.try_send(PairingEvent::Success { jid: jid.clone() });
        }
        self.emit(ClientEvent::PairSuccess { jid: jid.clone() });
    }

    /// Simulate the code stream expiring.
    pub fn expire_pairing(&self) {
        if let Some(tx) = self.pairing_tx.lock().unwrap().take() {
            let _ = tx.try_send(PairingEvent::Timeout);
        }
    }

    pub fn emit(&self, event: ClientEvent) {
        let _ = self.events.send(event);
    }

    fn send_pairing(&self, event: PairingEvent) {
        if let Some(tx) = self.pairing_tx.lock().unwrap().as_ref() {
            let _ = tx.try_send(event);
        }
    }
}

#[async_trait]
impl ProtocolClient for FakeClient {
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>, ClientError> {
        self.counters.pairing_requests.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(8);
        *self.pairing_tx.lock().unwrap() = Some(tx);
        Ok(rx)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        self.counters.connects.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.connect_delay.is_zero() {
            tokio::time::sleep(self.behavior.connect_delay).await;
        }
        if self.behavior.fail_connect {
            return Err(ClientError::ConnectFailed("connection refused".to_string()));
        }

        let code = PairingEvent::Code {
            code: FAKE_CODE.to_string(),
            expires_in: Duration::from_secs(60),
        };
        match self.behavior.pairing {
            PairingScript::Code => self.send_pairing(code),
            PairingScript::NoiseThenCode => {
                self.send_pairing(PairingEvent::Error {
                    reason: "ignored before the first code".to_string(),
                });
                self.send_pairing(code);
            }
            PairingScript::CloseWithoutCode => {
                self.pairing_tx.lock().unwrap().take();
            }
            PairingScript::Silent => {}
        }

        if self.device.paired() {
            self.emit(ClientEvent::Connected);
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.counters.disconnects.fetch_add(1, Ordering::SeqCst);
        self.pairing_tx.lock().unwrap().take();
    }

    async fn send_text(&self, to: &Jid, body: &str) -> Result<SendReceipt, ClientError> {
        let n = self.counters.sends.fetch_add(1, Ordering::SeqCst) + 1;
        if self.behavior.fail_send {
            return Err(ClientError::RequestFailed {
                endpoint: "v1/messages".to_string(),
                reason: "recipient unreachable".to_string(),
            });
        }
        self.sent.lock().unwrap().push((to.clone(), body.to_string()));
        Ok(SendReceipt {
            id: format!("3EB0{:08X}", n),
            timestamp: Utc::now(),
            server_id: Some(n as i64),
        })
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.counters.logouts.fetch_add(1, Ordering::SeqCst);
        if !self.behavior.logout_delay.is_zero() {
            tokio::time::sleep(self.behavior.logout_delay).await;
        }
        if self.behavior.fail_logout {
            return Err(ClientError::Rejected {
                endpoint: "v1/logout".to_string(),
                status: 502,
                body: "upstream closed".to_string(),
            });
        }
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

/// Builds [`FakeClient`]s and remembers every one of them.
#[derive(Default)]
pub struct FakeFactory {
    behavior: Mutex<Behavior>,
    clients: Mutex<Vec<Arc<FakeClient>>>,
}

impl FakeFactory {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            clients: Mutex::new(Vec::new()),
        }
    }

    /// Change the behaviour of clients built from now on.
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn builds(&self) -> usize {
        self.clients.lock().unwrap().len()
    }

    pub fn client(&self, index: usize) -> Arc<FakeClient> {
        self.clients.lock().unwrap()[index].clone()
    }

    pub fn last_client(&self) -> Arc<FakeClient> {
        self.clients
            .lock()
            .unwrap()
            .last()
            .cloned()
            .expect("no client built yet")
    }

    /// Calls summed over every client built so far.
    pub fn total_calls(&self) -> Calls {
        self.clients
            .lock()
            .unwrap()
            .iter()
            .map(|c| c.calls())
            .fold(Calls::default(), |acc, c| Calls {
                pairing_requests: acc.pairing_requests + c.pairing_requests,
                connects: acc.connects + c.connects,
                disconnects: acc.disconnects + c.disconnects,
                sends: acc.sends + c.sends,
                logouts: acc.logouts + c.logouts,
            })
    }
}

impl ClientFactory for FakeFactory {
    fn build(&self, device: &DeviceIdentity) -> Arc<dyn ProtocolClient> {
        let behavior = self.behavior.lock().unwrap().clone();
        let client = Arc::new(FakeClient::new(device.clone(), behavior));
        self.clients.lock().unwrap().push(client.clone());
        client
    }
}

/// A manager, its collaborators and the HTTP app over them.
pub struct Harness {
    pub store: Arc<MemoryDeviceStore>,
    pub factory: Arc<FakeFactory>,
    pub sessions: SessionManager,
    pub dispatcher: MessageDispatcher,
}

impl Harness {
    pub fn app(&self) -> Router {
        build_router(AppState {
            sessions: self.sessions.clone(),
            dispatcher: self.dispatcher.clone(),
            store: self.store.clone() as Arc<dyn DeviceStore>,
        })
    }
}

pub fn test_config() -> SessionConfig {
    SessionConfig {
        pairing_timeout: Duration::from_millis(500),
        connect_timeout: Duration::from_millis(500),
        send_timeout: Duration::from_millis(500),
        logout_timeout: Duration::from_millis(500),
        ..SessionConfig::default()
    }
}

pub fn harness_with(
    store: MemoryDeviceStore,
    behavior: Behavior,
    fallback: ReconnectFallback,
) -> Harness {
    let store = Arc::new(store);
    let factory = Arc::new(FakeFactory::new(behavior));
    let config = SessionConfig {
        reconnect_fallback: fallback,
        ..test_config()
    };
    let pairing = PairingFlow::new(
        Arc::new(QrPngRenderer::new(64)),
        config.pairing_timeout,
    );
    let sessions = SessionManager::new(
        store.clone(),
        factory.clone(),
        pairing,
        config.clone(),
    );
    let dispatcher = MessageDispatcher::new(
        sessions.clone(),
        config.address_domain.clone(),
        config.send_timeout,
    );
    Harness {
        store,
        factory,
        sessions,
        dispatcher,
    }
}

/// Fresh store, identity not yet linked.
pub fn unpaired_harness(behavior: Behavior) -> Harness {
    harness_with(MemoryDeviceStore::new(), behavior, ReconnectFallback::Fail)
}

/// Store seeded with an identity linked to [`linked_jid`].
pub fn paired_harness(behavior: Behavior) -> Harness {
    harness_with(
        MemoryDeviceStore::with_device(paired_device()),
        behavior,
        ReconnectFallback::Fail,
    )
}

pub fn linked_jid() -> Jid {
    Jid::new("6281234567890", DOMAIN)
}

pub fn paired_device() -> DeviceIdentity {
    DeviceIdentity {
        jid: Some(linked_jid()),
        ..DeviceIdentity::generate()
    }
}

/// Wait until the session reaches `state`, failing the test after a second.
pub async fn wait_for_state(sessions: &SessionManager, state: SessionState) {
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        loop {
            if sessions.status().state == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(
        result.is_ok(),
        "session never reached {}, last seen {}",
        state,
        sessions.status().state
    );
}

/// Poll `check` until it holds, failing the test after a second.
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let result = tokio::time::timeout(Duration::from_secs(1), async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}
