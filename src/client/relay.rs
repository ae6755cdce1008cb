//! Protocol client backed by an HTTP relay.
//!
//! The relay owns the actual multi-device connection. This adapter maps the
//! [`ProtocolClient`] contract onto its endpoints:
//!
//! | Operation | Relay call |
//! |---|---|
//! | `connect` | `POST /v1/connect` with the device identity |
//! | `disconnect` | `POST /v1/disconnect` |
//! | `logout` | `POST /v1/logout` |
//! | `send_text` | `POST /v1/messages` |
//! | `pairing_events` | `GET /v1/pairing` (SSE) |
//! | `subscribe` | `GET /v1/events` (SSE), opened on connect |
//!
//! Every request carries the device id in `X-Device-Id`.

use std::ops::ControlFlow;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use url::Url;

use super::sse::{SseDecoder, SseEvent};
use super::{ClientEvent, ClientFactory, Jid, PairingEvent, ProtocolClient, SendReceipt};
use crate::error::ClientError;
use crate::store::DeviceIdentity;

const DEVICE_HEADER: &str = "X-Device-Id";
const EVENT_BUFFER: usize = 64;
const PAIRING_BUFFER: usize = 8;

/// Builds [`RelayClient`]s sharing one HTTP connection pool.
#[derive(Clone)]
pub struct RelayClientFactory {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
}

impl RelayClientFactory {
    pub fn new(base: Url, request_timeout: Duration) -> Result<Self, ClientError> {
        // No overall timeout on the client: SSE responses stay open.
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| ClientError::RequestFailed {
                endpoint: base.to_string(),
                reason: e.to_string(),
            })?;

        Ok(Self {
            http,
            base: with_trailing_slash(base),
            request_timeout,
        })
    }
}

impl ClientFactory for RelayClientFactory {
    fn build(&self, device: &DeviceIdentity) -> Arc<dyn ProtocolClient> {
        Arc::new(RelayClient::new(
            self.http.clone(),
            self.base.clone(),
            self.request_timeout,
            device.clone(),
        ))
    }
}

/// One device's view of the relay.
pub struct RelayClient {
    http: reqwest::Client,
    base: Url,
    request_timeout: Duration,
    device: DeviceIdentity,
    events: broadcast::Sender<ClientEvent>,
    event_pump: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Serialize)]
struct ConnectRequest {
    device_id: String,
    jid: Option<String>,
    registration_id: u32,
    identity_key: String,
}

#[derive(Serialize)]
struct SendRequest<'a> {
    to: String,
    text: &'a str,
}

#[derive(Deserialize)]
struct CodePayload {
    code: String,
    #[serde(default = "default_code_ttl")]
    timeout_secs: u64,
}

fn default_code_ttl() -> u64 {
    60
}

#[derive(Deserialize)]
struct JidPayload {
    jid: Jid,
}

#[derive(Deserialize, Default)]
struct ReasonPayload {
    #[serde(default)]
    reason: String,
}

#[derive(Deserialize)]
struct MessagePayload {
    from: Jid,
    #[serde(default)]
    text: String,
}

impl RelayClient {
    fn new(
        http: reqwest::Client,
        base: Url,
        request_timeout: Duration,
        device: DeviceIdentity,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_BUFFER);
        Self {
            http,
            base,
            request_timeout,
            device,
            events,
            event_pump: Mutex::new(None),
        }
    }

    fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.base
            .join(path)
            .map_err(|e| ClientError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })
    }

    async fn post<B: Serialize + ?Sized>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<reqwest::Response, ClientError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .post(url)
            .header(DEVICE_HEADER, self.device.id.to_string())
            .timeout(self.request_timeout)
            .json(body)
            .send()
            .await
            .map_err(|e| ClientError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        check_status(path, response).await
    }

    async fn open_stream(&self, path: &str) -> Result<reqwest::Response, ClientError> {
        let url = self.endpoint(path)?;
        let response = self
            .http
            .get(url)
            .header(DEVICE_HEADER, self.device.id.to_string())
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await
            .map_err(|e| ClientError::RequestFailed {
                endpoint: path.to_string(),
                reason: e.to_string(),
            })?;
        check_status(path, response).await
    }

    async fn start_event_pump(&self) -> Result<(), ClientError> {
        if self
            .event_pump
            .lock()
            .map(|pump| pump.as_ref().is_some_and(|h| !h.is_finished()))
            .unwrap_or(false)
        {
            return Ok(());
        }

        let response = self.open_stream("v1/events").await?;
        let tx = self.events.clone();
        let handle = spawn_sse_reader("v1/events", response, move |event| {
            if let Some(parsed) = parse_client_event(&event) {
                // No subscribers is not an error.
                let _ = tx.send(parsed);
            }
            ControlFlow::Continue(())
        });

        if let Ok(mut pump) = self.event_pump.lock()
            && let Some(old) = pump.replace(handle)
        {
            old.abort();
        }
        Ok(())
    }

    fn stop_event_pump(&self) {
        if let Ok(mut pump) = self.event_pump.lock()
            && let Some(handle) = pump.take()
        {
            handle.abort();
        }
    }
}

#[async_trait]
impl ProtocolClient for RelayClient {
    async fn pairing_events(&self) -> Result<mpsc::Receiver<PairingEvent>, ClientError> {
        let response = self.open_stream("v1/pairing").await?;
        let (tx, rx) = mpsc::channel(PAIRING_BUFFER);

        spawn_sse_reader("v1/pairing", response, move |event| {
            let Some(parsed) = parse_pairing_event(&event) else {
                return ControlFlow::Continue(());
            };
            let terminal = !matches!(parsed, PairingEvent::Code { .. });
            match tx.try_send(parsed) {
                // The consumer stopped listening.
                Err(mpsc::error::TrySendError::Closed(_)) => return ControlFlow::Break(()),
                Err(mpsc::error::TrySendError::Full(dropped)) => {
                    tracing::warn!(event = dropped.kind(), "Pairing consumer lagging, event dropped");
                }
                Ok(()) => {}
            }
            if terminal {
                ControlFlow::Break(())
            } else {
                ControlFlow::Continue(())
            }
        });

        Ok(rx)
    }

    async fn connect(&self) -> Result<(), ClientError> {
        let request = ConnectRequest {
            device_id: self.device.id.to_string(),
            jid: self.device.jid.as_ref().map(ToString::to_string),
            registration_id: self.device.registration_id,
            identity_key: base64::engine::general_purpose::STANDARD
                .encode(&self.device.identity_key),
        };
        self.post("v1/connect", &request)
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        self.start_event_pump()
            .await
            .map_err(|e| ClientError::ConnectFailed(e.to_string()))?;
        Ok(())
    }

    async fn disconnect(&self) {
        self.stop_event_pump();
        if let Err(e) = self.post("v1/disconnect", &serde_json::json!({})).await {
            tracing::warn!(device_id = %self.device.id, error = %e, "Relay disconnect failed");
        }
    }

    async fn send_text(&self, to: &Jid, body: &str) -> Result<SendReceipt, ClientError> {
        let request = SendRequest {
            to: to.to_string(),
            text: body,
        };
        let response = self.post("v1/messages", &request).await?;
        response
            .json::<SendReceipt>()
            .await
            .map_err(|e| ClientError::InvalidResponse {
                endpoint: "v1/messages".to_string(),
                reason: e.to_string(),
            })
    }

    async fn logout(&self) -> Result<(), ClientError> {
        self.post("v1/logout", &serde_json::json!({})).await?;
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        self.events.subscribe()
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.stop_event_pump();
    }
}

async fn check_status(
    endpoint: &str,
    response: reqwest::Response,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(ClientError::Rejected {
        endpoint: endpoint.to_string(),
        status: status.as_u16(),
        body,
    })
}

fn spawn_sse_reader<F>(
    endpoint: &'static str,
    response: reqwest::Response,
    mut on_event: F,
) -> JoinHandle<()>
where
    F: FnMut(SseEvent) -> ControlFlow<()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut body = response.bytes_stream();
        let mut decoder = SseDecoder::new();

        while let Some(chunk) = body.next().await {
            match chunk {
                Ok(bytes) => {
                    for event in decoder.push(&bytes) {
                        if on_event(event).is_break() {
                            return;
                        }
                    }
                }
                Err(e) => {
                    tracing::warn!(endpoint, error = %e, "Relay stream failed");
                    return;
                }
            }
        }

        if let Some(event) = decoder.finish() {
            let _ = on_event(event);
        }
        tracing::debug!(endpoint, "Relay stream ended");
    })
}

fn parse_pairing_event(event: &SseEvent) -> Option<PairingEvent> {
    match event.event.as_str() {
        "code" => {
            let payload: CodePayload = decode(event)?;
            Some(PairingEvent::Code {
                code: payload.code,
                expires_in: Duration::from_secs(payload.timeout_secs),
            })
        }
        "success" => {
            let payload: JidPayload = decode(event)?;
            Some(PairingEvent::Success { jid: payload.jid })
        }
        "timeout" => Some(PairingEvent::Timeout),
        "error" => {
            let payload: ReasonPayload = decode(event).unwrap_or_default();
            Some(PairingEvent::Error {
                reason: payload.reason,
            })
        }
        other => {
            tracing::debug!(event = other, "Ignoring unknown pairing event");
            None
        }
    }
}

fn parse_client_event(event: &SseEvent) -> Option<ClientEvent> {
    match event.event.as_str() {
        "connected" => Some(ClientEvent::Connected),
        "disconnected" => Some(ClientEvent::Disconnected),
        "pair_success" => {
            let payload: JidPayload = decode(event)?;
            Some(ClientEvent::PairSuccess { jid: payload.jid })
        }
        "logged_out" => {
            let payload: ReasonPayload = decode(event).unwrap_or_default();
            Some(ClientEvent::LoggedOut {
                reason: payload.reason,
            })
        }
        "message" => {
            let payload: MessagePayload = decode(event)?;
            Some(ClientEvent::Message {
                from: payload.from,
                text: payload.text,
            })
        }
        other => {
            tracing::debug!(event = other, "Ignoring unknown relay event");
            None
        }
    }
}

fn decode<T: for<'de> Deserialize<'de>>(event: &SseEvent) -> Option<T> {
    match serde_json::from_str(&event.data) {
        Ok(payload) => Some(payload),
        Err(e) => {
            tracing::warn!(event = %event.event, error = %e, "Malformed relay event payload");
            None
        }
    }
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
