//! WebSocket-backed [`ProtocolClient`].
//!
//! Handles only what the registry relies on: the configuration fetch, the
//! authenticated handshake, keepalive, reconnection, and the server/channel
//! cache taken from the `Ready` snapshot. Incremental entity updates are not
//! tracked.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::MaybeTlsStream;

use crate::client::{
    Channel, ClientFactory, FailureKind, ProtocolClient, Server, TransportError, TransportEvent,
};
use crate::instance_url::InstanceKey;
use crate::sessions::SessionCredentials;

type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(60);
const PING_INTERVAL: Duration = Duration::from_secs(30);

/// Builds a [`WsClient`] per instance, sharing one HTTP client.
pub struct WsClientFactory {
    http: reqwest::Client,
}

impl WsClientFactory {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

impl ClientFactory for WsClientFactory {
    fn create(&self, instance: &InstanceKey) -> Arc<dyn ProtocolClient> {
        Arc::new(WsClient::new(instance.clone(), self.http.clone()))
    }
}

/// A persistent WebSocket connection to one instance.
///
/// `connect()` spawns a task that:
/// - Emits `Connecting` and opens `{ws}?version=1&format=json&token=...`
/// - Emits `Connected` once the `Ready` snapshot arrives and fills the caches
/// - Pings every 30s until the socket drops or `disconnect()` is called
/// - On a transient failure emits `Disconnected` and retries with exponential
///   backoff (1s..60s); on a fatal one emits `Disconnected` and stops
pub struct WsClient {
    shared: Arc<Shared>,
}

struct Shared {
    instance: InstanceKey,
    http: reqwest::Client,
    session: RwLock<Option<SessionCredentials>>,
    ws_url: RwLock<Option<String>>,
    servers: RwLock<HashMap<String, Server>>,
    channels: RwLock<HashMap<String, Channel>>,
    last_failure: RwLock<Option<FailureKind>>,
    events_tx: broadcast::Sender<TransportEvent>,
    task: Mutex<Option<ConnectionTask>>,
}

struct ConnectionTask {
    shutdown_tx: watch::Sender<bool>,
    handle: tokio::task::JoinHandle<()>,
}

impl WsClient {
    pub fn new(instance: InstanceKey, http: reqwest::Client) -> Self {
        let (events_tx, _) = broadcast::channel(32);
        Self {
            shared: Arc::new(Shared {
                instance,
                http,
                session: RwLock::new(None),
                ws_url: RwLock::new(None),
                servers: RwLock::new(HashMap::new()),
                channels: RwLock::new(HashMap::new()),
                last_failure: RwLock::new(None),
                events_tx,
                task: Mutex::new(None),
            }),
        }
    }
}

impl Drop for WsClient {
    fn drop(&mut self) {
        self.disconnect();
    }
}

impl ProtocolClient for WsClient {
    fn assign_session(&self, credentials: &SessionCredentials) {
        *self.shared.session.write() = Some(credentials.clone());
    }

    fn fetch_configuration(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let shared = self.shared.clone();
        Box::pin(async move {
            let url = format!("{}/", shared.instance);
            let request_err = |e: reqwest::Error| TransportError::Request {
                url: url.clone(),
                message: e.to_string(),
            };

            let root: Value = shared
                .http
                .get(&url)
                .send()
                .await
                .and_then(reqwest::Response::error_for_status)
                .map_err(request_err)?
                .json()
                .await
                .map_err(request_err)?;

            let ws = root
                .get("ws")
                .and_then(Value::as_str)
                .ok_or_else(|| TransportError::InvalidConfiguration(shared.instance.to_string()))?;
            *shared.ws_url.write() = Some(ws.to_string());
            Ok(())
        })
    }

    fn connect(&self) {
        let mut task = self.shared.task.lock();
        if task.as_ref().is_some_and(|t| !t.handle.is_finished()) {
            return;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(connection_loop(self.shared.clone(), shutdown_rx));
        *task = Some(ConnectionTask {
            shutdown_tx,
            handle,
        });
    }

    fn disconnect(&self) {
        if let Some(task) = self.shared.task.lock().take() {
            let _ = task.shutdown_tx.send(true);
        }
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    fn last_failure(&self) -> Option<FailureKind> {
        *self.shared.last_failure.read()
    }

    fn has_server(&self, id: &str) -> bool {
        self.shared.servers.read().contains_key(id)
    }

    fn has_channel(&self, id: &str) -> bool {
        self.shared.channels.read().contains_key(id)
    }

    fn servers(&self) -> Vec<Server> {
        self.shared.servers.read().values().cloned().collect()
    }

    fn channels(&self) -> Vec<Channel> {
        self.shared.channels.read().values().cloned().collect()
    }
}

impl Shared {
    fn emit(&self, event: TransportEvent) {
        let _ = self.events_tx.send(event);
    }

    /// Record the failure before announcing it so listeners see the cause.
    fn fail(&self, kind: FailureKind) {
        *self.last_failure.write() = Some(kind);
        self.emit(TransportEvent::Disconnected);
    }

    fn socket_url(&self) -> Result<String, TransportError> {
        let ws = self
            .ws_url
            .read()
            .clone()
            .ok_or_else(|| TransportError::InvalidConfiguration(self.instance.to_string()))?;
        let session = self.session.read();
        let token = &session.as_ref().ok_or(TransportError::NoSession)?.token;

        let mut url = reqwest::Url::parse(&ws)
            .map_err(|_| TransportError::InvalidConfiguration(self.instance.to_string()))?;
        url.query_pairs_mut()
            .append_pair("version", "1")
            .append_pair("format", "json")
            .append_pair("token", token);
        Ok(url.to_string())
    }

    fn replace_cache(&self, servers: Vec<Server>, channels: Vec<Channel>) {
        *self.servers.write() = servers.into_iter().map(|s| (s.id.clone(), s)).collect();
        *self.channels.write() = channels.into_iter().map(|c| (c.id.clone(), c)).collect();
    }
}

/// Frames the connection task reacts to; everything else is ignored.
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ServerFrame {
    Authenticated,
    Ready {
        #[serde(default)]
        servers: Vec<Server>,
        #[serde(default)]
        channels: Vec<Channel>,
    },
    Error {
        error: String,
    },
    #[serde(other)]
    Other,
}

fn parse_frame(text: &str) -> ServerFrame {
    serde_json::from_str(text).unwrap_or(ServerFrame::Other)
}

/// Fatal: the upgrade was refused with a 4xx other than 408/429, or the
/// endpoint URL is malformed. Everything else is worth retrying.
pub fn classify_error(error: &tungstenite::Error) -> FailureKind {
    use tungstenite::http::StatusCode;

    match error {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.is_client_error()
                && status != StatusCode::REQUEST_TIMEOUT
                && status != StatusCode::TOO_MANY_REQUESTS
            {
                FailureKind::Fatal
            } else {
                FailureKind::Transient
            }
        }
        tungstenite::Error::Url(_) => FailureKind::Fatal,
        _ => FailureKind::Transient,
    }
}

enum Outcome {
    Shutdown,
    Failed(FailureKind, String),
}

async fn connection_loop(shared: Arc<Shared>, mut shutdown_rx: watch::Receiver<bool>) {
    let mut backoff = INITIAL_BACKOFF;

    loop {
        if *shutdown_rx.borrow() {
            return;
        }
        shared.emit(TransportEvent::Connecting);

        let outcome = match shared.socket_url() {
            Ok(url) => {
                let connect = tokio::select! {
                    result = tokio_tungstenite::connect_async(url.as_str()) => result,
                    _ = shutdown_rx.changed() => return,
                };
                match connect {
                    Ok((ws_stream, _)) => {
                        run_connection(&shared, ws_stream, &mut shutdown_rx, &mut backoff).await
                    }
                    Err(e) => Outcome::Failed(classify_error(&e), e.to_string()),
                }
            }
            Err(e) => Outcome::Failed(FailureKind::Fatal, e.to_string()),
        };

        match outcome {
            Outcome::Shutdown => return,
            Outcome::Failed(FailureKind::Fatal, reason) => {
                tracing::error!(instance = %shared.instance, reason = %reason, "connection rejected");
                shared.fail(FailureKind::Fatal);
                return;
            }
            Outcome::Failed(FailureKind::Transient, reason) => {
                tracing::debug!(
                    instance = %shared.instance,
                    reason = %reason,
                    retry_in = ?backoff,
                    "connection lost"
                );
                shared.fail(FailureKind::Transient);
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = shutdown_rx.changed() => return,
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn run_connection(
    shared: &Shared,
    ws_stream: WsStream,
    shutdown_rx: &mut watch::Receiver<bool>,
    backoff: &mut Duration,
) -> Outcome {
    let (mut sink, mut stream) = ws_stream.split();
    let mut ping_interval = tokio::time::interval(PING_INTERVAL);
    ping_interval.tick().await; // Skip the first immediate tick.

    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => match parse_frame(text.as_str()) {
                        ServerFrame::Ready { servers, channels } => {
                            shared.replace_cache(servers, channels);
                            *shared.last_failure.write() = None;
                            *backoff = INITIAL_BACKOFF;
                            shared.emit(TransportEvent::Connected);
                        }
                        ServerFrame::Error { error } => {
                            let _ = sink.send(Message::Close(None)).await;
                            return Outcome::Failed(FailureKind::Fatal, error);
                        }
                        ServerFrame::Authenticated | ServerFrame::Other => {}
                    },
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            return Outcome::Failed(FailureKind::Transient, "pong failed".into());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return Outcome::Failed(
                            FailureKind::Transient,
                            format!("closed by server: {frame:?}"),
                        );
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Outcome::Failed(classify_error(&e), e.to_string()),
                    None => return Outcome::Failed(FailureKind::Transient, "stream ended".into()),
                }
            }
            _ = ping_interval.tick() => {
                if sink.send(Message::Ping(vec![].into())).await.is_err() {
                    return Outcome::Failed(FailureKind::Transient, "ping failed".into());
                }
            }
            _ = shutdown_rx.changed() => {
                let _ = sink.send(Message::Close(None)).await;
                return Outcome::Shutdown;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instance_url::normalize;

    fn client() -> WsClient {
        WsClient::new(normalize("http://127.0.0.1:9"), reqwest::Client::new())
    }

    #[test]
    fn parse_ready_frame() {
        let frame = parse_frame(
            r#"{"type":"Ready","users":[],"servers":[{"_id":"s1","name":"One"}],
                "channels":[{"_id":"c1","channel_type":"Group","name":"g"}]}"#,
        );
        match frame {
            ServerFrame::Ready { servers, channels } => {
                assert_eq!(servers[0].id, "s1");
                assert_eq!(channels[0].channel_type, "Group");
            }
            other => panic!("expected Ready, got {other:?}"),
        }
    }

    #[test]
    fn parse_error_frame() {
        assert!(matches!(
            parse_frame(r#"{"type":"Error","error":"InvalidSession"}"#),
            ServerFrame::Error { ref error } if error == "InvalidSession"
        ));
    }

    #[test]
    fn parse_unknown_and_garbage_frames() {
        assert!(matches!(parse_frame(r#"{"type":"Pong","data":0}"#), ServerFrame::Other));
        assert!(matches!(parse_frame("not json"), ServerFrame::Other));
    }

    #[test]
    fn classify_url_error_is_fatal() {
        let err = tungstenite::Error::Url(tungstenite::error::UrlError::UnsupportedUrlScheme);
        assert_eq!(classify_error(&err), FailureKind::Fatal);
    }

    #[test]
    fn classify_closed_is_transient() {
        assert_eq!(
            classify_error(&tungstenite::Error::ConnectionClosed),
            FailureKind::Transient
        );
    }

    #[test]
    fn socket_url_requires_configuration_and_session() {
        let client = client();
        assert!(matches!(
            client.shared.socket_url(),
            Err(TransportError::InvalidConfiguration(_))
        ));

        *client.shared.ws_url.write() = Some("ws://127.0.0.1:9/ws".into());
        assert!(matches!(
            client.shared.socket_url(),
            Err(TransportError::NoSession)
        ));

        client.assign_session(&SessionCredentials {
            session_id: "s".into(),
            token: "a b&c".into(),
            user_id: "u".into(),
        });
        assert_eq!(
            client.shared.socket_url().unwrap(),
            "ws://127.0.0.1:9/ws?version=1&format=json&token=a+b%26c"
        );
    }

    #[tokio::test]
    async fn connect_without_configuration_fails_fatally() {
        let client = client();
        let mut events = client.subscribe();
        client.connect();

        assert_eq!(events.recv().await.unwrap(), TransportEvent::Connecting);
        assert_eq!(events.recv().await.unwrap(), TransportEvent::Disconnected);
        assert_eq!(client.last_failure(), Some(FailureKind::Fatal));
    }
}
