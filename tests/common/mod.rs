#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chatfed::auth::{AuthError, Authenticator, LoginRequest, LoginResponse};
use chatfed::client::{
    Channel, ClientFactory, FailureKind, ProtocolClient, Server, TransportError, TransportEvent,
};
use chatfed::instance_url::{normalize, InstanceKey};
use chatfed::instances::InstanceDirectory;
use chatfed::registry::{InstanceRegistry, InstanceState};
use chatfed::sessions::{Session, SessionCredentials, SessionStore};
use chatfed::storage::{DocumentStorage, MemoryStorage, StoreError};
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{broadcast, Notify};

pub const WAIT: Duration = Duration::from_secs(2);

/// How a mock handle answers `fetch_configuration()`.
#[derive(Clone)]
pub enum ConfigBehavior {
    Succeed,
    Fail,
    /// Hold the fetch until the notify is triggered, then succeed.
    Gated(Arc<Notify>),
}

/// Scriptable [`ProtocolClient`]. Tests drive it by emitting transport events.
pub struct MockClient {
    pub instance: InstanceKey,
    events_tx: broadcast::Sender<TransportEvent>,
    config: ConfigBehavior,
    session: Mutex<Option<SessionCredentials>>,
    last_failure: Mutex<Option<FailureKind>>,
    servers: Mutex<Vec<Server>>,
    channels: Mutex<Vec<Channel>>,
    connects: AtomicUsize,
    disconnects: AtomicUsize,
}

impl MockClient {
    pub fn new(instance: InstanceKey, config: ConfigBehavior) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        Self {
            instance,
            events_tx,
            config,
            session: Mutex::new(None),
            last_failure: Mutex::new(None),
            servers: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            connects: AtomicUsize::new(0),
            disconnects: AtomicUsize::new(0),
        }
    }

    pub fn emit(&self, event: TransportEvent) {
        if event == TransportEvent::Connected {
            *self.last_failure.lock() = None;
        }
        let _ = self.events_tx.send(event);
    }

    /// Record a failure and report the drop, like a real handle does.
    pub fn fail(&self, kind: FailureKind) {
        *self.last_failure.lock() = Some(kind);
        let _ = self.events_tx.send(TransportEvent::Disconnected);
    }

    pub fn set_servers(&self, ids: &[&str]) {
        *self.servers.lock() = ids
            .iter()
            .map(|id| Server {
                id: id.to_string(),
                name: format!("server {id}"),
            })
            .collect();
    }

    pub fn set_channels(&self, channels: Vec<Channel>) {
        *self.channels.lock() = channels;
    }

    pub fn assigned_token(&self) -> Option<String> {
        self.session.lock().as_ref().map(|s| s.token.clone())
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> usize {
        self.disconnects.load(Ordering::SeqCst)
    }
}

impl ProtocolClient for MockClient {
    fn assign_session(&self, credentials: &SessionCredentials) {
        *self.session.lock() = Some(credentials.clone());
    }

    fn fetch_configuration(&self) -> BoxFuture<'static, Result<(), TransportError>> {
        let config = self.config.clone();
        let instance = self.instance.to_string();
        Box::pin(async move {
            match config {
                ConfigBehavior::Succeed => Ok(()),
                ConfigBehavior::Fail => Err(TransportError::InvalidConfiguration(instance)),
                ConfigBehavior::Gated(gate) => {
                    gate.notified().await;
                    Ok(())
                }
            }
        })
    }

    fn connect(&self) {
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.events_tx.subscribe()
    }

    fn last_failure(&self) -> Option<FailureKind> {
        *self.last_failure.lock()
    }

    fn has_server(&self, id: &str) -> bool {
        self.servers.lock().iter().any(|s| s.id == id)
    }

    fn has_channel(&self, id: &str) -> bool {
        self.channels.lock().iter().any(|c| c.id == id)
    }

    fn servers(&self) -> Vec<Server> {
        self.servers.lock().clone()
    }

    fn channels(&self) -> Vec<Channel> {
        self.channels.lock().clone()
    }
}

/// Records every handle it hands out.
pub struct MockFactory {
    config: Mutex<ConfigBehavior>,
    created: Mutex<Vec<Arc<MockClient>>>,
}

impl MockFactory {
    pub fn new() -> Self {
        Self {
            config: Mutex::new(ConfigBehavior::Succeed),
            created: Mutex::new(Vec::new()),
        }
    }

    /// Behavior for handles created from now on.
    pub fn set_config(&self, config: ConfigBehavior) {
        *self.config.lock() = config;
    }

    /// Most recently created handle for the instance.
    pub fn client(&self, url: &str) -> Option<Arc<MockClient>> {
        let key = normalize(url);
        self.created
            .lock()
            .iter()
            .rev()
            .find(|c| c.instance == key)
            .cloned()
    }

    pub fn created(&self) -> Vec<InstanceKey> {
        self.created
            .lock()
            .iter()
            .map(|c| c.instance.clone())
            .collect()
    }
}

impl ClientFactory for MockFactory {
    fn create(&self, instance: &InstanceKey) -> Arc<dyn ProtocolClient> {
        let client = Arc::new(MockClient::new(instance.clone(), self.config.lock().clone()));
        self.created.lock().push(client.clone());
        client
    }
}

/// Answers logins from a queue of canned responses.
pub struct MockAuthenticator {
    responses: Mutex<VecDeque<Result<LoginResponse, AuthError>>>,
    requests: Mutex<Vec<(InstanceKey, serde_json::Value)>>,
}

impl MockAuthenticator {
    pub fn new() -> Self {
        Self {
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn push(&self, response: Result<LoginResponse, AuthError>) {
        self.responses.lock().push_back(response);
    }

    pub fn requests(&self) -> Vec<(InstanceKey, serde_json::Value)> {
        self.requests.lock().clone()
    }
}

impl Authenticator for MockAuthenticator {
    fn login<'a>(
        &'a self,
        instance: &'a InstanceKey,
        request: &'a LoginRequest,
    ) -> BoxFuture<'a, Result<LoginResponse, AuthError>> {
        Box::pin(async move {
            self.requests.lock().push((
                instance.clone(),
                serde_json::to_value(request).expect("request serializes"),
            ));
            self.responses.lock().pop_front().unwrap_or_else(|| {
                Err(AuthError::Unreachable {
                    url: instance.to_string(),
                    message: "no scripted response".into(),
                })
            })
        })
    }
}

/// A registry over in-memory stores and mock network parts.
pub struct Harness {
    pub registry: InstanceRegistry,
    pub factory: Arc<MockFactory>,
    pub auth: Arc<MockAuthenticator>,
    pub storage: Arc<MemoryStorage>,
}

pub fn harness() -> Harness {
    harness_with_storage(MemoryStorage::new())
}

pub fn harness_with_storage(storage: MemoryStorage) -> Harness {
    let storage = Arc::new(storage);
    let factory = Arc::new(MockFactory::new());
    let auth = Arc::new(MockAuthenticator::new());
    let registry = InstanceRegistry::new(
        SessionStore::load(storage.clone(), None),
        InstanceDirectory::load(storage.clone()),
        factory.clone(),
        auth.clone(),
    );
    Harness {
        registry,
        factory,
        auth,
        storage,
    }
}

/// Reads nothing and rejects every write.
pub struct FailingStorage;

impl DocumentStorage for FailingStorage {
    fn read(&self, _name: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn write(&self, name: &str, _contents: &str) -> Result<(), StoreError> {
        Err(StoreError::Write {
            path: format!("{name}.json").into(),
            source: std::io::Error::new(std::io::ErrorKind::Other, "disk full"),
        })
    }
}

/// Like [`harness`], but every store write fails.
pub fn failing_harness() -> (InstanceRegistry, Arc<MockFactory>, Arc<MockAuthenticator>) {
    let storage: Arc<dyn DocumentStorage> = Arc::new(FailingStorage);
    let factory = Arc::new(MockFactory::new());
    let auth = Arc::new(MockAuthenticator::new());
    let registry = InstanceRegistry::new(
        SessionStore::load(storage.clone(), None),
        InstanceDirectory::load(storage),
        factory.clone(),
        auth.clone(),
    );
    (registry, factory, auth)
}

pub fn credentials(token: &str) -> SessionCredentials {
    SessionCredentials {
        session_id: format!("session-{token}"),
        token: token.to_string(),
        user_id: "user-1".to_string(),
    }
}

pub fn session(token: &str, valid: bool) -> Session {
    Session {
        valid,
        ..Session::unvalidated(credentials(token))
    }
}

pub fn conversation(id: &str, kind: &str, last_message_id: Option<&str>) -> Channel {
    Channel {
        id: id.to_string(),
        channel_type: kind.to_string(),
        name: None,
        active: true,
        last_message_id: last_message_id.map(str::to_owned),
    }
}

/// Wait until the registry reports `state` for the instance.
pub async fn wait_for_state(registry: &InstanceRegistry, url: &str, state: InstanceState) {
    let mut rx = registry
        .watch_state(url)
        .unwrap_or_else(|| panic!("no entry for {url}"));
    tokio::time::timeout(WAIT, rx.wait_for(|s| *s == state))
        .await
        .unwrap_or_else(|_| panic!("{url} never reached {state:?}"))
        .expect("state channel closed");
}

/// Poll `condition` until it holds.
pub async fn eventually<F: FnMut() -> bool>(mut condition: F) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition never became true");
}

/// Resolve a future or fail the test.
pub async fn within<T>(future: impl Future<Output = T>) -> T {
    tokio::time::timeout(WAIT, future)
        .await
        .expect("timed out")
}
