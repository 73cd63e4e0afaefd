//! Instance connection registry.
//!
//! Owns at most one live [`ProtocolClient`] per instance key and drives each
//! through the connection state machine:
//!
//! ```text
//! Disconnected --open, session exists--> Connecting
//! Connecting   --handshake ok----------> Connected
//! Connecting / Connected --fatal-------> Error
//! Connecting / Connected --transient---> Connecting   (handle retries)
//! Error        --reconnect-------------> Connecting
//! any          --close / logout--------> Disconnected, entry removed
//! ```
//!
//! Retry timing belongs to the handle; the registry only reflects what the
//! handle reports. State changes are published on a broadcast channel and the
//! list of reachable instances on a watch channel, so UI bindings subscribe
//! without the registry knowing about them.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::{broadcast, watch};
use tokio_util::sync::CancellationToken;

use crate::auth::{Authenticator, Credentials, LoginError, LoginRequest, LoginResponse};
use crate::client::{Channel, ClientFactory, FailureKind, ProtocolClient, Server, TransportEvent};
use crate::instance_url::{normalize, InstanceKey};
use crate::instances::InstanceDirectory;
use crate::sessions::{Session, SessionStore};
use crate::storage::StoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    Disconnected,
    Connecting,
    Connected,
    Error,
}

/// Registry-level notifications.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryEvent {
    StateChanged {
        instance: InstanceKey,
        state: InstanceState,
    },
    /// The entry was removed by close, logout, or dispose.
    Closed { instance: InstanceKey },
}

struct ManagedConnection {
    /// Distinguishes this entry from a later one under the same key.
    id: u64,
    client: Arc<dyn ProtocolClient>,
    state: watch::Sender<InstanceState>,
    /// Stops the event listener and any pending configuration fetch.
    cancel: CancellationToken,
}

struct RegistryInner {
    connections: HashMap<InstanceKey, ManagedConnection>,
    next_id: u64,
}

#[derive(Clone)]
pub struct InstanceRegistry {
    inner: Arc<RwLock<RegistryInner>>,
    sessions: SessionStore,
    directory: InstanceDirectory,
    factory: Arc<dyn ClientFactory>,
    authenticator: Arc<dyn Authenticator>,
    events_tx: broadcast::Sender<RegistryEvent>,
    connected_tx: Arc<watch::Sender<Vec<InstanceKey>>>,
}

impl InstanceRegistry {
    pub fn new(
        sessions: SessionStore,
        directory: InstanceDirectory,
        factory: Arc<dyn ClientFactory>,
        authenticator: Arc<dyn Authenticator>,
    ) -> Self {
        let (events_tx, _) = broadcast::channel(64);
        let (connected_tx, _) = watch::channel(Vec::new());
        Self {
            inner: Arc::new(RwLock::new(RegistryInner {
                connections: HashMap::new(),
                next_id: 0,
            })),
            sessions,
            directory,
            factory,
            authenticator,
            events_tx,
            connected_tx: Arc::new(connected_tx),
        }
    }

    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }

    pub fn directory(&self) -> &InstanceDirectory {
        &self.directory
    }

    /// Open a connection to the instance at `url`.
    ///
    /// Returns the existing handle if one is already managed for the key, so
    /// concurrent triggers never produce duplicate sockets. Returns `None`,
    /// without side effects, when no session is stored for the key.
    /// Otherwise the handle is returned immediately while the configuration
    /// fetch and connect proceed in the background.
    pub fn open_connection(&self, url: &str) -> Option<Arc<dyn ProtocolClient>> {
        let key = normalize(url);
        if let Some(existing) = self.connection(key.as_str()) {
            return Some(existing);
        }

        let session = self.sessions.get(key.as_str())?;

        let (client, id, cancel, events) = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.connections.get(&key) {
                return Some(existing.client.clone());
            }

            let client = self.factory.create(&key);
            let events = client.subscribe();
            let id = inner.next_id;
            inner.next_id += 1;
            let (state, _) = watch::channel(InstanceState::Connecting);
            let cancel = CancellationToken::new();
            inner.connections.insert(
                key.clone(),
                ManagedConnection {
                    id,
                    client: client.clone(),
                    state,
                    cancel: cancel.clone(),
                },
            );
            (client, id, cancel, events)
        };

        tracing::debug!(instance = %key, "opening connection");
        self.publish_state(&key, InstanceState::Connecting);
        self.spawn_listener(key.clone(), id, events, cancel.clone());
        client.assign_session(&session.credentials());
        self.spawn_connect(key.clone(), id, client.clone(), cancel);

        Some(client)
    }

    /// Stop listening to the instance's handle, tear the transport down, and
    /// remove the entry. Returns false if nothing was managed for the key.
    pub fn close_connection(&self, url: &str) -> bool {
        let key = normalize(url);
        let removed = self.inner.write().connections.remove(&key);
        let Some(entry) = removed else {
            return false;
        };

        entry.cancel.cancel();
        entry.client.disconnect();
        entry.state.send_replace(InstanceState::Disconnected);
        tracing::info!(instance = %key, "connection closed");

        let _ = self.events_tx.send(RegistryEvent::Closed { instance: key });
        self.refresh_connected();
        true
    }

    /// Leave [`InstanceState::Error`] by fetching configuration and connecting
    /// again. Returns false if the entry is missing or not in `Error`.
    pub fn reconnect(&self, url: &str) -> bool {
        let key = normalize(url);
        let (client, id, cancel) = {
            let inner = self.inner.read();
            let Some(entry) = inner.connections.get(&key) else {
                return false;
            };
            if *entry.state.borrow() != InstanceState::Error {
                return false;
            }
            entry.state.send_replace(InstanceState::Connecting);
            (entry.client.clone(), entry.id, entry.cancel.clone())
        };

        tracing::info!(instance = %key, "reconnecting");
        if let Some(session) = self.sessions.get(key.as_str()) {
            client.assign_session(&session.credentials());
        }
        self.publish_state(&key, InstanceState::Connecting);
        self.spawn_connect(key.clone(), id, client, cancel);
        true
    }

    /// Open every stored session: validated ones first, then the rest.
    /// Returns the number of connections opened.
    pub fn restore_sessions(&self) -> usize {
        let mut opened = 0;
        for (key, _) in self.sessions.list_active() {
            if self.connection(key.as_str()).is_none()
                && self.open_connection(key.as_str()).is_some()
            {
                opened += 1;
            }
        }
        for (key, session) in self.sessions.list_all() {
            if !session.valid
                && self.connection(key.as_str()).is_none()
                && self.open_connection(key.as_str()).is_some()
            {
                opened += 1;
            }
        }
        tracing::info!(count = opened, "restored saved sessions");
        opened
    }

    pub fn connection(&self, url: &str) -> Option<Arc<dyn ProtocolClient>> {
        let key = normalize(url);
        self.inner
            .read()
            .connections
            .get(&key)
            .map(|entry| entry.client.clone())
    }

    pub fn state(&self, url: &str) -> Option<InstanceState> {
        let key = normalize(url);
        self.inner
            .read()
            .connections
            .get(&key)
            .map(|entry| *entry.state.borrow())
    }

    /// Observe one instance's state. The receiver reports
    /// [`InstanceState::Disconnected`] once the entry is closed.
    pub fn watch_state(&self, url: &str) -> Option<watch::Receiver<InstanceState>> {
        let key = normalize(url);
        self.inner
            .read()
            .connections
            .get(&key)
            .map(|entry| entry.state.subscribe())
    }

    /// Keys whose managed connection is not `Disconnected`, sorted.
    pub fn connected_instances(&self) -> Vec<InstanceKey> {
        let mut keys: Vec<InstanceKey> = self
            .inner
            .read()
            .connections
            .iter()
            .filter(|(_, entry)| *entry.state.borrow() != InstanceState::Disconnected)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    pub fn watch_connected(&self) -> watch::Receiver<Vec<InstanceKey>> {
        self.connected_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RegistryEvent> {
        self.events_tx.subscribe()
    }

    /// Which instance holds the server with this id. Instances are not
    /// expected to share ids; if they do, an arbitrary one wins.
    pub fn resolve_instance_for_server(&self, server_id: &str) -> Option<InstanceKey> {
        self.inner
            .read()
            .connections
            .iter()
            .find(|(_, entry)| entry.client.has_server(server_id))
            .map(|(key, _)| key.clone())
    }

    pub fn resolve_instance_for_channel(&self, channel_id: &str) -> Option<InstanceKey> {
        self.inner
            .read()
            .connections
            .iter()
            .find(|(_, entry)| entry.client.has_channel(channel_id))
            .map(|(key, _)| key.clone())
    }

    /// Handle owning the server or channel with this id. Meant to be called
    /// fresh on every request rather than cached.
    pub fn resolve_active_connection(&self, entity_id: &str) -> Option<Arc<dyn ProtocolClient>> {
        let key = self
            .resolve_instance_for_server(entity_id)
            .or_else(|| self.resolve_instance_for_channel(entity_id))?;
        self.connection(key.as_str())
    }

    /// Servers from every `Connected` instance.
    pub fn all_servers(&self) -> Vec<Server> {
        self.connected_clients()
            .iter()
            .flat_map(|client| client.servers())
            .collect()
    }

    /// Active direct messages and groups from every `Connected` instance,
    /// most recently updated first.
    pub fn all_conversations(&self) -> Vec<Channel> {
        let mut conversations: Vec<Channel> = self
            .connected_clients()
            .iter()
            .flat_map(|client| client.channels())
            .filter(Channel::is_conversation)
            .collect();
        conversations.sort_by_key(|channel| std::cmp::Reverse(channel.updated_at_ms()));
        conversations
    }

    /// Authenticate against the instance and connect with the new session.
    ///
    /// Returns as soon as the session is stored and the connection is opening;
    /// it does not wait for `Connected`. Nothing is written unless the
    /// instance issued a session.
    pub async fn login(
        &self,
        url: &str,
        credentials: Credentials,
        client_label: &str,
    ) -> Result<(), LoginError> {
        let key = normalize(url);
        let request = LoginRequest {
            credentials,
            friendly_name: client_label.to_string(),
        };

        let issued = match self.authenticator.login(&key, &request).await {
            Ok(LoginResponse::Success(issued)) => issued,
            Ok(LoginResponse::Mfa(challenge)) => {
                tracing::info!(instance = %key, "login requires a second factor");
                return Err(LoginError::MfaRequired(challenge));
            }
            Ok(LoginResponse::Disabled { user_id }) => {
                tracing::warn!(instance = %key, user = %user_id, "account is disabled");
                return Err(LoginError::Disabled);
            }
            Err(e) => {
                tracing::warn!(instance = %key, error = %e, "login failed");
                return Err(e.into());
            }
        };

        // Directory first: a listed instance without a session is harmless.
        if self.directory.get(key.as_str()).is_none() {
            let name = key.hostname().unwrap_or_else(|| key.to_string());
            self.directory.add(key.as_str(), &name)?;
        }

        self.sessions
            .set(key.as_str(), Session::unvalidated(issued))?;

        // The old handle still carries the previous session.
        self.close_connection(key.as_str());
        self.open_connection(key.as_str());

        tracing::info!(instance = %key, "logged in");
        Ok(())
    }

    /// Close the connection, then forget the session.
    pub fn logout(&self, url: &str) -> Result<(), StoreError> {
        self.close_connection(url);
        self.sessions.remove(url)?;
        tracing::info!(instance = %normalize(url), "logged out");
        Ok(())
    }

    /// Close every managed connection.
    pub fn dispose_all(&self) {
        let keys: Vec<InstanceKey> = self.inner.read().connections.keys().cloned().collect();
        for key in keys {
            self.close_connection(key.as_str());
        }
    }

    fn connected_clients(&self) -> Vec<Arc<dyn ProtocolClient>> {
        self.inner
            .read()
            .connections
            .values()
            .filter(|entry| *entry.state.borrow() == InstanceState::Connected)
            .map(|entry| entry.client.clone())
            .collect()
    }

    /// Apply one handle's events, in order, until the entry is closed.
    fn spawn_listener(
        &self,
        key: InstanceKey,
        id: u64,
        mut events: broadcast::Receiver<TransportEvent>,
        cancel: CancellationToken,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    event = events.recv() => match event {
                        Ok(event) => registry.apply_transport_event(&key, id, event),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            tracing::warn!(instance = %key, skipped, "transport events lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Fetch the instance configuration, then connect. A fetch failure moves
    /// the entry to `Error` without connecting.
    fn spawn_connect(
        &self,
        key: InstanceKey,
        id: u64,
        client: Arc<dyn ProtocolClient>,
        cancel: CancellationToken,
    ) {
        let registry = self.clone();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                result = client.fetch_configuration() => result,
            };

            // Checked under the lock: a concurrent close either already
            // removed the entry or waits until connect() has been issued.
            let inner = registry.inner.read();
            let Some(entry) = inner.connections.get(&key).filter(|entry| entry.id == id) else {
                tracing::debug!(instance = %key, "connection closed while fetching configuration");
                return;
            };

            match fetched {
                Ok(()) => entry.client.connect(),
                Err(e) => {
                    tracing::error!(instance = %key, error = %e, "failed to fetch instance configuration");
                    let changed = entry.state.send_replace(InstanceState::Error) != InstanceState::Error;
                    drop(inner);
                    if changed {
                        registry.publish_state(&key, InstanceState::Error);
                    }
                }
            }
        });
    }

    fn apply_transport_event(&self, key: &InstanceKey, id: u64, event: TransportEvent) {
        let (next, previous) = {
            let inner = self.inner.read();
            let Some(entry) = inner.connections.get(key).filter(|entry| entry.id == id) else {
                return;
            };
            let next = match event {
                TransportEvent::Connecting => InstanceState::Connecting,
                TransportEvent::Connected => InstanceState::Connected,
                TransportEvent::Disconnected => match entry.client.last_failure() {
                    Some(FailureKind::Fatal) => InstanceState::Error,
                    _ => InstanceState::Connecting,
                },
            };
            (next, entry.state.send_replace(next))
        };

        if next == previous {
            return;
        }

        match next {
            InstanceState::Connected => {
                tracing::info!(instance = %key, "instance connected");
                if let Err(e) = self.sessions.mark_valid(key.as_str()) {
                    tracing::warn!(instance = %key, error = %e, "failed to mark session valid");
                }
            }
            InstanceState::Error => {
                tracing::error!(instance = %key, "connection failed, explicit reconnect required");
            }
            _ => tracing::debug!(instance = %key, state = ?next, "connection state changed"),
        }
        self.publish_state(key, next);
    }

    fn publish_state(&self, key: &InstanceKey, state: InstanceState) {
        let _ = self.events_tx.send(RegistryEvent::StateChanged {
            instance: key.clone(),
            state,
        });
        self.refresh_connected();
    }

    fn refresh_connected(&self) {
        let connected = self.connected_instances();
        self.connected_tx.send_if_modified(|current| {
            if *current == connected {
                return false;
            }
            *current = connected;
            true
        });
    }
}
