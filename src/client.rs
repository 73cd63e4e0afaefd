//! Contract between the registry and the protocol client that owns one
//! instance's socket, REST calls, and entity cache.
//!
//! The registry never speaks the chat protocol itself. It creates handles
//! through a [`ClientFactory`], assigns credentials, asks for a connection,
//! and listens to [`TransportEvent`]s.

use std::sync::Arc;

use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::instance_url::InstanceKey;
use crate::sessions::SessionCredentials;

/// Connection progress reported by a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportEvent {
    Connecting,
    Connected,
    Disconnected,
}

/// How the handle judged its most recent failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Network-level; the handle retries on its own.
    Transient,
    /// Protocol- or auth-level; the handle stopped and waits for an explicit
    /// `connect()`.
    Fatal,
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("request to {url} failed: {message}")]
    Request { url: String, message: String },
    #[error("{0} did not return a service configuration")]
    InvalidConfiguration(String),
    #[error("no session assigned")]
    NoSession,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Server {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(rename = "_id")]
    pub id: String,
    pub channel_type: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Only meaningful for direct messages.
    #[serde(default)]
    pub active: bool,
    #[serde(default)]
    pub last_message_id: Option<String>,
}

impl Channel {
    /// Active direct messages and groups.
    pub fn is_conversation(&self) -> bool {
        match self.channel_type.as_str() {
            "DirectMessage" => self.active,
            "Group" => true,
            _ => false,
        }
    }

    /// Millisecond timestamp of the latest activity, taken from the ULID of
    /// the last message, or of the channel itself when it has no messages.
    pub fn updated_at_ms(&self) -> u64 {
        self.last_message_id
            .as_deref()
            .and_then(ulid_timestamp_ms)
            .or_else(|| ulid_timestamp_ms(&self.id))
            .unwrap_or(0)
    }
}

/// Millisecond timestamp encoded in a ULID.
pub fn ulid_timestamp_ms(id: &str) -> Option<u64> {
    ulid::Ulid::from_string(&id.to_ascii_uppercase())
        .ok()
        .map(|ulid| ulid.timestamp_ms())
}

/// One connection to one instance.
pub trait ProtocolClient: Send + Sync {
    fn assign_session(&self, credentials: &SessionCredentials);

    /// Fetch the instance's service configuration. Must complete before
    /// `connect()` is called.
    fn fetch_configuration(&self) -> BoxFuture<'static, Result<(), TransportError>>;

    /// Start connecting. Returns immediately; progress arrives as events.
    fn connect(&self);

    /// Tear the transport down. No further reconnection attempts are made.
    fn disconnect(&self);

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent>;

    fn last_failure(&self) -> Option<FailureKind>;

    fn has_server(&self, id: &str) -> bool;

    fn has_channel(&self, id: &str) -> bool;

    fn servers(&self) -> Vec<Server>;

    fn channels(&self) -> Vec<Channel>;
}

pub trait ClientFactory: Send + Sync {
    fn create(&self, instance: &InstanceKey) -> Arc<dyn ProtocolClient>;
}
