//! Per-instance session store.
//!
//! Maps instance keys to the session that authorizes a connection to that
//! instance. The whole map is persisted as one document after every mutation.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance_url::{normalize, InstanceKey};
use crate::storage::{DocumentStorage, StoreError};

/// Name of the persisted session document.
pub const SESSIONS_DOCUMENT: &str = "sessions";

/// Credentials plus the flag recording whether they ever produced a live
/// connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: String,
    pub token: String,
    pub user_id: String,
    pub valid: bool,
}

impl Session {
    /// A freshly issued, not yet validated session.
    pub fn unvalidated(credentials: SessionCredentials) -> Self {
        Self {
            session_id: credentials.session_id,
            token: credentials.token,
            user_id: credentials.user_id,
            valid: false,
        }
    }

    pub fn credentials(&self) -> SessionCredentials {
        SessionCredentials {
            session_id: self.session_id.clone(),
            token: self.token.clone(),
            user_id: self.user_id.clone(),
        }
    }
}

/// What a connection handle needs to authenticate.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SessionCredentials {
    #[serde(rename = "_id")]
    pub session_id: String,
    pub token: String,
    pub user_id: String,
}

/// A single session left behind by a host that predates multi-instance
/// support. Adopted once, when the store is otherwise empty.
#[derive(Debug, Clone)]
pub struct LegacySession {
    pub instance_url: String,
    pub session: Session,
}

#[derive(Serialize)]
struct SessionsDocument<'a> {
    sessions: &'a BTreeMap<InstanceKey, Session>,
}

#[derive(Clone)]
pub struct SessionStore {
    inner: Arc<RwLock<BTreeMap<InstanceKey, Session>>>,
    storage: Arc<dyn DocumentStorage>,
}

impl SessionStore {
    /// Load the persisted sessions, dropping records that fail the shape check,
    /// and adopt `legacy` if nothing was loaded.
    pub fn load(storage: Arc<dyn DocumentStorage>, legacy: Option<LegacySession>) -> Self {
        let sessions = match storage.read(SESSIONS_DOCUMENT) {
            Ok(Some(contents)) => parse_sessions(&contents),
            Ok(None) => BTreeMap::new(),
            Err(e) => {
                tracing::warn!(error = %e, "could not read session document, starting empty");
                BTreeMap::new()
            }
        };

        let store = Self {
            inner: Arc::new(RwLock::new(sessions)),
            storage,
        };

        if let Some(legacy) = legacy {
            let mut sessions = store.inner.write();
            if sessions.is_empty() {
                let key = normalize(&legacy.instance_url);
                tracing::info!(instance = %key, "migrating legacy session");
                sessions.insert(key, legacy.session);
                if let Err(e) = store.persist(&sessions) {
                    tracing::warn!(error = %e, "failed to persist migrated session");
                }
            }
        }

        store
    }

    pub fn get(&self, url: &str) -> Option<Session> {
        let key = normalize(url);
        self.inner.read().get(&key).cloned()
    }

    pub fn set(&self, url: &str, session: Session) -> Result<(), StoreError> {
        let key = normalize(url);
        self.update(|sessions| {
            sessions.insert(key, session);
            true
        })
    }

    pub fn remove(&self, url: &str) -> Result<(), StoreError> {
        let key = normalize(url);
        self.update(|sessions| sessions.remove(&key).is_some())
    }

    /// Record that the session completed a live handshake. No write happens
    /// when the session is absent or already valid.
    pub fn mark_valid(&self, url: &str) -> Result<(), StoreError> {
        let key = normalize(url);
        self.update(|sessions| match sessions.get_mut(&key) {
            Some(session) if !session.valid => {
                session.valid = true;
                true
            }
            _ => false,
        })
    }

    /// Sessions that have been validated by a live handshake.
    pub fn list_active(&self) -> Vec<(InstanceKey, Session)> {
        self.inner
            .read()
            .iter()
            .filter(|(_, s)| s.valid)
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }

    pub fn list_all(&self) -> Vec<(InstanceKey, Session)> {
        self.inner
            .read()
            .iter()
            .map(|(k, s)| (k.clone(), s.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Apply `change` to a copy of the map and swap it in only once the copy
    /// is persisted. `change` returns false when nothing changed.
    fn update<F>(&self, change: F) -> Result<(), StoreError>
    where
        F: FnOnce(&mut BTreeMap<InstanceKey, Session>) -> bool,
    {
        let mut sessions = self.inner.write();
        let mut next = sessions.clone();
        if !change(&mut next) {
            return Ok(());
        }
        self.persist(&next)?;
        *sessions = next;
        Ok(())
    }

    // Called with the write guard held so documents are written in mutation order.
    fn persist(&self, sessions: &BTreeMap<InstanceKey, Session>) -> Result<(), StoreError> {
        let contents = serde_json::to_string(&SessionsDocument { sessions })?;
        self.storage.write(SESSIONS_DOCUMENT, &contents)
    }
}

fn parse_sessions(contents: &str) -> BTreeMap<InstanceKey, Session> {
    let document: Value = match serde_json::from_str(contents) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "session document is not valid JSON, starting empty");
            return BTreeMap::new();
        }
    };

    let Some(entries) = document.get("sessions").and_then(Value::as_object) else {
        tracing::warn!("session document has no sessions map, starting empty");
        return BTreeMap::new();
    };

    let mut sessions = BTreeMap::new();
    for (url, raw) in entries {
        match Session::deserialize(raw) {
            Ok(session) => {
                sessions.insert(normalize(url), session);
            }
            Err(e) => tracing::warn!(instance = %url, error = %e, "dropping malformed session"),
        }
    }
    sessions
}
