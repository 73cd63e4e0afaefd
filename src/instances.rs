//! Directory of known instances and their display metadata.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::instance_url::{normalize, InstanceKey};
use crate::storage::{DocumentStorage, StoreError};

/// Name of the persisted directory document.
pub const INSTANCES_DOCUMENT: &str = "instances";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceInfo {
    /// Normalized API base URL; always equal to the entry's key.
    pub url: String,
    pub name: String,
    /// Built-in instances cannot be removed.
    pub builtin: bool,
}

/// Seed entries present on every load.
pub fn builtin_instances() -> BTreeMap<InstanceKey, InstanceInfo> {
    let key = normalize("https://stoat.chat/api");
    BTreeMap::from([(
        key.clone(),
        InstanceInfo {
            url: key.to_string(),
            name: "Stoat".to_string(),
            builtin: true,
        },
    )])
}

#[derive(Clone)]
pub struct InstanceDirectory {
    inner: Arc<RwLock<BTreeMap<InstanceKey, InstanceInfo>>>,
    storage: Arc<dyn DocumentStorage>,
}

impl InstanceDirectory {
    /// Load persisted entries over the built-in seeds. A persisted entry with
    /// a built-in's key replaces that built-in's metadata.
    pub fn load(storage: Arc<dyn DocumentStorage>) -> Self {
        let mut entries = builtin_instances();
        match storage.read(INSTANCES_DOCUMENT) {
            Ok(Some(contents)) => merge_persisted(&mut entries, &contents),
            Ok(None) => {}
            Err(e) => tracing::warn!(error = %e, "could not read instance directory"),
        }
        Self {
            inner: Arc::new(RwLock::new(entries)),
            storage,
        }
    }

    pub fn list(&self) -> Vec<InstanceInfo> {
        self.inner.read().values().cloned().collect()
    }

    pub fn get(&self, url: &str) -> Option<InstanceInfo> {
        self.inner.read().get(&normalize(url)).cloned()
    }

    /// Add an instance, or rename it if already known. A built-in keeps its
    /// built-in flag.
    pub fn add(&self, url: &str, name: &str) -> Result<InstanceInfo, StoreError> {
        let key = normalize(url);
        let mut entries = self.inner.write();
        let info = InstanceInfo {
            url: key.to_string(),
            name: name.to_string(),
            builtin: entries.get(&key).is_some_and(|existing| existing.builtin),
        };
        let mut next = entries.clone();
        next.insert(key, info.clone());
        self.persist(&next)?;
        *entries = next;
        Ok(info)
    }

    /// Remove a user instance. Returns false for built-in or unknown instances.
    pub fn remove(&self, url: &str) -> Result<bool, StoreError> {
        let key = normalize(url);
        let mut entries = self.inner.write();
        match entries.get(&key) {
            Some(info) if !info.builtin => {
                let mut next = entries.clone();
                next.remove(&key);
                self.persist(&next)?;
                *entries = next;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    /// Change an instance's display name. Returns false for unknown instances.
    pub fn rename(&self, url: &str, name: &str) -> Result<bool, StoreError> {
        let key = normalize(url);
        let mut entries = self.inner.write();
        let mut next = entries.clone();
        let Some(info) = next.get_mut(&key) else {
            return Ok(false);
        };
        info.name = name.to_string();
        self.persist(&next)?;
        *entries = next;
        Ok(true)
    }

    fn persist(&self, entries: &BTreeMap<InstanceKey, InstanceInfo>) -> Result<(), StoreError> {
        let contents = serde_json::to_string(entries)?;
        self.storage.write(INSTANCES_DOCUMENT, &contents)
    }
}

fn merge_persisted(entries: &mut BTreeMap<InstanceKey, InstanceInfo>, contents: &str) {
    let document: Value = match serde_json::from_str(contents) {
        Ok(v) => v,
        Err(e) => {
            tracing::warn!(error = %e, "instance directory is not valid JSON, using built-ins");
            return;
        }
    };
    let Some(persisted) = document.as_object() else {
        tracing::warn!("instance directory is not a map, using built-ins");
        return;
    };

    for (url, raw) in persisted {
        match InstanceInfo::deserialize(raw) {
            Ok(mut info) => {
                let key = normalize(url);
                info.url = key.to_string();
                // Overriding a seed changes its metadata, never its removability.
                info.builtin |= entries.get(&key).is_some_and(|seed| seed.builtin);
                entries.insert(key, info);
            }
            Err(e) => tracing::warn!(instance = %url, error = %e, "dropping malformed instance"),
        }
    }
}
