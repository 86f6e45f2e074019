//! The configuration store the agent reads its collectors from.
//!
//! The agent only needs four primitives from the store: point reads, writes,
//! a watch on one key, and reads at an older revision (to diff against the
//! value a change replaced). [`ConfigStore`] captures exactly that, so any
//! revisioned key/value store (etcd, Consul, ...) can sit behind it.
//! [`MemoryStore`] is an in-process implementation with the same revision
//! semantics.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

/// Key prefix holding each agent's collector list.
pub const CONFIG_PREFIX: &str = "/logagent/config/";
/// Key prefix holding each agent's liveness marker.
pub const ACTIVE_PREFIX: &str = "/logagent/active/";

/// Liveness marker values.
pub const ACTIVE: &[u8] = b"1";
pub const INACTIVE: &[u8] = b"0";

pub fn config_key(agent_id: &str) -> String {
    format!("{}{}", CONFIG_PREFIX, agent_id)
}

pub fn active_key(agent_id: &str) -> String {
    format!("{}{}", ACTIVE_PREFIX, agent_id)
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("key {key} has no value at revision {revision}")]
    NoValueAtRevision { key: String, revision: i64 },
    #[error("configuration store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WatchKind {
    Put,
    Delete,
}

/// One change to a watched key.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatchEvent {
    pub kind: WatchKind,
    pub key: String,
    /// The new value. Empty for deletions.
    pub value: Vec<u8>,
    /// The store revision at which the change happened.
    pub revision: i64,
}

#[async_trait]
pub trait ConfigStore: Send + Sync {
    /// Current value of `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError>;

    /// Sets `key`, returning the new store revision.
    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError>;

    /// Changes to `key` from now on, in revision order.
    async fn watch(&self, key: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError>;

    /// The value `key` had as of `revision`.
    async fn get_at_revision(&self, key: &str, revision: i64) -> Result<Vec<u8>, StoreError>;
}

#[derive(Debug, Default)]
struct Inner {
    revision: i64,
    /// Every value each key has had, oldest first. `None` marks a deletion.
    history: HashMap<String, Vec<(i64, Option<Vec<u8>>)>>,
    watchers: HashMap<String, Vec<mpsc::UnboundedSender<WatchEvent>>>,
}

impl Inner {
    fn record(&mut self, key: &str, value: Option<Vec<u8>>) -> i64 {
        self.revision += 1;
        let revision = self.revision;

        let event = WatchEvent {
            kind: if value.is_some() {
                WatchKind::Put
            } else {
                WatchKind::Delete
            },
            key: key.to_string(),
            value: value.clone().unwrap_or_default(),
            revision,
        };

        self.history
            .entry(key.to_string())
            .or_default()
            .push((revision, value));

        if let Some(senders) = self.watchers.get_mut(key) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }

        revision
    }
}

/// Revisioned in-memory key/value store. Keeps full history, so every
/// revision stays readable.
#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Removes `key`, returning the new store revision.
    pub fn delete(&self, key: &str) -> i64 {
        self.inner.lock().record(key, None)
    }

    /// The latest store revision.
    pub fn revision(&self) -> i64 {
        self.inner.lock().revision
    }
}

#[async_trait]
impl ConfigStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let inner = self.inner.lock();
        Ok(inner
            .history
            .get(key)
            .and_then(|versions| versions.last())
            .and_then(|(_, value)| value.clone()))
    }

    async fn put(&self, key: &str, value: Vec<u8>) -> Result<i64, StoreError> {
        Ok(self.inner.lock().record(key, Some(value)))
    }

    async fn watch(&self, key: &str) -> Result<mpsc::UnboundedReceiver<WatchEvent>, StoreError> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner
            .lock()
            .watchers
            .entry(key.to_string())
            .or_default()
            .push(tx);

        Ok(rx)
    }

    async fn get_at_revision(&self, key: &str, revision: i64) -> Result<Vec<u8>, StoreError> {
        let inner = self.inner.lock();
        inner
            .history
            .get(key)
            .and_then(|versions| {
                versions
                    .iter()
                    .rev()
                    .find(|(rev, _)| *rev <= revision)
                    .and_then(|(_, value)| value.clone())
            })
            .ok_or_else(|| StoreError::NoValueAtRevision {
                key: key.to_string(),
                revision,
            })
    }
}
