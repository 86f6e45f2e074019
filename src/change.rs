//! Turning configuration revisions into start and close requests.
//!
//! Each revision of an agent's configuration key holds the complete collector
//! list. A change is recovered by diffing the new list against the value at
//! the previous revision. This only works when every revision adds or removes
//! exactly one collector: with several differences one of them is reported
//! and the others are lost, so configuration must be edited one collector at
//! a time.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::Collector;
use crate::registry::Control;
use crate::store::{ConfigStore, StoreError, WatchEvent, WatchKind};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChangeKind {
    /// The key was just created with an empty list.
    Created,
    /// A collector was added.
    Put,
    /// A collector was removed.
    Del,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Created => "CREATED",
            ChangeKind::Put => "PUT",
            ChangeKind::Del => "DEL",
        };
        f.write_str(name)
    }
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Change {
    pub kind: ChangeKind,
    /// The collector that differs. `None` for `Created`, and when the lists
    /// hold the same collectors.
    pub collector: Option<Collector>,
}

#[derive(Debug, Error)]
pub enum ChangeError {
    #[error("invalid collector list: {0}")]
    Decode(#[from] serde_json::Error),
    #[error("previous revision unavailable: {0}")]
    Previous(#[from] StoreError),
    #[error("change could not be determined")]
    Undetermined,
}

/// Diffs two collector lists. `previous` is `None` when the prior revision
/// could not be read, in which case only a freshly created, empty list can be
/// told apart; anything else returns `None`.
pub fn diff(previous: Option<&[Collector]>, current: &[Collector]) -> Option<Change> {
    let previous = match previous {
        Some(previous) => previous,
        None if current.is_empty() => {
            return Some(Change {
                kind: ChangeKind::Created,
                collector: None,
            })
        }
        None => return None,
    };

    let (kind, base, grown) = if previous.len() < current.len() {
        (ChangeKind::Put, previous, current)
    } else {
        (ChangeKind::Del, current, previous)
    };

    let known: HashSet<&Collector> = base.iter().collect();
    let collector = grown.iter().filter(|c| !known.contains(c)).last().cloned();

    Some(Change { kind, collector })
}

/// Works out what a watch event changed, fetching the value it replaced.
pub async fn detect(store: &dyn ConfigStore, event: &WatchEvent) -> Result<Change, ChangeError> {
    let current = Collector::parse_list(&event.value)?;

    let previous = match store.get_at_revision(&event.key, event.revision - 1).await {
        Ok(bytes) => Collector::parse_list(&bytes)?,
        Err(e) => return diff(None, &current).ok_or(ChangeError::Previous(e)),
    };

    diff(Some(previous.as_slice()), &current).ok_or(ChangeError::Undetermined)
}

/// Routes every change in `events`, a watch on the agent's configuration
/// key, to the registry until `cancel` fires.
pub async fn watch_config(
    store: Arc<dyn ConfigStore>,
    key: String,
    mut events: mpsc::UnboundedReceiver<WatchEvent>,
    control: Control,
    cancel: CancellationToken,
) {
    loop {
        let event = tokio::select! {
            _ = cancel.cancelled() => {
                info!("closing configuration watch");
                return;
            }
            event = events.recv() => match event {
                Some(event) => event,
                None => {
                    warn!(key = %key, "configuration watch ended");
                    return;
                }
            },
        };

        if event.kind == WatchKind::Delete {
            // The key is not expected to go away while the agent runs.
            debug!(key = %key, revision = event.revision, "ignoring deletion of configuration key");
            continue;
        }

        let change = match detect(store.as_ref(), &event).await {
            Ok(change) => change,
            Err(e) => {
                warn!(revision = event.revision, error = %e, "could not work out configuration change");
                continue;
            }
        };
        info!(revision = event.revision, kind = %change.kind, "configuration changed");

        match (change.kind, change.collector) {
            (ChangeKind::Put, Some(collector)) => control.start(collector).await,
            (ChangeKind::Del, Some(collector)) => control.close(collector).await,
            (ChangeKind::Created, _) => {}
            (kind, None) => {
                debug!(kind = %kind, "configuration changed without a collector difference");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn list(n: usize) -> Vec<Collector> {
        (0..n)
            .map(|i| Collector::file(format!("/var/log/{}.log", i), format!("topic-{}", i)))
            .collect()
    }

    fn json(collectors: &[Collector]) -> Vec<u8> {
        serde_json::to_vec(collectors).unwrap()
    }

    #[test]
    fn test_added_collector_is_a_put() {
        for n in 0..5 {
            let old = list(n);
            let extra = Collector::date("/var/log/new-%F.log", "new");

            // Insert at every position; order must not matter.
            for at in 0..=n {
                let mut new = old.clone();
                new.insert(at, extra.clone());

                let change = diff(Some(old.as_slice()), &new).unwrap();
                assert_eq!(change.kind, ChangeKind::Put);
                assert_eq!(change.collector.as_ref(), Some(&extra));
            }
        }
    }

    #[test]
    fn test_removed_collector_is_a_del() {
        for n in 1..6 {
            let old = list(n);
            for at in 0..n {
                let mut new = old.clone();
                let removed = new.remove(at);

                let change = diff(Some(old.as_slice()), &new).unwrap();
                assert_eq!(change.kind, ChangeKind::Del);
                assert_eq!(change.collector, Some(removed));
            }
        }
    }

    #[test]
    fn test_unreadable_previous_with_empty_list_is_created() {
        let change = diff(None, &[]).unwrap();
        assert_eq!(
            change,
            Change {
                kind: ChangeKind::Created,
                collector: None
            }
        );
        assert!(diff(None, &list(1)).is_none());
    }

    #[test]
    fn test_equal_lists_have_no_collector() {
        let old = list(3);
        let change = diff(Some(old.as_slice()), &old).unwrap();
        assert_eq!(change.kind, ChangeKind::Del);
        assert_eq!(change.collector, None);
    }

    #[test]
    fn test_modified_topic_counts_as_removal() {
        let old = list(2);
        let mut new = old.clone();
        new[1].topic = "renamed".to_string();

        let change = diff(Some(old.as_slice()), &new).unwrap();
        assert_eq!(change.kind, ChangeKind::Del);
        assert_eq!(change.collector, Some(old[1].clone()));
    }

    #[tokio::test]
    async fn test_detect_reads_previous_revision() {
        let store = MemoryStore::new();
        let key = "/logagent/config/test";

        store.put(key, json(&list(1))).await.unwrap();
        store.put("/unrelated", b"x".to_vec()).await.unwrap();
        let revision = store.put(key, json(&list(2))).await.unwrap();

        let event = WatchEvent {
            kind: WatchKind::Put,
            key: key.to_string(),
            value: json(&list(2)),
            revision,
        };
        let change = detect(&store, &event).await.unwrap();
        assert_eq!(change.kind, ChangeKind::Put);
        assert_eq!(change.collector, Some(list(2)[1].clone()));
    }

    #[tokio::test]
    async fn test_detect_first_revision() {
        let store = MemoryStore::new();
        let key = "/logagent/config/test";

        let revision = store.put(key, b"[]".to_vec()).await.unwrap();
        let event = WatchEvent {
            kind: WatchKind::Put,
            key: key.to_string(),
            value: b"[]".to_vec(),
            revision,
        };
        assert_eq!(
            detect(&store, &event).await.unwrap().kind,
            ChangeKind::Created
        );

        let event = WatchEvent {
            value: json(&list(1)),
            ..event
        };
        assert!(matches!(
            detect(&store, &event).await,
            Err(ChangeError::Previous(_))
        ));
    }

    #[tokio::test]
    async fn test_detect_rejects_garbage() {
        let store = MemoryStore::new();
        let event = WatchEvent {
            kind: WatchKind::Put,
            key: "k".to_string(),
            value: b"{not json".to_vec(),
            revision: 1,
        };
        assert!(matches!(
            detect(&store, &event).await,
            Err(ChangeError::Decode(_))
        ));
    }

    #[tokio::test]
    async fn test_watch_config_routes_changes() {
        let store = Arc::new(MemoryStore::new());
        let key = "/logagent/config/test".to_string();
        let events = store.watch(&key).await.unwrap();
        let (control, mut ports) = crate::registry::channel(8);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(watch_config(
            store.clone(),
            key.clone(),
            events,
            control,
            cancel.clone(),
        ));

        store.put(&key, b"[]".to_vec()).await.unwrap();
        store.put(&key, json(&list(1))).await.unwrap();
        store.delete(&key);
        store.put(&key, json(&list(2))).await.unwrap();
        store.put(&key, json(&list(1))).await.unwrap();

        let started = ports.start.recv().await.unwrap();
        assert_eq!(started.collector, list(1)[0]);
        // After the deletion the previous revision is unreadable.
        let closed = ports.close.recv().await.unwrap();
        assert_eq!(closed.collector, list(2)[1]);
        assert!(ports.start.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap();
    }
}
