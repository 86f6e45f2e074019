//! The set of live watchers and the two tasks allowed to change it.
//!
//! Watchers are only ever created by [`Registry::listen_start`] and only ever
//! torn down by [`Registry::listen_close`]. Everything else, from the
//! configuration watch to daily rotation and shutdown, asks for changes
//! through a [`Control`] handle. Requests on each queue are handled one at a
//! time in arrival order, so a source can never end up with two watchers.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::collector::{Collector, Style};
use crate::events::EventHub;
use crate::message::LogMessage;
use crate::offset::OffsetStore;
use crate::store::{ConfigStore, StoreError};
use crate::watcher::{Watcher, WatcherError};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to read configuration: {0}")]
    Store(#[from] StoreError),
    #[error("invalid collector list: {0}")]
    Decode(#[from] serde_json::Error),
}

/// A start or close request, optionally acknowledged once handled.
#[derive(Debug)]
pub struct Request {
    pub collector: Collector,
    ack: Option<oneshot::Sender<bool>>,
}

impl Request {
    fn acknowledge(self, done: bool) {
        if let Some(ack) = self.ack {
            let _ = ack.send(done);
        }
    }
}

/// Sending half of the registry's start and close queues.
#[derive(Clone, Debug)]
pub struct Control {
    start: mpsc::Sender<Request>,
    close: mpsc::Sender<Request>,
}

/// Receiving half of the registry's start and close queues.
#[derive(Debug)]
pub struct Ports {
    pub start: mpsc::Receiver<Request>,
    pub close: mpsc::Receiver<Request>,
}

pub fn channel(capacity: usize) -> (Control, Ports) {
    let (start_tx, start_rx) = mpsc::channel(capacity.max(1));
    let (close_tx, close_rx) = mpsc::channel(capacity.max(1));

    (
        Control {
            start: start_tx,
            close: close_tx,
        },
        Ports {
            start: start_rx,
            close: close_rx,
        },
    )
}

impl Control {
    /// Asks for a watcher on `collector`.
    pub async fn start(&self, collector: Collector) {
        Self::send(&self.start, collector, None).await;
    }

    /// Asks for the watcher on `collector` to be stopped.
    pub async fn close(&self, collector: Collector) {
        Self::send(&self.close, collector, None).await;
    }

    /// Like [`start`](Control::start), returning once the request was handled.
    /// `true` if a new watcher is running.
    pub async fn start_and_wait(&self, collector: Collector) -> bool {
        let (tx, rx) = oneshot::channel();
        Self::send(&self.start, collector, Some(tx)).await;
        rx.await.unwrap_or(false)
    }

    /// Like [`close`](Control::close), returning once the request was handled.
    /// `true` if a watcher was found and stopped.
    pub async fn close_and_wait(&self, collector: Collector) -> bool {
        let (tx, rx) = oneshot::channel();
        Self::send(&self.close, collector, Some(tx)).await;
        rx.await.unwrap_or(false)
    }

    async fn send(
        queue: &mpsc::Sender<Request>,
        collector: Collector,
        ack: Option<oneshot::Sender<bool>>,
    ) {
        if let Err(mpsc::error::SendError(request)) = queue.send(Request { collector, ack }).await {
            debug!(collector = %request.collector, "registry no longer accepts requests");
        }
    }
}

/// Tuning for watchers the registry creates.
#[derive(Clone, Copy, Debug)]
pub struct RegistrySettings {
    pub poll_interval: Duration,
    /// Pause between closing a rotated watcher and starting its successor.
    pub settle_delay: Duration,
}

/// A listing entry for one live watcher.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct WatcherInfo {
    pub style: Style,
    pub path: String,
    pub file: PathBuf,
    pub topic: String,
    pub offset: u64,
}

/// Collector paths that are taken.
#[derive(Debug, Default)]
struct Slots {
    live: HashMap<String, Watcher>,
    /// Out of `live` but still saving their offset and closing their cursor.
    /// Starting these again would read from a stale offset.
    closing: HashSet<String>,
}

/// Live watchers, keyed by their collector's `path`, and the one
/// [`EventHub`] feeding all of their cursors.
#[derive(Debug)]
pub struct Registry {
    watchers: Mutex<Slots>,
    offsets: OffsetStore,
    events: EventHub,
    settings: RegistrySettings,
    cancel: CancellationToken,
    queue: mpsc::Sender<LogMessage>,
}

impl Registry {
    /// `cancel` stops every watcher and the start loop; `queue` receives
    /// every forwarded line.
    pub fn new(
        offsets: OffsetStore,
        events: EventHub,
        settings: RegistrySettings,
        cancel: CancellationToken,
        queue: mpsc::Sender<LogMessage>,
    ) -> Self {
        Registry {
            watchers: Mutex::new(Slots::default()),
            offsets,
            events,
            settings,
            cancel,
            queue,
        }
    }

    /// Whether `path` has a watcher, running or still closing.
    pub fn contains(&self, path: &str) -> bool {
        let watchers = self.watchers.lock();
        watchers.live.contains_key(path) || watchers.closing.contains(path)
    }

    /// The number of running watchers.
    pub fn len(&self) -> usize {
        self.watchers.lock().live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The collectors currently being watched.
    pub fn collectors(&self) -> Vec<Collector> {
        self.watchers
            .lock()
            .live
            .values()
            .map(|w| w.collector().clone())
            .collect()
    }

    /// A snapshot of every live watcher, sorted by path.
    pub fn list(&self) -> Vec<WatcherInfo> {
        let mut infos: Vec<WatcherInfo> = self
            .watchers
            .lock()
            .live
            .values()
            .map(|w| WatcherInfo {
                style: w.collector().style,
                path: w.collector().path.clone(),
                file: w.file().to_path_buf(),
                topic: w.collector().topic.clone(),
                offset: w.offset(),
            })
            .collect();
        infos.sort_by(|a, b| a.path.cmp(&b.path));

        infos
    }

    /// Starts a watcher for `collector` unless one is already running or
    /// still closing. Returns whether a watcher was started.
    async fn add(&self, collector: Collector, control: &Control) -> Result<bool, WatcherError> {
        if self.contains(&collector.path) {
            warn!(collector = %collector, "already watching");
            return Ok(false);
        }

        let mut watcher = Watcher::create(
            collector.clone(),
            &self.offsets,
            &self.events,
            self.settings.poll_interval,
            &self.cancel,
        )
        .await?;
        watcher.start(self.queue.clone());

        if let Some(cycle) = watcher.cycle() {
            self.schedule_rotation(collector.clone(), cycle, watcher.stop_token(), control.clone());
        }

        info!(collector = %collector, file = %watcher.file().display(), "started watcher");
        self.watchers.lock().live.insert(collector.path, watcher);

        Ok(true)
    }

    /// Stops the watcher for `collector`. Returns whether one was found.
    ///
    /// The path stays taken until the offset is saved and the cursor closed,
    /// so a start arriving meanwhile is turned away.
    async fn close(&self, collector: &Collector) -> bool {
        let watcher = {
            let mut watchers = self.watchers.lock();
            match watchers.live.remove(&collector.path) {
                Some(watcher) => {
                    watchers.closing.insert(collector.path.clone());
                    watcher
                }
                None => {
                    warn!(collector = %collector, "no watcher to close");
                    return false;
                }
            }
        };

        let file = watcher.file().to_path_buf();
        match watcher.stop().await {
            Ok(offset) => info!(path = %file.display(), offset, "closed watcher"),
            Err(e) => error!(path = %file.display(), error = %e, "failed to close watcher cleanly"),
        }
        self.watchers.lock().closing.remove(&collector.path);

        true
    }

    /// Renews a date collector once its file name changes: closes the
    /// current watcher, waits for it to be gone, and starts a new one that
    /// resolves to the new name.
    fn schedule_rotation(
        &self,
        collector: Collector,
        cycle: Duration,
        stop: CancellationToken,
        control: Control,
    ) {
        let cancel = self.cancel.clone();
        let settle = self.settings.settle_delay;
        debug!(collector = %collector, ?cycle, "scheduled rotation");

        tokio::spawn(async move {
            tokio::select! {
                _ = stop.cancelled() => return,
                _ = tokio::time::sleep(cycle) => {}
            }

            info!(collector = %collector, "rotating");
            if !control.close_and_wait(collector.clone()).await {
                debug!(collector = %collector, "watcher already gone, not rotating");
                return;
            }

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(settle) => {}
            }
            control.start(collector).await;
        });
    }

    /// Requests a watcher for every collector stored under `key` that isn't
    /// already running, pausing `pace` between requests. Returns how many
    /// requests were made.
    pub async fn register_first(
        &self,
        store: &dyn ConfigStore,
        key: &str,
        control: &Control,
        pace: Duration,
    ) -> Result<usize, RegistryError> {
        let collectors = match store.get(key).await? {
            Some(value) => Collector::parse_list(&value)?,
            None => Vec::new(),
        };

        let mut requested = 0;
        for collector in collectors {
            if self.contains(&collector.path) {
                info!(collector = %collector, "already watching, skipped");
                continue;
            }

            control.start_and_wait(collector).await;
            requested += 1;
            tokio::time::sleep(pace).await;
        }

        info!(count = requested, "registered initial collectors");
        Ok(requested)
    }

    /// Serves start requests until the registry is cancelled.
    pub async fn listen_start(self: Arc<Self>, mut requests: mpsc::Receiver<Request>, control: Control) {
        loop {
            let request = tokio::select! {
                _ = self.cancel.cancelled() => break,
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };

            let started = match self.add(request.collector.clone(), &control).await {
                Ok(started) => started,
                Err(e) => {
                    error!(collector = %request.collector, error = %e, "failed to start watcher");
                    false
                }
            };
            request.acknowledge(started);
        }

        info!("start listener exited");
    }

    /// Serves close requests until `done` fires. Requests already queued are
    /// served first.
    pub async fn listen_close(self: Arc<Self>, mut requests: mpsc::Receiver<Request>, done: CancellationToken) {
        loop {
            let request = tokio::select! {
                biased;
                request = requests.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = done.cancelled() => break,
            };

            let closed = self.close(&request.collector).await;
            request.acknowledge(closed);
        }

        info!("close listener exited");
    }
}
