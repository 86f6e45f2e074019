//! A live watcher: one collector being followed and forwarded.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{Collector, CollectorError};
use crate::events::{absolutify, EventHub};
use crate::message::{LogMessage, Source};
use crate::offset::OffsetStore;
use crate::reader::{TailCursor, TailError, TailOptions};

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error(transparent)]
    Config(#[from] CollectorError),
    #[error("failed to resolve {path}: {source}")]
    Resolve {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: TailError,
    },
    #[error("failed to close {path}: {source}")]
    Close {
        path: PathBuf,
        #[source]
        source: TailError,
    },
    #[error("forwarding task for {path} failed: {source}")]
    Task {
        path: PathBuf,
        #[source]
        source: JoinError,
    },
}

/// Follows the file a [`Collector`] resolves to and forwards its lines.
///
/// A watcher is created with its cursor open, starts forwarding on
/// [`start`], and persists its position when [`stop`]ped. It has its own
/// cancellation token, a child of the agent-wide one, so it can be stopped
/// alone or together with everything else.
///
/// [`start`]: Watcher::start
/// [`stop`]: Watcher::stop
#[derive(Debug)]
pub struct Watcher {
    source: Arc<Source>,
    cycle: Option<Duration>,
    /// Position through the last line handed to the queue.
    forwarded: Arc<AtomicU64>,
    offsets: OffsetStore,
    poll_interval: Duration,
    stop: CancellationToken,
    cursor: Option<TailCursor>,
    forward: Option<JoinHandle<Result<u64, WatcherError>>>,
}

impl Watcher {
    /// Resolves `collector`, loads its saved offset, and opens a cursor on it
    /// fed by `events`.
    pub async fn create(
        collector: Collector,
        offsets: &OffsetStore,
        events: &EventHub,
        poll_interval: Duration,
        parent: &CancellationToken,
    ) -> Result<Self, WatcherError> {
        let resolved = collector.resolve(Local::now())?;
        let file = absolutify(&resolved.file, true).map_err(|source| WatcherError::Resolve {
            path: resolved.file.clone(),
            source,
        })?;

        let offset = match offsets.load(&file) {
            Ok(offset) => {
                info!(path = %file.display(), offset, "loaded offset");
                offset
            }
            Err(e) => {
                warn!(path = %file.display(), reason = %e, "no usable offset, reading from the start");
                0
            }
        };

        let options = TailOptions {
            offset,
            poll_interval,
        };
        let cursor = TailCursor::open(events, &file, options)
            .await
            .map_err(|source| WatcherError::Open {
                path: file.clone(),
                source,
            })?;

        Ok(Watcher {
            source: Arc::new(Source { collector, file }),
            cycle: resolved.cycle,
            forwarded: Arc::new(AtomicU64::new(cursor.tell())),
            offsets: offsets.clone(),
            poll_interval,
            stop: parent.child_token(),
            cursor: Some(cursor),
            forward: None,
        })
    }

    pub fn collector(&self) -> &Collector {
        &self.source.collector
    }

    /// The file being followed.
    pub fn file(&self) -> &Path {
        &self.source.file
    }

    /// How long until the followed file name changes, for date collectors.
    pub fn cycle(&self) -> Option<Duration> {
        self.cycle
    }

    /// Position through the last line forwarded.
    pub fn offset(&self) -> u64 {
        self.forwarded.load(Ordering::Acquire)
    }

    /// Fires when the watcher is stopped or the agent shuts down.
    pub fn stop_token(&self) -> CancellationToken {
        self.stop.clone()
    }

    /// Starts forwarding lines into `queue`. Does nothing if already started.
    pub fn start(&mut self, queue: mpsc::Sender<LogMessage>) {
        let cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => return,
        };

        let forward = Forward {
            cursor,
            source: self.source.clone(),
            queue,
            stop: self.stop.clone(),
            forwarded: self.forwarded.clone(),
            offsets: self.offsets.clone(),
            poll_interval: self.poll_interval,
        };
        self.forward = Some(tokio::spawn(forward.run()));
    }

    /// Stops forwarding, records the position, and closes the cursor.
    /// Returns the recorded position.
    pub async fn stop(mut self) -> Result<u64, WatcherError> {
        self.stop.cancel();

        if let Some(forward) = self.forward.take() {
            return forward.await.map_err(|source| WatcherError::Task {
                path: self.source.file.clone(),
                source,
            })?;
        }

        // Never started: nothing was forwarded, so there is nothing to record.
        let offset = self.offset();
        if let Some(cursor) = self.cursor.take() {
            cursor.stop().map_err(|source| WatcherError::Close {
                path: self.source.file.clone(),
                source,
            })?;
        }

        Ok(offset)
    }
}

struct Forward {
    cursor: TailCursor,
    source: Arc<Source>,
    queue: mpsc::Sender<LogMessage>,
    stop: CancellationToken,
    forwarded: Arc<AtomicU64>,
    offsets: OffsetStore,
    poll_interval: Duration,
}

impl Forward {
    async fn run(mut self) -> Result<u64, WatcherError> {
        let path = self.source.file.clone();
        debug!(path = %path.display(), "forwarding lines");

        loop {
            let line = tokio::select! {
                _ = self.stop.cancelled() => break,
                line = self.cursor.next_line() => line,
            };

            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "failed to read line");
                    tokio::select! {
                        _ = self.stop.cancelled() => break,
                        _ = tokio::time::sleep(self.poll_interval) => continue,
                    }
                }
            };

            let end = line.end_offset();
            let message = LogMessage::new(line, self.source.clone());

            tokio::select! {
                _ = self.stop.cancelled() => break,
                sent = self.queue.send(message) => {
                    if sent.is_err() {
                        warn!(path = %path.display(), "line queue closed");
                        break;
                    }
                }
            }
            self.forwarded.store(end, Ordering::Release);
        }

        let offset = self.forwarded.load(Ordering::Acquire);
        match self.offsets.save(&path, offset) {
            Ok(()) => info!(path = %path.display(), offset, "saved offset"),
            Err(e) => warn!(path = %path.display(), offset, error = %e, "failed to save offset"),
        }

        self.cursor.stop().map_err(|source| WatcherError::Close {
            path: path.clone(),
            source,
        })?;

        Ok(offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;
    use tokio::time::timeout;

    const POLL: Duration = Duration::from_millis(20);

    fn hub() -> EventHub {
        EventHub::new(POLL).unwrap()
    }

    fn append(path: &Path, data: &[u8]) {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .unwrap();
        file.write_all(data).unwrap();
    }

    #[tokio::test]
    async fn test_rejects_bad_collectors() {
        let tmp_dir = TempDir::new().unwrap();
        let offsets = OffsetStore::open(tmp_dir.path().join("offsets")).unwrap();
        let root = CancellationToken::new();

        let undated = Collector::date(tmp_dir.path().join("app.log").to_string_lossy(), "t");
        let err = Watcher::create(undated, &offsets, &hub(), POLL, &root).await.unwrap_err();
        assert!(matches!(
            err,
            WatcherError::Config(CollectorError::MissingDateToken(_))
        ));

        let unknown = Collector::new(crate::Style::Unknown, "/var/log/app.log", "t");
        let err = Watcher::create(unknown, &offsets, &hub(), POLL, &root).await.unwrap_err();
        assert!(matches!(err, WatcherError::Config(CollectorError::UnknownStyle(_))));
    }

    #[tokio::test]
    async fn test_forwards_lines_and_saves_offset() {
        let tmp_dir = TempDir::new().unwrap();
        let offsets = OffsetStore::open(tmp_dir.path().join("offsets")).unwrap();
        let log = tmp_dir.path().join("app.log");
        append(&log, b"one\ntwo\n");

        let root = CancellationToken::new();
        let collector = Collector::file(log.to_string_lossy(), "app");
        let mut watcher = Watcher::create(collector, &offsets, &hub(), POLL, &root).await.unwrap();
        assert_eq!(watcher.cycle(), None);

        let (tx, mut rx) = mpsc::channel(8);
        watcher.start(tx);

        for expected in ["one", "two"] {
            let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
            assert_eq!(message.content, expected);
            assert_eq!(message.source.collector.topic, "app");
        }

        // Wait for the position to catch up with the second line.
        while watcher.offset() < 8 {
            tokio::time::sleep(POLL).await;
        }

        let file = watcher.file().to_path_buf();
        assert_eq!(watcher.stop().await.unwrap(), 8);
        assert_eq!(offsets.load(&file).unwrap(), 8);
    }

    #[tokio::test]
    async fn test_resumes_from_saved_offset() {
        let tmp_dir = TempDir::new().unwrap();
        let offsets = OffsetStore::open(tmp_dir.path().join("offsets")).unwrap();
        let log = tmp_dir.path().join("app.log");
        append(&log, b"seen\nunseen\n");

        let file = absolutify(&log, true).unwrap();
        offsets.save(&file, 5).unwrap();

        let root = CancellationToken::new();
        let collector = Collector::file(log.to_string_lossy(), "app");
        let mut watcher = Watcher::create(collector, &offsets, &hub(), POLL, &root).await.unwrap();
        assert_eq!(watcher.offset(), 5);

        let (tx, mut rx) = mpsc::channel(8);
        watcher.start(tx);
        let message = timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap();
        assert_eq!(message.content, "unseen");

        while watcher.offset() < 12 {
            tokio::time::sleep(POLL).await;
        }
        root.cancel();
        assert_eq!(watcher.stop().await.unwrap(), 12);
    }

    #[tokio::test]
    async fn test_unsent_line_is_not_recorded() {
        let tmp_dir = TempDir::new().unwrap();
        let offsets = OffsetStore::open(tmp_dir.path().join("offsets")).unwrap();
        let log = tmp_dir.path().join("app.log");
        append(&log, b"first\nsecond\n");

        let root = CancellationToken::new();
        let collector = Collector::file(log.to_string_lossy(), "app");
        let mut watcher = Watcher::create(collector, &offsets, &hub(), POLL, &root).await.unwrap();

        // Room for one message; the second line blocks on the full queue.
        let (tx, mut rx) = mpsc::channel(1);
        watcher.start(tx);
        while watcher.offset() < 6 {
            tokio::time::sleep(POLL).await;
        }
        tokio::time::sleep(POLL * 5).await;

        let file = watcher.file().to_path_buf();
        assert_eq!(watcher.stop().await.unwrap(), 6);
        assert_eq!(offsets.load(&file).unwrap(), 6);
        assert_eq!(rx.recv().await.unwrap().content, "first");
    }

    #[tokio::test]
    async fn test_date_collector_has_a_cycle() {
        let tmp_dir = TempDir::new().unwrap();
        let offsets = OffsetStore::open(tmp_dir.path().join("offsets")).unwrap();
        let template = tmp_dir.path().join("app-%Y-%m-%d.log");

        let root = CancellationToken::new();
        let collector = Collector::date(template.to_string_lossy(), "app");
        let watcher = Watcher::create(collector, &offsets, &hub(), POLL, &root).await.unwrap();

        let cycle = watcher.cycle().unwrap();
        assert!(cycle > Duration::ZERO && cycle <= Duration::from_secs(25 * 60 * 60));
        let today = Local::now().format("app-%Y-%m-%d.log").to_string();
        assert!(watcher.file().ends_with(today));

        // Stopping an unstarted watcher records nothing.
        let file = watcher.file().to_path_buf();
        assert_eq!(watcher.stop().await.unwrap(), 0);
        assert!(offsets.load(&file).is_err());
    }
}
