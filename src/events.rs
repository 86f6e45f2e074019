//! Everything related to noticing that a tailed file was created, modified,
//! removed, or recreated.

use std::collections::HashMap;
use std::fmt::{self, Debug, Formatter};
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task;
use std::time::Duration;

use futures_util::stream::Stream as FuturesStream;
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::mpsc;

type EventSender = mpsc::UnboundedSender<Result<notify::Event, io::Error>>;

/// Subscribers keyed by the absolute path of the file they follow.
type Routes = HashMap<PathBuf, Vec<(u64, EventSender)>>;

/// One [`notify::PollWatcher`] shared by every followed file.
///
/// Polling is used instead of the platform's native notification API so that
/// behaviour is identical on every platform and on network filesystems. The
/// hub watches parent directories rather than the files themselves, which
/// lets a file be registered before it exists and keeps working when it is
/// deleted and recreated. Directory watches are reference counted, so files
/// sharing a directory share its scan, and the whole hub runs on a single
/// polling thread no matter how many files are followed.
///
/// Cloning is cheap; clones share the same poller.
///
/// [`notify::PollWatcher`]: ../notify/struct.PollWatcher.html
#[derive(Clone)]
pub struct EventHub {
    shared: Arc<Shared>,
}

struct Shared {
    watched: Mutex<Watched>,
    /// Also held by the poller's callback.
    routes: Arc<Mutex<Routes>>,
    next_id: AtomicU64,
}

struct Watched {
    inner: notify::PollWatcher,
    directories: HashMap<PathBuf, usize>,
}

impl Debug for EventHub {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        let targets = self.shared.routes.lock().len();
        let watched = self.shared.watched.lock();
        f.debug_struct("EventHub")
            .field("watched_directories", &watched.directories)
            .field("targets", &targets)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("Failed to start polling: {0}")]
    Start(#[source] notify::Error),
    #[error("Failed to add path to watch: {0}")]
    AddFailure(PathBuf),
    #[error("Failed to remove path from watch: {0}")]
    RemoveFailure(PathBuf),
    #[error("Error receiving event: {0}")]
    Event(#[from] std::io::Error),
}

fn to_io_error(e: &notify::Error) -> io::Error {
    match &e.kind {
        notify::ErrorKind::Io(io_err) => io::Error::new(io_err.kind(), e.to_string()),
        // Runtime event errors should only be std::io, but need to handle
        // this case anyway.
        _ => io::Error::new(io::ErrorKind::Other, format!("Event error: {:?}", e)),
    }
}

/// Hands one event to the subscribers of each path it mentions, each getting
/// a copy narrowed down to its own file.
fn route(routes: &Routes, res: Result<notify::Event, notify::Error>) {
    match res {
        Ok(event) => {
            for path in &event.paths {
                let subscribers = match routes.get(path) {
                    Some(subscribers) => subscribers,
                    None => continue,
                };
                for (_, tx) in subscribers {
                    let mut routed = event.clone();
                    routed.paths = vec![path.clone()];
                    // Fails only once the subscriber is gone.
                    let _ = tx.send(Ok(routed));
                }
            }
        }
        Err(e) if e.paths.is_empty() => {
            for (_, tx) in routes.values().flatten() {
                let _ = tx.send(Err(to_io_error(&e)));
            }
        }
        Err(e) => {
            for (_, tx) in e.paths.iter().filter_map(|p| routes.get(p)).flatten() {
                let _ = tx.send(Err(to_io_error(&e)));
            }
        }
    }
}

impl EventHub {
    /// Starts the poller. Each watched directory is scanned once every
    /// `poll_interval`.
    pub fn new(poll_interval: Duration) -> Result<Self, Error> {
        let routes: Arc<Mutex<Routes>> = Arc::new(Mutex::new(HashMap::new()));
        let callback_routes = routes.clone();

        let config = notify::Config::default().with_poll_interval(poll_interval);
        let inner = notify::PollWatcher::new(
            move |res: Result<notify::Event, notify::Error>| route(&callback_routes.lock(), res),
            config,
        )
        .map_err(Error::Start)?;

        Ok(EventHub {
            shared: Arc::new(Shared {
                watched: Mutex::new(Watched {
                    inner,
                    directories: HashMap::new(),
                }),
                routes,
                next_id: AtomicU64::new(0),
            }),
        })
    }

    /// Starts following `path`, whether it currently exists or not. The
    /// parent directory must exist.
    pub fn watch(&self, path: impl Into<PathBuf>) -> Result<FileEvents, Error> {
        let target = absolutify(path, true)?;

        if target.is_dir() {
            return Err(Error::AddFailure(target));
        }

        let directory = target
            .parent()
            .map(Path::to_path_buf)
            .ok_or_else(|| Error::AddFailure(target.clone()))?;

        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.shared
            .routes
            .lock()
            .entry(target.clone())
            .or_default()
            .push((id, tx));

        if let Err(e) = self.add_directory(&directory) {
            self.remove_route(id, &target);
            return Err(e);
        }

        Ok(FileEvents {
            hub: self.clone(),
            id,
            target,
            directory: Some(directory),
            event_stream: rx,
        })
    }

    fn add_directory(&self, directory: &Path) -> Result<(), Error> {
        let mut watched = self.shared.watched.lock();

        if !watched.directories.contains_key(directory) {
            notify::Watcher::watch(
                &mut watched.inner,
                directory,
                notify::RecursiveMode::NonRecursive,
            )
            .map_err(|_e| Error::AddFailure(directory.to_path_buf()))?;
        }

        let count = watched.directories.entry(directory.to_path_buf()).or_insert(0);
        *count += 1;

        Ok(())
    }

    fn remove_directory(&self, directory: &Path) -> Result<(), Error> {
        let mut watched = self.shared.watched.lock();

        let remaining = match watched.directories.get_mut(directory) {
            Some(count) => {
                *count -= 1;
                *count
            }
            None => return Ok(()),
        };

        if remaining == 0 {
            // Remove from map first in case `unwatch` fails.
            watched.directories.remove(directory);
            notify::Watcher::unwatch(&mut watched.inner, directory)
                .map_err(|_e| Error::RemoveFailure(directory.to_path_buf()))?;
        }

        Ok(())
    }

    fn remove_route(&self, id: u64, target: &Path) {
        let mut routes = self.shared.routes.lock();
        if let Some(subscribers) = routes.get_mut(target) {
            subscribers.retain(|(sub, _)| *sub != id);
            if subscribers.is_empty() {
                routes.remove(target);
            }
        }
    }

    #[cfg(test)]
    fn watch_count(&self, directory: &Path) -> usize {
        self.shared
            .watched
            .lock()
            .directories
            .get(directory)
            .copied()
            .unwrap_or(0)
    }
}

/// The events concerning a single file, as routed by an [`EventHub`].
///
/// Dropping it unregisters the file.
pub struct FileEvents {
    hub: EventHub,
    id: u64,
    /// The absolute path of the file of interest.
    target: PathBuf,
    /// The directory registered with the hub, if still registered.
    directory: Option<PathBuf>,
    event_stream: mpsc::UnboundedReceiver<Result<notify::Event, io::Error>>,
}

impl Debug for FileEvents {
    fn fmt(&self, f: &mut Formatter) -> Result<(), fmt::Error> {
        f.debug_struct("FileEvents")
            .field("target", &self.target)
            .field("directory", &self.directory)
            .finish()
    }
}

impl FileEvents {
    /// Returns the absolute version of the path originally supplied, to match
    /// against the one contained in each `notify::Event` received.
    pub fn path(&self) -> &Path {
        self.target.as_path()
    }

    /// Stops following the file. Safe to call more than once.
    pub fn unwatch(&mut self) -> Result<(), Error> {
        self.event_stream.close();

        if let Some(directory) = self.directory.take() {
            self.hub.remove_route(self.id, &self.target);
            self.hub.remove_directory(&directory)?;
        }

        Ok(())
    }

    /// Waits for the next event concerning the target file. Returns `None`
    /// once unwatched.
    pub async fn next_event(&mut self) -> Option<Result<notify::Event, Error>> {
        std::future::poll_fn(|cx| self.poll_event(cx)).await
    }

    fn poll_event(
        &mut self,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Result<notify::Event, Error>>> {
        self.event_stream
            .poll_recv(cx)
            .map(|res| res.map(|res| res.map_err(Error::from)))
    }
}

impl Drop for FileEvents {
    fn drop(&mut self) {
        let _ = self.unwatch();
    }
}

impl FuturesStream for FileEvents {
    type Item = notify::Event;

    fn poll_next(
        mut self: Pin<&mut Self>,
        cx: &mut task::Context<'_>,
    ) -> task::Poll<Option<Self::Item>> {
        loop {
            match futures_util::ready!(self.poll_event(cx)) {
                Some(Ok(event)) => return task::Poll::Ready(Some(event)),
                Some(Err(_)) => continue,
                None => return task::Poll::Ready(None),
            }
        }
    }
}

pub(crate) fn absolutify(path: impl Into<PathBuf>, is_file: bool) -> io::Result<PathBuf> {
    let path = path.into();

    let (dir, maybe_filename) = if is_file {
        let parent = match path.parent() {
            None => std::env::current_dir()?,
            Some(path) => {
                if path == Path::new("") {
                    std::env::current_dir()?
                } else {
                    path.to_path_buf()
                }
            }
        };
        let filename = path
            .file_name()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Filename not found in path"))?
            .to_os_string();

        (parent, Some(filename))
    } else {
        (path, None)
    };

    let dir = if let Ok(linked_dir) = dir.read_link() {
        linked_dir
    } else {
        dir
    };

    let dir = if let Ok(abs_dir) = dir.canonicalize() {
        abs_dir
    } else {
        dir
    };

    let path = if let Some(filename) = maybe_filename {
        dir.join(filename)
    } else {
        dir
    };

    Ok(path)
}
