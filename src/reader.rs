//! Everything related to reading lines from a single followed file.

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Local};
use thiserror::Error;
use tokio::fs::{metadata, File};
use tokio::io::{AsyncBufReadExt, AsyncSeekExt, BufReader};
use tracing::{debug, warn};

use crate::events::{self, EventHub, FileEvents};

type LineReader = BufReader<File>;

async fn new_linereader(path: impl AsRef<Path>, seek_pos: u64) -> io::Result<LineReader> {
    let path = path.as_ref();
    let mut reader = File::open(path).await?;
    if seek_pos > 0 {
        reader.seek(io::SeekFrom::Start(seek_pos)).await?;
    }

    Ok(BufReader::new(reader))
}

#[derive(Debug, Error)]
pub enum TailError {
    #[error("Failed to watch file: {0}")]
    Watch(#[from] events::Error),
    #[error("Failed to read file: {0}")]
    Io(#[from] io::Error),
}

/// A line captured from a followed file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Line {
    /// The path from where the line was read.
    source: PathBuf,
    /// The line, without its terminator.
    line: String,
    /// Byte position just past the line's terminator.
    end_offset: u64,
    time: DateTime<Local>,
}

impl Line {
    /// Returns a reference to the file from where the line was read.
    pub fn source(&self) -> &Path {
        self.source.as_path()
    }

    /// Returns the line.
    pub fn line(&self) -> &str {
        self.line.as_str()
    }

    /// Byte position right after this line. Resuming from here never
    /// re-reads it.
    pub fn end_offset(&self) -> u64 {
        self.end_offset
    }

    /// When the line was read.
    pub fn time(&self) -> DateTime<Local> {
        self.time
    }

    /// Returns the internal components that make up a `Line`. Hidden as the
    /// return signature may change.
    #[doc(hidden)]
    pub fn into_inner(self) -> (PathBuf, String) {
        let Line { source, line, .. } = self;

        (source, line)
    }
}

/// How a [`TailCursor`] starts.
#[derive(Clone, Debug)]
pub struct TailOptions {
    /// Byte position to seek to the first time the file is opened. Ignored
    /// (and reset to 0) if the file is shorter than this.
    pub offset: u64,
    /// How long to wait without a change event before checking the file
    /// anyway.
    pub poll_interval: Duration,
}

impl Default for TailOptions {
    fn default() -> Self {
        TailOptions {
            offset: 0,
            poll_interval: Duration::from_millis(250),
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
struct FileIdentity {
    dev: u64,
    ino: u64,
}

#[cfg(unix)]
fn identity(meta: &std::fs::Metadata) -> Option<FileIdentity> {
    use std::os::unix::fs::MetadataExt;

    Some(FileIdentity {
        dev: meta.dev(),
        ino: meta.ino(),
    })
}

#[cfg(not(unix))]
fn identity(_meta: &std::fs::Metadata) -> Option<FileIdentity> {
    None
}

/// Follows one file and yields its lines in order.
///
/// The cursor:
///   1. does not require the file to exist, and waits for it to show up;
///   2. seeks to [`TailOptions::offset`] on the first open;
///   3. follows appended data, holding back an unterminated trailing line
///      until its newline arrives;
///   4. re-opens the file from the start when it is recreated or truncated.
///
/// [`tell`] reports the byte position through the last complete line handed
/// out, which is what should be persisted to resume later.
///
/// [`tell`]: TailCursor::tell
#[derive(Debug)]
pub struct TailCursor {
    events: FileEvents,
    reader: Option<LineReader>,
    identity: Option<FileIdentity>,
    /// Position through the last complete line.
    position: u64,
    /// Seek applied to the first open only.
    pending_offset: Option<u64>,
    /// Bytes read past `position` that don't form a full line yet.
    partial: Vec<u8>,
    poll_interval: Duration,
}

impl TailCursor {
    /// Registers `path` with `hub` and opens it if it already exists.
    pub async fn open(
        hub: &EventHub,
        path: impl Into<PathBuf>,
        options: TailOptions,
    ) -> Result<Self, TailError> {
        let events = hub.watch(path)?;

        let mut cursor = TailCursor {
            events,
            reader: None,
            identity: None,
            position: options.offset,
            pending_offset: Some(options.offset),
            partial: Vec::new(),
            poll_interval: options.poll_interval,
        };
        cursor.refresh().await?;

        Ok(cursor)
    }

    /// The absolute path being followed.
    pub fn path(&self) -> &Path {
        self.events.path()
    }

    /// Byte position through the last complete line returned.
    pub fn tell(&self) -> u64 {
        self.position
    }

    /// Waits for the next complete line.
    ///
    /// Cancel safe: bytes read before the future is dropped are kept and the
    /// next call carries on from them.
    pub async fn next_line(&mut self) -> Result<Line, TailError> {
        loop {
            if let Some(reader) = self.reader.as_mut() {
                let read = reader.read_until(b'\n', &mut self.partial).await?;
                if self.partial.last() == Some(&b'\n') {
                    return Ok(self.take_line());
                }
                if read > 0 {
                    continue;
                }
            }

            // At the end of the file (or there is no file yet).
            if self.refresh().await? {
                continue;
            }
            self.wait_for_change().await;
        }
    }

    /// Stops following the file and returns the final position.
    pub fn stop(mut self) -> Result<u64, TailError> {
        self.reader = None;
        self.events.unwatch()?;

        Ok(self.position)
    }

    fn take_line(&mut self) -> Line {
        let consumed = self.partial.len() as u64;
        let mut bytes = std::mem::take(&mut self.partial);

        bytes.pop();
        if bytes.last() == Some(&b'\r') {
            bytes.pop();
        }

        self.position += consumed;

        Line {
            source: self.events.path().to_path_buf(),
            line: String::from_utf8_lossy(&bytes).into_owned(),
            end_offset: self.position,
            time: Local::now(),
        }
    }

    async fn wait_for_change(&mut self) {
        tokio::select! {
            _event = self.events.next_event() => {}
            _ = tokio::time::sleep(self.poll_interval) => {}
        }
    }

    /// Reconciles the open reader with what is on disk. Returns `true` if a
    /// (new) reader was opened and reading should resume right away.
    async fn refresh(&mut self) -> Result<bool, TailError> {
        let path = self.events.path().to_path_buf();

        let meta = match metadata(&path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                if self.reader.take().is_some() {
                    debug!(path = %path.display(), "file removed, waiting for it to come back");
                    self.reset(0);
                }
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        if meta.is_dir() {
            return Err(events::Error::AddFailure(path).into());
        }

        let size = meta.len();
        let current = identity(&meta);

        if self.reader.is_none() {
            let mut start = self.pending_offset.take().unwrap_or(0);
            if start > size {
                warn!(
                    path = %path.display(),
                    offset = start,
                    size,
                    "offset is past the end of the file, starting over"
                );
                start = 0;
            }
            self.open_reader(&path, start, current).await?;
            return Ok(true);
        }

        let read_to = self.position + self.partial.len() as u64;

        if current != self.identity {
            debug!(path = %path.display(), "file recreated, reading from the start");
            self.open_reader(&path, 0, current).await?;
            return Ok(true);
        }

        if size < read_to {
            debug!(path = %path.display(), size, position = read_to, "file truncated, reading from the start");
            self.open_reader(&path, 0, current).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn open_reader(
        &mut self,
        path: &Path,
        start: u64,
        identity: Option<FileIdentity>,
    ) -> Result<(), TailError> {
        let reader = new_linereader(path, start).await?;
        self.reader = Some(reader);
        self.identity = identity;
        self.reset(start);

        Ok(())
    }

    fn reset(&mut self, position: u64) {
        self.position = position;
        self.partial.clear();
    }
}
