//! Durable read positions, one small file per followed path.
//!
//! Each record lives at `<dir>/<encoded path>.offset` and holds the byte
//! offset as decimal text. The path is encoded with URL-safe base64 so any
//! path, separators included, maps to a single flat file name and back.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use thiserror::Error;

const SUFFIX: &str = ".offset";

#[derive(Debug, Error)]
pub enum OffsetError {
    #[error("failed to access offset record {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("offset record {path} is corrupt: {content:?}")]
    Corrupt { path: PathBuf, content: String },
}

/// File-backed mapping from a followed path to its last recorded offset.
///
/// The store has no locking of its own: each path is only ever written by the
/// watcher following it.
#[derive(Clone, Debug)]
pub struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    /// Uses `dir` for records, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, OffsetError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).map_err(|source| OffsetError::Io {
            path: dir.clone(),
            source,
        })?;

        Ok(OffsetStore { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// The record file used for `path`.
    pub fn record_path(&self, path: &Path) -> PathBuf {
        self.dir.join(encode(path))
    }

    /// Reads the offset recorded for `path`.
    pub fn load(&self, path: &Path) -> Result<u64, OffsetError> {
        let record = self.record_path(path);
        let content = fs::read_to_string(&record).map_err(|source| OffsetError::Io {
            path: record.clone(),
            source,
        })?;

        content
            .trim()
            .parse::<u64>()
            .map_err(|_| OffsetError::Corrupt {
                path: record,
                content,
            })
    }

    /// Records `offset` for `path`, replacing any previous record atomically.
    pub fn save(&self, path: &Path, offset: u64) -> Result<(), OffsetError> {
        static COUNTER: AtomicU64 = AtomicU64::new(0);

        let record = self.record_path(path);
        let unique = COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp = self
            .dir
            .join(format!(".{}.{}.{}.tmp", encode(path), std::process::id(), unique));

        let write = || -> io::Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(offset.to_string().as_bytes())?;
            file.sync_all()?;
            fs::rename(&temp, &record)
        };

        write().map_err(|source| {
            let _ = fs::remove_file(&temp);
            OffsetError::Io {
                path: record.clone(),
                source,
            }
        })
    }

    /// Every path that has a record, decoded back from the file names.
    pub fn paths(&self) -> Result<Vec<PathBuf>, OffsetError> {
        let entries = fs::read_dir(&self.dir).map_err(|source| OffsetError::Io {
            path: self.dir.clone(),
            source,
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok())
            .filter_map(|entry| decode(&entry.file_name().to_string_lossy()))
            .collect();
        paths.sort();

        Ok(paths)
    }
}

fn encode(path: &Path) -> String {
    let raw = path.to_string_lossy();
    format!("{}{}", URL_SAFE_NO_PAD.encode(raw.as_bytes()), SUFFIX)
}

fn decode(file_name: &str) -> Option<PathBuf> {
    let stem = file_name.strip_suffix(SUFFIX)?;
    let bytes = URL_SAFE_NO_PAD.decode(stem).ok()?;
    String::from_utf8(bytes).ok().map(PathBuf::from)
}
