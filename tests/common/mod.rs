#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use logagent::{AgentConfig, Record, Sink, SinkError};
use parking_lot::Mutex;

/// Keeps every record it is handed.
#[derive(Clone, Default)]
pub struct RecordingSink {
    pub records: Arc<Mutex<Vec<Record>>>,
    pub closed: Arc<Mutex<bool>>,
}

impl RecordingSink {
    pub fn values(&self) -> Vec<String> {
        self.records
            .lock()
            .iter()
            .map(|r| String::from_utf8_lossy(&r.value).into_owned())
            .collect()
    }

    /// Waits until `count` records arrived.
    pub async fn wait_for(&self, count: usize) {
        let wait = async {
            while self.records.lock().len() < count {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        if tokio::time::timeout(Duration::from_secs(10), wait).await.is_err() {
            panic!("expected {} records, got {:?}", count, self.values());
        }
    }
}

#[async_trait]
impl Sink for RecordingSink {
    async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError> {
        self.records.lock().extend(records);
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        *self.closed.lock() = true;
        Ok(())
    }
}

pub fn config(runtime_dir: &Path) -> AgentConfig {
    let mut config = AgentConfig {
        id: "test-agent".to_string(),
        runtime_dir: runtime_dir.to_path_buf(),
        ..AgentConfig::default()
    };
    config.agent.flush_interval_ms = 50;
    config.agent.poll_interval_ms = 20;
    config.agent.register_delay_ms = 1;
    config.agent.close_delay_ms = 1;
    config.agent.settle_delay_ms = 10;
    config
}

pub fn append(path: &Path, data: &str) {
    use std::io::Write;

    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .unwrap();
    file.write_all(data.as_bytes()).unwrap();
}

/// The path offsets are keyed by.
pub fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap()
}
