//! Agent settings, read from a TOML file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Everything the agent needs to know before it talks to the store.
///
/// ```toml
/// id = "web-01"
/// runtime_dir = "/var/lib/logagent"
///
/// [kafka]
/// brokers = "kafka-1:9092,kafka-2:9092"
/// queue_size = 200
///
/// [agent]
/// flush_interval_ms = 1000
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Names this agent's keys in the configuration store.
    pub id: String,
    /// Holds saved offsets and the agent's own log.
    pub runtime_dir: PathBuf,
    pub kafka: KafkaConfig,
    pub agent: TuningConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            id: "logagent".to_string(),
            runtime_dir: PathBuf::from("runtime"),
            kafka: KafkaConfig::default(),
            agent: TuningConfig::default(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct KafkaConfig {
    /// Comma-separated `host:port` list.
    pub brokers: String,
    /// Most records sent in one batch.
    pub queue_size: usize,
}

impl Default for KafkaConfig {
    fn default() -> Self {
        KafkaConfig {
            brokers: "127.0.0.1:9092".to_string(),
            queue_size: 100,
        }
    }
}

/// Queue sizes and timings. Durations are in milliseconds.
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(default)]
pub struct TuningConfig {
    /// Capacity of the queue between watchers and the batch sender.
    pub channel_capacity: usize,
    /// Capacity of the start and close request queues.
    pub control_capacity: usize,
    pub flush_interval_ms: u64,
    pub poll_interval_ms: u64,
    /// Pause between initial start requests.
    pub register_delay_ms: u64,
    /// Pause between close requests on shutdown.
    pub close_delay_ms: u64,
    /// Pause between closing and restarting a rotated watcher.
    pub settle_delay_ms: u64,
}

impl Default for TuningConfig {
    fn default() -> Self {
        TuningConfig {
            channel_capacity: 50,
            control_capacity: 10,
            flush_interval_ms: 3000,
            poll_interval_ms: 250,
            register_delay_ms: 300,
            close_delay_ms: 500,
            settle_delay_ms: 500,
        }
    }
}

impl TuningConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn register_delay(&self) -> Duration {
        Duration::from_millis(self.register_delay_ms)
    }

    pub fn close_delay(&self) -> Duration {
        Duration::from_millis(self.close_delay_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }
}

impl AgentConfig {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;

        content.parse()
    }

    /// Rejects settings the agent cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.trim().is_empty() {
            return Err(ConfigError::Invalid("id must not be empty".to_string()));
        }
        if self.id.contains('/') {
            return Err(ConfigError::Invalid(format!(
                "id {:?} must not contain '/'",
                self.id
            )));
        }

        let capacities = [
            ("kafka.queue_size", self.kafka.queue_size),
            ("agent.channel_capacity", self.agent.channel_capacity),
            ("agent.control_capacity", self.agent.control_capacity),
        ];
        for (name, value) in capacities {
            if value == 0 {
                return Err(ConfigError::Invalid(format!("{} must be at least 1", name)));
            }
        }

        if self.agent.flush_interval_ms == 0 || self.agent.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "flush and poll intervals must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Where offsets are saved.
    pub fn offset_dir(&self) -> PathBuf {
        self.runtime_dir.join("offsets")
    }

    /// Where the agent writes its own log.
    pub fn log_dir(&self) -> PathBuf {
        self.runtime_dir.join("log")
    }
}

impl std::str::FromStr for AgentConfig {
    type Err = ConfigError;

    fn from_str(content: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(content)?)
    }
}
