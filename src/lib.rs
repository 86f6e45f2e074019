//! A log-shipping agent: follows the files listed in a configuration store
//! and forwards their lines, batched and grouped by topic, to a message sink.
//!
//! The moving parts, leaves first:
//!
//! * [`TailCursor`] reads one file line by line with byte-accurate positions,
//!   woken by [`FileEvents`] from a polling [`EventHub`] shared by every
//!   cursor. Files need not exist yet.
//! * [`Collector`]s describe what to follow: a literal path, or a daily
//!   `strftime` template.
//! * A [`Watcher`] follows one collector and forwards its lines into a shared
//!   bounded queue, saving its position to the [`OffsetStore`] when stopped.
//! * The [`Registry`] owns every live watcher; [`change`] turns revisions of
//!   the agent's configuration key into start and close requests for it.
//! * The [`BatchSender`] drains the queue into a [`Sink`].
//!
//! [`Agent`] wires all of it together.
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use async_trait::async_trait;
//! use logagent::{Agent, AgentConfig, Collector, ConfigStore, MemoryStore, Record, Sink, SinkError};
//!
//! struct Stdout;
//!
//! #[async_trait]
//! impl Sink for Stdout {
//!     async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError> {
//!         for record in records {
//!             println!("{}: {}", record.topic, String::from_utf8_lossy(&record.value));
//!         }
//!         Ok(())
//!     }
//!
//!     async fn close(&mut self) -> Result<(), SinkError> {
//!         Ok(())
//!     }
//! }
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = AgentConfig::default();
//!     let store = Arc::new(MemoryStore::new());
//!
//!     let collectors = vec![Collector::file("/var/log/syslog", "syslog")];
//!     store
//!         .put(&logagent::store::config_key(&config.id), serde_json::to_vec(&collectors)?)
//!         .await?;
//!
//!     // Runs until SIGINT, SIGTERM or SIGHUP.
//!     Agent::new(config, store, Stdout).run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Caveats
//!
//! Each configuration revision must add or remove exactly one collector; see
//! [`change`]. Delivery is at-least-once: lines read after the last saved
//! offset are shipped again if the agent dies without a clean shutdown.

mod agent;
mod batch;
pub mod change;
mod collector;
mod config;
mod events;
pub mod logging;
mod message;
mod offset;
mod reader;
pub mod registry;
mod sink;
pub mod store;
mod watcher;

pub use agent::{Agent, AgentError, Signals};
pub use batch::{BatchConfig, BatchSender};
pub use collector::{Collector, CollectorError, Resolved, Style};
pub use config::{AgentConfig, ConfigError, KafkaConfig, TuningConfig};
pub use events::{Error as EventsError, EventHub, FileEvents};
pub use message::{LogMessage, Source};
pub use notify::event;
pub use offset::{OffsetError, OffsetStore};
pub use reader::{Line, TailCursor, TailError, TailOptions};
pub use registry::{Control, Registry, RegistryError, RegistrySettings, WatcherInfo};
#[cfg(feature = "kafka")]
pub use sink::KafkaSink;
pub use sink::{Record, Sink, SinkError, SOURCE_AGENT_HEADER};
pub use store::{ConfigStore, MemoryStore, StoreError, WatchEvent, WatchKind};
pub use watcher::{Watcher, WatcherError};
