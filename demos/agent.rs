//! Runs the agent against an in-process configuration store and prints every
//! batch it would ship.
//!
//! Usage:
//!     agent [config.toml] -- topic=/path/to/file topic=/path/to/app-%Y-%m-%d.log ...
//!
//! Paths containing `%` are treated as daily date templates. Stop with
//! Ctrl-C or SIGTERM; offsets are saved under the runtime directory.

use std::sync::Arc;

use async_trait::async_trait;
use logagent::store::config_key;
use logagent::{logging, Agent, AgentConfig, Collector, ConfigStore, MemoryStore, Record, Sink, SinkError};

struct Stdout;

#[async_trait]
impl Sink for Stdout {
    async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError> {
        println!("-- batch of {}", records.len());
        for record in records {
            println!(
                "[{}] {}: {}",
                record.topic,
                String::from_utf8_lossy(&record.key),
                String::from_utf8_lossy(&record.value)
            );
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        println!("-- sink closed");
        Ok(())
    }
}

fn parse_collector(arg: &str) -> Result<Collector, String> {
    let (topic, path) = arg
        .split_once('=')
        .ok_or_else(|| format!("expected topic=path, got {:?}", arg))?;

    if path.contains('%') {
        Ok(Collector::date(path, topic))
    } else {
        Ok(Collector::file(path, topic))
    }
}

#[tokio::main]
pub async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args: Vec<String> = std::env::args().skip(1).collect();
    let (settings, sources) = match args.iter().position(|a| a == "--") {
        Some(split) => (&args[..split], &args[split + 1..]),
        None => (&args[..0], &args[..]),
    };

    let config = match settings.first() {
        Some(path) => AgentConfig::from_file(path)?,
        None => AgentConfig::default(),
    };
    let _guard = logging::init(&config.log_dir())?;

    let collectors = sources
        .iter()
        .map(|arg| parse_collector(arg))
        .collect::<Result<Vec<_>, _>>()?;

    let store = Arc::new(MemoryStore::new());
    store
        .put(&config_key(&config.id), serde_json::to_vec(&collectors)?)
        .await?;

    Agent::new(config, store, Stdout).run().await?;
    Ok(())
}
