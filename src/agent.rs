//! Wiring everything together: bootstrap, steady state, and shutdown.

use std::future::Future;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::batch::{BatchConfig, BatchSender};
use crate::change::watch_config;
use crate::config::{AgentConfig, ConfigError};
use crate::events::{self, EventHub};
use crate::offset::{OffsetError, OffsetStore};
use crate::registry::{self, Registry, RegistryError, RegistrySettings};
use crate::sink::Sink;
use crate::store::{active_key, config_key, ConfigStore, StoreError, ACTIVE, INACTIVE};

#[derive(Debug, Error)]
pub enum AgentError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("failed to prepare offset directory: {0}")]
    Offsets(#[from] OffsetError),
    #[error("failed to start file polling: {0}")]
    Events(#[from] events::Error),
    #[error("configuration store error: {0}")]
    Store(#[from] StoreError),
    #[error("initial registration failed: {0}")]
    Register(#[from] RegistryError),
    #[error("failed to listen for signals: {0}")]
    Signal(#[source] std::io::Error),
}

/// A configured agent, ready to run.
pub struct Agent<S> {
    config: AgentConfig,
    store: Arc<dyn ConfigStore>,
    sink: S,
}

impl<S: Sink + 'static> Agent<S> {
    pub fn new(config: AgentConfig, store: Arc<dyn ConfigStore>, sink: S) -> Self {
        Agent {
            config,
            store,
            sink,
        }
    }

    /// Runs until SIGINT, SIGTERM or SIGHUP (Ctrl-C off Unix).
    pub async fn run(self) -> Result<(), AgentError> {
        let signals = Signals::new().map_err(AgentError::Signal)?;
        self.run_until(signals.recv()).await
    }

    /// Runs until `shutdown` completes, then stops every watcher, saving its
    /// offset, and flushes what is left to the sink before returning.
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<(), AgentError> {
        let Agent {
            config,
            store,
            sink,
        } = self;
        config.validate()?;
        let tuning = &config.agent;

        let offsets = OffsetStore::open(config.offset_dir())?;
        let events = EventHub::new(tuning.poll_interval())?;
        let active = active_key(&config.id);
        let key = config_key(&config.id);

        // Watch before reading so no revision slips between the two.
        let revisions = store.watch(&key).await?;
        if store.get(&key).await?.is_none() {
            info!(key = %key, "creating empty configuration");
            store.put(&key, b"[]".to_vec()).await?;
        }
        // From here on every way out marks the agent inactive again.
        store.put(&active, ACTIVE.to_vec()).await?;

        let cancel = CancellationToken::new();
        let sink_cancel = CancellationToken::new();
        let done = CancellationToken::new();

        let (queue_tx, queue_rx) = mpsc::channel(tuning.channel_capacity);
        let (control, ports) = registry::channel(tuning.control_capacity);
        let registry = Arc::new(Registry::new(
            offsets,
            events,
            RegistrySettings {
                poll_interval: tuning.poll_interval(),
                settle_delay: tuning.settle_delay(),
            },
            cancel.clone(),
            queue_tx,
        ));

        let sender = BatchSender::new(
            sink,
            BatchConfig {
                agent_id: config.id.clone(),
                max_batch: config.kafka.queue_size,
                flush_interval: tuning.flush_interval(),
            },
        );
        let sender = tokio::spawn(sender.run(queue_rx, sink_cancel.clone()));
        let starts = tokio::spawn(registry.clone().listen_start(ports.start, control.clone()));
        let closes = tokio::spawn(registry.clone().listen_close(ports.close, done.clone()));

        let tasks = Tasks {
            cancel,
            sink_cancel,
            done,
            sender,
            starts,
            closes,
        };

        let registered = registry
            .register_first(store.as_ref(), &key, &control, tuning.register_delay())
            .await;
        if let Err(e) = registered {
            tasks.abort().await;
            mark_inactive(store.as_ref(), &active).await;
            return Err(e.into());
        }

        let watch = tokio::spawn(watch_config(
            store.clone(),
            key,
            revisions,
            control.clone(),
            tasks.cancel.clone(),
        ));
        info!(id = %config.id, watchers = registry.len(), "agent running");

        shutdown.await;
        info!("shutting down");

        // No new watchers from here on.
        tasks.cancel.cancel();
        join("configuration watch", watch).await;
        join("start listener", tasks.starts).await;

        for collector in registry.collectors() {
            control.close_and_wait(collector).await;
            tokio::time::sleep(tuning.close_delay()).await;
        }

        mark_inactive(store.as_ref(), &active).await;

        tasks.sink_cancel.cancel();
        join("batch sender", tasks.sender).await;
        tasks.done.cancel();
        join("close listener", tasks.closes).await;

        info!("agent stopped");
        Ok(())
    }
}

struct Tasks {
    cancel: CancellationToken,
    sink_cancel: CancellationToken,
    done: CancellationToken,
    sender: JoinHandle<()>,
    starts: JoinHandle<()>,
    closes: JoinHandle<()>,
}

impl Tasks {
    /// Tears down after a failed bootstrap.
    async fn abort(self) {
        self.cancel.cancel();
        self.sink_cancel.cancel();
        self.done.cancel();
        join("start listener", self.starts).await;
        join("close listener", self.closes).await;
        join("batch sender", self.sender).await;
    }
}

async fn mark_inactive(store: &dyn ConfigStore, active: &str) {
    match store.put(active, INACTIVE.to_vec()).await {
        Ok(_) => info!(key = %active, "marked inactive"),
        Err(e) => warn!(key = %active, error = %e, "failed to mark inactive"),
    }
}

async fn join(name: &str, task: JoinHandle<()>) {
    if let Err(e) = task.await {
        error!(task = name, error = %e, "task failed");
    }
}

/// Termination signals. SIGQUIT, SIGUSR1 and SIGUSR2 are swallowed so they
/// don't kill the agent without saving its offsets.
#[cfg(unix)]
pub struct Signals {
    interrupt: tokio::signal::unix::Signal,
    terminate: tokio::signal::unix::Signal,
    hangup: tokio::signal::unix::Signal,
    quit: tokio::signal::unix::Signal,
    user1: tokio::signal::unix::Signal,
    user2: tokio::signal::unix::Signal,
}

#[cfg(unix)]
impl Signals {
    pub fn new() -> std::io::Result<Self> {
        use tokio::signal::unix::{signal, SignalKind};

        Ok(Signals {
            interrupt: signal(SignalKind::interrupt())?,
            terminate: signal(SignalKind::terminate())?,
            hangup: signal(SignalKind::hangup())?,
            quit: signal(SignalKind::quit())?,
            user1: signal(SignalKind::user_defined1())?,
            user2: signal(SignalKind::user_defined2())?,
        })
    }

    /// Resolves on the first shutdown signal.
    pub async fn recv(mut self) {
        loop {
            let name = tokio::select! {
                _ = self.interrupt.recv() => "SIGINT",
                _ = self.terminate.recv() => "SIGTERM",
                _ = self.hangup.recv() => "SIGHUP",
                _ = self.quit.recv() => {
                    info!(signal = "SIGQUIT", "ignoring signal");
                    continue;
                }
                _ = self.user1.recv() => {
                    info!(signal = "SIGUSR1", "ignoring signal");
                    continue;
                }
                _ = self.user2.recv() => {
                    info!(signal = "SIGUSR2", "ignoring signal");
                    continue;
                }
            };
            info!(signal = name, "received shutdown signal");
            return;
        }
    }
}

#[cfg(not(unix))]
pub struct Signals;

#[cfg(not(unix))]
impl Signals {
    pub fn new() -> std::io::Result<Self> {
        Ok(Signals)
    }

    pub async fn recv(self) {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received Ctrl-C"),
            Err(e) => error!(error = %e, "failed to listen for Ctrl-C"),
        }
    }
}
