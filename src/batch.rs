//! Turning the stream of lines from every watcher into bounded, periodic
//! writes to the sink.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::message::LogMessage;
use crate::sink::{Record, Sink};

#[derive(Clone, Debug)]
pub struct BatchConfig {
    /// Value of the `source_agent` header.
    pub agent_id: String,
    /// Most records handed to the sink in one call.
    pub max_batch: usize,
    /// How often a non-empty buffer is flushed.
    pub flush_interval: Duration,
}

/// The one consumer of the shared line queue.
///
/// Owns the outgoing buffer outright, so no locking is involved. Records are
/// flushed every `flush_interval`, or as soon as `max_batch` of them are
/// waiting. A failed write is logged and dropped; lines are only shipped
/// again if the agent dies before their offsets are recorded.
pub struct BatchSender<S> {
    sink: S,
    config: BatchConfig,
    buffer: Vec<Record>,
}

impl<S: Sink> BatchSender<S> {
    pub fn new(sink: S, config: BatchConfig) -> Self {
        let max_batch = config.max_batch.max(1);

        BatchSender {
            sink,
            config: BatchConfig {
                max_batch,
                ..config
            },
            buffer: Vec::with_capacity(max_batch),
        }
    }

    /// Number of records waiting to be flushed.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    /// Consumes `queue` until `cancel` fires or every producer is gone, then
    /// ships whatever is left and closes the sink.
    pub async fn run(mut self, mut queue: mpsc::Receiver<LogMessage>, cancel: CancellationToken) {
        let mut tick = tokio::time::interval(self.config.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tick.tick() => {
                    self.flush().await;
                }
                message = queue.recv() => match message {
                    Some(message) => {
                        self.push(message);
                        if self.buffer.len() >= self.config.max_batch {
                            self.flush().await;
                        }
                    }
                    None => break,
                },
            }
        }

        info!("closing batch sender");

        queue.close();
        while let Some(message) = queue.recv().await {
            self.push(message);
        }
        while !self.buffer.is_empty() {
            self.flush().await;
        }

        if let Err(e) = self.sink.close().await {
            error!(error = %e, "failed to close sink");
        }
    }

    fn push(&mut self, message: LogMessage) {
        let record = message.into_record(&self.config.agent_id);
        self.buffer.push(record);
    }

    /// Sends up to `max_batch` records, keeping the rest for the next flush.
    /// Returns how many records left the buffer.
    pub async fn flush(&mut self) -> usize {
        if self.buffer.is_empty() {
            return 0;
        }

        let batch = if self.buffer.len() <= self.config.max_batch {
            std::mem::take(&mut self.buffer)
        } else {
            let rest = self.buffer.split_off(self.config.max_batch);
            std::mem::replace(&mut self.buffer, rest)
        };
        let count = batch.len();

        debug!(count, remaining = self.buffer.len(), "sending batch");
        if let Err(e) = self.sink.write_many(batch).await {
            error!(count, error = %e, "failed to write messages");
        }

        count
    }
}
