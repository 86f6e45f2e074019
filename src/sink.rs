//! The message sink lines are delivered to.

use async_trait::async_trait;
use thiserror::Error;

/// Header naming the agent that shipped a record.
pub const SOURCE_AGENT_HEADER: &str = "source_agent";

/// A message as the sink sees it.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Record {
    pub topic: String,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub headers: Vec<(String, Vec<u8>)>,
}

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to deliver {failed} of {total} records: {reason}")]
    Delivery {
        failed: usize,
        total: usize,
        reason: String,
    },
    #[error("invalid sink configuration: {0}")]
    Configuration(String),
    #[cfg(feature = "kafka")]
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
}

/// A topic-addressed batch writer.
///
/// `write_many` returns once every record was acknowledged or failed.
#[async_trait]
pub trait Sink: Send {
    async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError>;

    /// Flushes and releases the connection.
    async fn close(&mut self) -> Result<(), SinkError>;
}

#[async_trait]
impl<S: Sink + ?Sized> Sink for Box<S> {
    async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError> {
        (**self).write_many(records).await
    }

    async fn close(&mut self) -> Result<(), SinkError> {
        (**self).close().await
    }
}

#[cfg(feature = "kafka")]
pub use self::kafka::KafkaSink;

#[cfg(feature = "kafka")]
mod kafka {
    use std::time::Duration;

    use async_trait::async_trait;
    use futures_util::future::join_all;
    use rdkafka::message::{Header, OwnedHeaders};
    use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
    use rdkafka::util::Timeout;
    use rdkafka::ClientConfig;
    use tracing::{debug, info};

    use super::{Record, Sink, SinkError};

    const QUEUE_TIMEOUT: Duration = Duration::from_secs(5);
    const FLUSH_TIMEOUT: Duration = Duration::from_secs(10);

    /// Kafka producer writing each record to its own topic.
    pub struct KafkaSink {
        producer: FutureProducer,
    }

    impl KafkaSink {
        /// Connects to a comma-separated list of brokers.
        pub fn connect(brokers: &str) -> Result<Self, SinkError> {
            if brokers.trim().is_empty() {
                return Err(SinkError::Configuration("no Kafka brokers given".to_string()));
            }

            let producer: FutureProducer = ClientConfig::new()
                .set("bootstrap.servers", brokers)
                .set("message.timeout.ms", "30000")
                .create()?;

            info!(brokers, "connected Kafka producer");
            Ok(KafkaSink { producer })
        }
    }

    #[async_trait]
    impl Sink for KafkaSink {
        async fn write_many(&mut self, records: Vec<Record>) -> Result<(), SinkError> {
            let total = records.len();

            let sends = records.iter().map(|record| {
                let headers = record.headers.iter().fold(OwnedHeaders::new(), |headers, (key, value)| {
                    headers.insert(Header {
                        key: key.as_str(),
                        value: Some(value.as_slice()),
                    })
                });
                let message = FutureRecord::to(&record.topic)
                    .key(record.key.as_slice())
                    .payload(record.value.as_slice())
                    .headers(headers);

                self.producer.send(message, Timeout::After(QUEUE_TIMEOUT))
            });

            let mut failed = 0;
            let mut reason = String::new();
            for result in join_all(sends).await {
                if let Err((e, _message)) = result {
                    failed += 1;
                    reason = e.to_string();
                }
            }

            if failed > 0 {
                return Err(SinkError::Delivery {
                    failed,
                    total,
                    reason,
                });
            }

            debug!(total, "delivered records to Kafka");
            Ok(())
        }

        async fn close(&mut self) -> Result<(), SinkError> {
            self.producer.flush(Timeout::After(FLUSH_TIMEOUT))?;
            Ok(())
        }
    }
}
