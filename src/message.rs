//! Lines in flight between a watcher and the batching sink.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Local};

use crate::collector::Collector;
use crate::reader::Line;
use crate::sink::{Record, SOURCE_AGENT_HEADER};

/// What the sink may know about the watcher a message came from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Source {
    pub collector: Collector,
    /// The file actually being followed.
    pub file: PathBuf,
}

/// One line on its way to the sink.
///
/// Messages are moved through the shared queue, never copied, and are
/// consumed when the sink turns them into a [`Record`]: the line's buffer
/// becomes the record's value. The bounded queue is what keeps the number of
/// live messages in check.
#[derive(Debug)]
pub struct LogMessage {
    pub content: String,
    pub source: Arc<Source>,
    pub created_at: DateTime<Local>,
}

impl LogMessage {
    pub fn new(line: Line, source: Arc<Source>) -> Self {
        let created_at = line.time();
        let (_, content) = line.into_inner();

        LogMessage {
            content,
            source,
            created_at,
        }
    }

    /// The outgoing record: keyed by the collector path so a source keeps
    /// the same key across daily rotations, and tagged with the agent id.
    pub fn into_record(self, agent_id: &str) -> Record {
        Record {
            topic: self.source.collector.topic.clone(),
            key: self.source.collector.path.clone().into_bytes(),
            value: self.content.into_bytes(),
            headers: vec![(
                SOURCE_AGENT_HEADER.to_string(),
                agent_id.as_bytes().to_vec(),
            )],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_into_record() {
        let source = Arc::new(Source {
            collector: Collector::date("/var/log/app-%F.log", "app-logs"),
            file: PathBuf::from("/var/log/app-2024-03-09.log"),
        });
        let message = LogMessage {
            content: "GET / 200".to_string(),
            source,
            created_at: Local::now(),
        };

        let record = message.into_record("web-01");
        assert_eq!(record.topic, "app-logs");
        assert_eq!(record.key, b"/var/log/app-%F.log");
        assert_eq!(record.value, b"GET / 200");
        assert_eq!(
            record.headers,
            vec![("source_agent".to_string(), b"web-01".to_vec())]
        );
    }
}
