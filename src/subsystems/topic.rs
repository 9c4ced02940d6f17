//! In-process event streams.
//!
//! A [`Topic`] is a named, ordered, append-only log.  Any number of
//! producers may append; consumers either read a range by offset or
//! [`Topic::subscribe`] to records as they are appended.  Appends are
//! serialised through a single lock, so records from one producer keep their
//! relative order and every record gets a unique, gap-free offset.
//!
//! [`TopicRegistry`] hands out shared topics by name.  It stands in for an
//! external broker; its datastore descriptor is retained for diagnostics
//! only.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::config::DataSource;

/// Live subscribers that fall this far behind lose the oldest records and
/// must re-read by offset.
const LIVE_BUFFER: usize = 256;

/// One appended record.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Record {
    pub offset: u64,
    pub key: String,
    pub value: serde_json::Value,
}

struct TopicInner {
    name: String,
    log: RwLock<Vec<Arc<Record>>>,
    live: broadcast::Sender<Arc<Record>>,
}

/// Shared handle to one named stream.  Clone freely.
#[derive(Clone)]
pub struct Topic {
    inner: Arc<TopicInner>,
}

impl Topic {
    fn new(name: &str) -> Self {
        let (live, _) = broadcast::channel(LIVE_BUFFER);
        Self {
            inner: Arc::new(TopicInner {
                name: name.to_string(),
                log: RwLock::new(Vec::new()),
                live,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Append a record and return its offset.
    pub async fn produce(&self, key: impl Into<String>, value: serde_json::Value) -> u64 {
        let mut log = self.inner.log.write().await;
        let offset = log.len() as u64;
        let record = Arc::new(Record {
            offset,
            key: key.into(),
            value,
        });
        log.push(record.clone());
        // Sending under the lock keeps live delivery in offset order.
        let _ = self.inner.live.send(record);
        offset
    }

    /// Records with `offset >= from`, at most `limit` of them.
    pub async fn read(&self, from: u64, limit: usize) -> Vec<Arc<Record>> {
        let log = self.inner.log.read().await;
        log.iter().skip(from as usize).take(limit).cloned().collect()
    }

    /// Offset the next appended record will get.
    pub async fn next_offset(&self) -> u64 {
        self.inner.log.read().await.len() as u64
    }

    /// Receive every record appended after this call.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<Record>> {
        self.inner.live.subscribe()
    }
}

/// Name → topic map shared by all components.
#[derive(Clone)]
pub struct TopicRegistry {
    source: DataSource,
    topics: Arc<RwLock<HashMap<String, Topic>>>,
}

impl TopicRegistry {
    pub fn new(source: DataSource) -> Self {
        Self {
            source,
            topics: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn source(&self) -> &DataSource {
        &self.source
    }

    /// Get or create the topic called `name`.
    pub async fn topic(&self, name: &str) -> Topic {
        if let Some(topic) = self.topics.read().await.get(name) {
            return topic.clone();
        }
        let mut topics = self.topics.write().await;
        topics
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(topic = name, "creating topic");
                Topic::new(name)
            })
            .clone()
    }

    /// Names of all topics created so far, sorted.
    pub async fn names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.topics.read().await.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> TopicRegistry {
        TopicRegistry::new(DataSource::new("postgres://u:p@localhost:5432/log"))
    }

    #[tokio::test]
    async fn same_name_yields_same_topic() {
        let reg = registry();
        let a = reg.topic("roomserverOutput").await;
        let b = reg.topic("roomserverOutput").await;
        a.produce("k", json!(1)).await;
        assert_eq!(b.next_offset().await, 1);
        assert_eq!(reg.names().await, vec!["roomserverOutput"]);
    }

    #[tokio::test]
    async fn offsets_are_sequential() {
        let topic = registry().topic("t").await;
        assert_eq!(topic.produce("a", json!("x")).await, 0);
        assert_eq!(topic.produce("a", json!("y")).await, 1);
        let records = topic.read(1, 10).await;
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].value, json!("y"));
    }

    #[tokio::test]
    async fn subscribers_see_new_records_in_order() {
        let topic = registry().topic("t").await;
        topic.produce("old", json!(0)).await;
        let mut rx = topic.subscribe();
        topic.produce("new", json!(1)).await;
        topic.produce("new", json!(2)).await;
        assert_eq!(rx.recv().await.unwrap().offset, 1);
        assert_eq!(rx.recv().await.unwrap().offset, 2);
    }

    #[tokio::test]
    async fn concurrent_producers_keep_their_own_order() {
        let topic = registry().topic("t").await;
        let mut tasks = Vec::new();
        for producer in 0..4 {
            let topic = topic.clone();
            tasks.push(tokio::spawn(async move {
                for seq in 0..50 {
                    topic.produce(format!("p{producer}"), json!(seq)).await;
                }
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let records = topic.read(0, usize::MAX).await;
        assert_eq!(records.len(), 200);
        for producer in 0..4 {
            let key = format!("p{producer}");
            let seqs: Vec<_> = records
                .iter()
                .filter(|r| r.key == key)
                .map(|r| r.value.as_i64().unwrap())
                .collect();
            assert_eq!(seqs, (0..50).collect::<Vec<_>>());
        }
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.offset, i as u64);
        }
    }
}
