//! In-process bus for tests. Records are kept for the life of the bus so
//! tests can inspect what was published.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use async_trait::async_trait;
use tokio::sync::Notify;

use super::{BusConsumer, BusProducer, BusRecord};
use crate::Result;

#[derive(Default)]
struct Topics {
    logs: Mutex<HashMap<String, Vec<BusRecord>>>,
    appended: Notify,
}

#[derive(Clone, Default)]
pub struct MemoryBus {
    topics: Arc<Topics>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Independent reader of `topic`, starting at the beginning.
    pub fn consumer(&self, topic: &str) -> MemoryConsumer {
        MemoryConsumer {
            topics: self.topics.clone(),
            topic: topic.to_string(),
            cursor: Mutex::new(0),
            committed: AtomicI64::new(0),
        }
    }

    /// Everything ever published to `topic`.
    pub fn records(&self, topic: &str) -> Vec<BusRecord> {
        let logs = self
            .topics
            .logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        logs.get(topic).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl BusProducer for MemoryBus {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        {
            let mut logs = self
                .topics
                .logs
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            let log = logs.entry(topic.to_string()).or_default();
            let offset = log.len() as i64;
            log.push(BusRecord {
                topic: topic.to_string(),
                offset,
                key: key.to_string(),
                payload: payload.to_string(),
            });
        }
        self.topics.appended.notify_waiters();
        Ok(())
    }
}

pub struct MemoryConsumer {
    topics: Arc<Topics>,
    topic: String,
    cursor: Mutex<usize>,
    committed: AtomicI64,
}

impl MemoryConsumer {
    /// Offset of the first record not yet committed.
    pub fn committed(&self) -> i64 {
        self.committed.load(Ordering::SeqCst)
    }

    fn try_next(&self) -> Option<BusRecord> {
        let logs = self
            .topics
            .logs
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut cursor = self
            .cursor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let record = logs.get(&self.topic)?.get(*cursor)?.clone();
        *cursor += 1;
        Some(record)
    }
}

#[async_trait]
impl BusConsumer for MemoryConsumer {
    async fn next(&self) -> Result<BusRecord> {
        loop {
            let appended = self.topics.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if let Some(record) = self.try_next() {
                return Ok(record);
            }
            appended.await;
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<()> {
        self.committed.fetch_max(record.offset + 1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn next_waits_for_publish() {
        let bus = MemoryBus::new();
        let consumer = bus.consumer("t");

        let publisher = bus.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            publisher.publish("t", "k1", "first").await.unwrap();
        });

        let rec = tokio::time::timeout(Duration::from_secs(1), consumer.next())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rec.offset, 0);
        assert_eq!(rec.key, "k1");
        assert_eq!(rec.payload, "first");
    }

    #[tokio::test]
    async fn consumers_read_their_topic_in_order() {
        let bus = MemoryBus::new();
        bus.publish("a", "1", "a0").await.unwrap();
        bus.publish("b", "1", "b0").await.unwrap();
        bus.publish("a", "2", "a1").await.unwrap();

        let a = bus.consumer("a");
        assert_eq!(a.next().await.unwrap().payload, "a0");
        let second = a.next().await.unwrap();
        assert_eq!((second.offset, second.payload.as_str()), (1, "a1"));

        a.commit(&second).await.unwrap();
        assert_eq!(a.committed(), 2);
        assert_eq!(bus.records("b").len(), 1);
    }
}
