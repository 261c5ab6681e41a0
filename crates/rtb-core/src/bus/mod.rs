//! Message bus ports and the consumer loop.
//!
//! Delivery is at-least-once: a record's offset is committed only after its
//! handler returned. Handler failures never block the partition. Business
//! errors are committed silently, anything else is parked in the dead-letter
//! store first.

#[cfg(any(test, feature = "test-util"))]
pub mod memory;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::{ports::DeadLetterRepository, Result};

const NEXT_ERROR_BACKOFF: Duration = Duration::from_secs(1);

/// Work item for the RAG processor, keyed by `request_id`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagRequestMessage {
    pub request_id: String,
    pub request_text: String,
    pub context_blob: String,
}

/// Answer from the RAG processor.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RagReplyMessage {
    pub request_id: String,
    #[serde(default)]
    pub response_text: String,
    /// Set when the processor gave up on the request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One consumed record. `offset` is monotonic per topic.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusRecord {
    pub topic: String,
    pub offset: i64,
    pub key: String,
    pub payload: String,
}

#[async_trait]
pub trait BusProducer: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()>;
}

#[async_trait]
pub trait BusConsumer: Send + Sync {
    /// Wait for the next record after the last one handed out.
    async fn next(&self) -> Result<BusRecord>;

    /// Persist that everything up to and including `record` is consumed.
    async fn commit(&self, record: &BusRecord) -> Result<()>;
}

#[async_trait]
pub trait BusHandler: Send + Sync {
    async fn handle(&self, record: &BusRecord) -> Result<()>;
}

/// A record whose handler failed with an infrastructure error.
#[derive(Clone, Debug, PartialEq)]
pub struct DeadLetter {
    pub id: Uuid,
    pub topic: String,
    pub key: String,
    pub payload: String,
    pub reason: String,
    pub created_at: DateTime<Utc>,
    pub replayed_at: Option<DateTime<Utc>>,
}

impl DeadLetter {
    pub fn from_record(record: &BusRecord, reason: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            topic: record.topic.clone(),
            key: record.key.clone(),
            payload: record.payload.clone(),
            reason: reason.into(),
            created_at: Utc::now(),
            replayed_at: None,
        }
    }
}

/// Consume until `cancel` fires.
pub async fn run_consumer(
    consumer: Arc<dyn BusConsumer>,
    handler: Arc<dyn BusHandler>,
    dead_letters: Arc<dyn DeadLetterRepository>,
    cancel: CancellationToken,
) {
    tracing::info!("bus consumer started");
    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            next = consumer.next() => next,
        };

        let record = match record {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!(error = %e, "bus receive failed");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(NEXT_ERROR_BACKOFF) => continue,
                }
            }
        };

        process_record(consumer.as_ref(), handler.as_ref(), dead_letters.as_ref(), &record).await;
    }
    tracing::info!("bus consumer stopped");
}

async fn process_record(
    consumer: &dyn BusConsumer,
    handler: &dyn BusHandler,
    dead_letters: &dyn DeadLetterRepository,
    record: &BusRecord,
) {
    match handler.handle(record).await {
        Ok(()) => {}
        Err(e) if e.is_business() => {
            tracing::debug!(
                topic = %record.topic,
                offset = record.offset,
                error = %e,
                "bus record skipped"
            );
        }
        Err(e) => {
            tracing::error!(
                topic = %record.topic,
                offset = record.offset,
                key = %record.key,
                error = %e,
                "bus handler failed; dead-lettering"
            );
            let letter = DeadLetter::from_record(record, e.to_string());
            if let Err(store_err) = dead_letters.insert(&letter).await {
                tracing::error!(
                    topic = %record.topic,
                    offset = record.offset,
                    payload = %record.payload,
                    error = %store_err,
                    "dead-letter write failed; record dropped"
                );
            }
        }
    }

    if let Err(e) = consumer.commit(record).await {
        tracing::warn!(topic = %record.topic, offset = record.offset, error = %e, "bus commit failed");
    }
}

/// Republishes parked records to their original topic.
pub struct DeadLetterReplayer {
    dead_letters: Arc<dyn DeadLetterRepository>,
    producer: Arc<dyn BusProducer>,
}

impl DeadLetterReplayer {
    pub fn new(dead_letters: Arc<dyn DeadLetterRepository>, producer: Arc<dyn BusProducer>) -> Self {
        Self {
            dead_letters,
            producer,
        }
    }

    /// Replays up to `limit` pending letters, oldest first. Stops at the
    /// first publish failure so nothing is marked replayed without being sent.
    pub async fn replay_pending(&self, limit: usize) -> Result<usize> {
        let pending = self.dead_letters.list_pending(limit).await?;
        let mut replayed = 0;
        for letter in pending {
            self.producer
                .publish(&letter.topic, &letter.key, &letter.payload)
                .await?;
            self.dead_letters.mark_replayed(letter.id, Utc::now()).await?;
            tracing::info!(id = %letter.id, topic = %letter.topic, "dead letter replayed");
            replayed += 1;
        }
        Ok(replayed)
    }
}

#[cfg(test)]
mod tests {
    use super::memory::MemoryBus;
    use super::*;
    use crate::errors::Error;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryDeadLetters {
        letters: Mutex<Vec<DeadLetter>>,
    }

    #[async_trait]
    impl DeadLetterRepository for MemoryDeadLetters {
        async fn insert(&self, letter: &DeadLetter) -> Result<()> {
            self.letters.lock().unwrap().push(letter.clone());
            Ok(())
        }

        async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>> {
            Ok(self
                .letters
                .lock()
                .unwrap()
                .iter()
                .filter(|l| l.replayed_at.is_none())
                .take(limit)
                .cloned()
                .collect())
        }

        async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
            for l in self.letters.lock().unwrap().iter_mut() {
                if l.id == id {
                    l.replayed_at = Some(at);
                }
            }
            Ok(())
        }
    }

    /// Fails according to the payload: "business", "boom" or ok.
    struct ScriptedHandler {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl BusHandler for ScriptedHandler {
        async fn handle(&self, record: &BusRecord) -> Result<()> {
            self.seen.lock().unwrap().push(record.payload.clone());
            match record.payload.as_str() {
                "business" => Err(Error::NotFound("request".to_string())),
                "boom" => Err(Error::Storage("database is locked".to_string())),
                _ => Ok(()),
            }
        }
    }

    #[tokio::test]
    async fn consumer_commits_everything_and_dead_letters_infra_errors() {
        let bus = Arc::new(MemoryBus::new());
        let consumer = Arc::new(bus.consumer("replies"));
        let handler = Arc::new(ScriptedHandler {
            seen: Mutex::new(Vec::new()),
        });
        let dead = Arc::new(MemoryDeadLetters::default());
        let cancel = CancellationToken::new();

        for payload in ["ok", "business", "boom", "last"] {
            bus.publish("replies", "k", payload).await.unwrap();
        }

        let task = tokio::spawn(run_consumer(
            consumer.clone(),
            handler.clone(),
            dead.clone(),
            cancel.clone(),
        ));

        tokio::time::timeout(Duration::from_secs(2), async {
            while consumer.committed() < 4 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        cancel.cancel();
        task.await.unwrap();

        assert_eq!(
            *handler.seen.lock().unwrap(),
            vec!["ok", "business", "boom", "last"]
        );
        let letters = dead.letters.lock().unwrap().clone();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload, "boom");
        assert_eq!(letters[0].topic, "replies");
        assert!(letters[0].reason.contains("database is locked"));
    }

    #[tokio::test]
    async fn consumer_stops_on_cancel_while_idle() {
        let bus = Arc::new(MemoryBus::new());
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run_consumer(
            Arc::new(bus.consumer("replies")),
            Arc::new(ScriptedHandler {
                seen: Mutex::new(Vec::new()),
            }),
            Arc::new(MemoryDeadLetters::default()),
            cancel.clone(),
        ));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn replayer_republishes_to_original_topic_once() {
        let bus = Arc::new(MemoryBus::new());
        let dead = Arc::new(MemoryDeadLetters::default());
        let record = BusRecord {
            topic: "replies".to_string(),
            offset: 3,
            key: "req-1".to_string(),
            payload: "{}".to_string(),
        };
        dead.insert(&DeadLetter::from_record(&record, "timeout"))
            .await
            .unwrap();

        let replayer = DeadLetterReplayer::new(dead.clone(), bus.clone());
        assert_eq!(replayer.replay_pending(10).await.unwrap(), 1);
        assert_eq!(replayer.replay_pending(10).await.unwrap(), 0);

        let published = bus.records("replies");
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].key, "req-1");
        assert_eq!(published[0].payload, "{}");
    }

    #[test]
    fn reply_error_field_is_optional() {
        let reply: RagReplyMessage =
            serde_json::from_str(r#"{"request_id":"abc","response_text":"hi"}"#).unwrap();
        assert_eq!(reply.error, None);

        let failed: RagReplyMessage =
            serde_json::from_str(r#"{"request_id":"abc","error":"index offline"}"#).unwrap();
        assert_eq!(failed.response_text, "");
        assert_eq!(failed.error.as_deref(), Some("index offline"));
    }
}
