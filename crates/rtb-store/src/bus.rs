//! Durable topics in the application database.
//!
//! Producers append to `bus_messages`; each consumer group keeps its committed
//! position per topic in `bus_offsets`. Consumers poll, so a record becomes
//! visible within one poll interval.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rusqlite::{params, OptionalExtension};
use rtb_core::{
    bus::{BusConsumer, BusProducer, BusRecord},
    Result,
};
use tokio::sync::Mutex;

use crate::database::{storage_err, ts, Database};

#[derive(Clone)]
pub struct SqliteBus {
    db: Database,
}

impl SqliteBus {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    pub fn consumer(&self, group: &str, topic: &str, poll_interval: Duration) -> SqliteConsumer {
        SqliteConsumer {
            db: self.db.clone(),
            group: group.to_string(),
            topic: topic.to_string(),
            poll_interval,
            cursor: Mutex::new(None),
        }
    }
}

#[async_trait]
impl BusProducer for SqliteBus {
    async fn publish(&self, topic: &str, key: &str, payload: &str) -> Result<()> {
        let row = (topic.to_string(), key.to_string(), payload.to_string(), ts(&Utc::now()));
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO bus_messages (topic, msg_key, payload, created_at) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![row.0, row.1, row.2, row.3],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }
}

pub struct SqliteConsumer {
    db: Database,
    group: String,
    topic: String,
    poll_interval: Duration,
    /// Offset of the last record handed out; loaded from the committed
    /// position on first use.
    cursor: Mutex<Option<i64>>,
}

impl SqliteConsumer {
    /// Last committed offset for this group and topic (0 when none).
    pub async fn committed(&self) -> Result<i64> {
        let (group, topic) = (self.group.clone(), self.topic.clone());
        self.db
            .connection()
            .call(move |conn| {
                let committed = conn
                    .query_row(
                        "SELECT committed FROM bus_offsets WHERE consumer_group = ?1 AND topic = ?2",
                        params![group, topic],
                        |r| r.get::<_, i64>(0),
                    )
                    .optional()?;
                Ok(committed.unwrap_or(0))
            })
            .await
            .map_err(storage_err)
    }

    async fn fetch_after(&self, after: i64) -> Result<Option<BusRecord>> {
        let topic = self.topic.clone();
        self.db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, msg_key, payload FROM bus_messages \
                     WHERE topic = ?1 AND id > ?2 ORDER BY id ASC LIMIT 1",
                    params![topic, after],
                    |r| {
                        Ok(BusRecord {
                            topic: topic.clone(),
                            offset: r.get(0)?,
                            key: r.get(1)?,
                            payload: r.get(2)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(storage_err)
    }
}

#[async_trait]
impl BusConsumer for SqliteConsumer {
    async fn next(&self) -> Result<BusRecord> {
        let mut cursor = self.cursor.lock().await;
        let after = match *cursor {
            Some(c) => c,
            None => self.committed().await?,
        };
        *cursor = Some(after);

        loop {
            if let Some(record) = self.fetch_after(after).await? {
                *cursor = Some(record.offset);
                return Ok(record);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    async fn commit(&self, record: &BusRecord) -> Result<()> {
        let row = (
            self.group.clone(),
            record.topic.clone(),
            record.offset,
            ts(&Utc::now()),
        );
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO bus_offsets (consumer_group, topic, committed, updated_at) \
                     VALUES (?1, ?2, ?3, ?4) \
                     ON CONFLICT (consumer_group, topic) DO UPDATE SET \
                       committed = MAX(bus_offsets.committed, excluded.committed), \
                       updated_at = excluded.updated_at",
                    params![row.0, row.1, row.2, row.3],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }
}
