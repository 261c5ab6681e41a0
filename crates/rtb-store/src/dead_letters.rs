use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::params;
use rtb_core::{bus::DeadLetter, ports::DeadLetterRepository, Result};
use uuid::Uuid;

use crate::database::{parse_opt_ts, parse_ts, parse_uuid, storage_err, ts, Database};

/// Records whose handler failed, kept with their payload until replayed.
pub struct SqliteDeadLetters {
    db: Database,
}

impl SqliteDeadLetters {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

#[async_trait]
impl DeadLetterRepository for SqliteDeadLetters {
    async fn insert(&self, letter: &DeadLetter) -> Result<()> {
        let row = (
            letter.id.to_string(),
            letter.topic.clone(),
            letter.key.clone(),
            letter.payload.clone(),
            letter.reason.clone(),
            ts(&letter.created_at),
            letter.replayed_at.as_ref().map(ts),
        );
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO dead_letters (id, topic, msg_key, payload, reason, created_at, \
                     replayed_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![row.0, row.1, row.2, row.3, row.4, row.5, row.6],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        type Raw = (String, String, String, String, String, String, Option<String>);
        let rows: Vec<Raw> = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, topic, msg_key, payload, reason, created_at, replayed_at \
                     FROM dead_letters WHERE replayed_at IS NULL \
                     ORDER BY created_at ASC LIMIT ?1",
                )?;
                let rows = stmt
                    .query_map(params![limit], |r| {
                        Ok((
                            r.get(0)?,
                            r.get(1)?,
                            r.get(2)?,
                            r.get(3)?,
                            r.get(4)?,
                            r.get(5)?,
                            r.get(6)?,
                        ))
                    })?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_err)?;

        rows.into_iter()
            .map(|(id, topic, key, payload, reason, created_at, replayed_at)| {
                Ok(DeadLetter {
                    id: parse_uuid(&id)?,
                    topic,
                    key,
                    payload,
                    reason,
                    created_at: parse_ts(&created_at)?,
                    replayed_at: parse_opt_ts(replayed_at)?,
                })
            })
            .collect()
    }

    async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()> {
        let (id, at) = (id.to_string(), ts(&at));
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE dead_letters SET replayed_at = ?2 WHERE id = ?1",
                    params![id, at],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }
}
