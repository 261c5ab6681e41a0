use async_trait::async_trait;
use rusqlite::{params, OptionalExtension};
use rtb_core::{
    domain::{BotId, Request},
    ports::RequestRepository,
    Error, Result,
};
use uuid::Uuid;

use crate::database::{parse_ts, parse_uuid, storage_err, ts, Database};

pub struct SqliteRequests {
    db: Database,
}

impl SqliteRequests {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

struct RequestRow {
    id: String,
    user_id: String,
    bot_id: String,
    external_update_ref: Option<i64>,
    text: String,
    response_text: Option<String>,
    created_at: String,
}

impl RequestRow {
    fn into_domain(self) -> Result<Request> {
        Ok(Request {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            bot_id: BotId(self.bot_id),
            external_update_ref: self.external_update_ref,
            text: self.text,
            response_text: self.response_text,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[async_trait]
impl RequestRepository for SqliteRequests {
    async fn insert(&self, request: &Request) -> Result<()> {
        let row = (
            request.id.to_string(),
            request.user_id.to_string(),
            request.bot_id.0.clone(),
            request.external_update_ref,
            request.text.clone(),
            request.response_text.clone(),
            ts(&request.created_at),
        );
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO requests (id, user_id, bot_id, external_update_ref, text, \
                     response_text, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![row.0, row.1, row.2, row.3, row.4, row.5, row.6],
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Request>> {
        let id = id.to_string();
        let row = self
            .db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, bot_id, external_update_ref, text, response_text, \
                     created_at FROM requests WHERE id = ?1",
                    params![id],
                    |row| {
                        Ok(RequestRow {
                            id: row.get(0)?,
                            user_id: row.get(1)?,
                            bot_id: row.get(2)?,
                            external_update_ref: row.get(3)?,
                            text: row.get(4)?,
                            response_text: row.get(5)?,
                            created_at: row.get(6)?,
                        })
                    },
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;
        row.map(RequestRow::into_domain).transpose()
    }

    async fn set_response_text(&self, id: Uuid, text: &str) -> Result<()> {
        let key = id.to_string();
        let text = text.to_string();
        let updated = self
            .db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE requests SET response_text = ?2 WHERE id = ?1",
                    params![key, text],
                )
            })
            .await
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("request {id}")));
        }
        Ok(())
    }
}
