use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, types::Type, OptionalExtension, Row, TransactionBehavior};
use rtb_core::{
    domain::{BotId, ChatId, IncomingUser, TelegramUserId, User},
    ports::UserRepository,
    Error, Result,
};
use uuid::Uuid;

use crate::database::{parse_opt_ts, parse_ts, parse_uuid, storage_err, ts, Database};

const COLUMNS: &str =
    "id, bot_id, telegram_user_id, chat_id, username, is_paid, paid_until, created_at";

pub struct SqliteUsers {
    db: Database,
}

impl SqliteUsers {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn query(&self, sql: String, args: Vec<rusqlite::types::Value>) -> Result<Vec<User>> {
        let rows = self
            .db
            .connection()
            .call(move |conn| {
                let mut stmt = conn.prepare(&sql)?;
                let rows = stmt
                    .query_map(rusqlite::params_from_iter(args), UserRow::from_row)?
                    .collect::<rusqlite::Result<Vec<_>>>()?;
                Ok(rows)
            })
            .await
            .map_err(storage_err)?;
        rows.into_iter().map(UserRow::into_domain).collect()
    }

    async fn query_one(
        &self,
        sql: String,
        args: Vec<rusqlite::types::Value>,
    ) -> Result<Option<User>> {
        Ok(self.query(sql, args).await?.into_iter().next())
    }
}

struct UserRow {
    id: String,
    bot_id: String,
    telegram_user_id: i64,
    chat_id: i64,
    username: Option<String>,
    is_paid: bool,
    paid_until: Option<String>,
    created_at: String,
}

impl UserRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            bot_id: row.get(1)?,
            telegram_user_id: row.get(2)?,
            chat_id: row.get(3)?,
            username: row.get(4)?,
            is_paid: row.get(5)?,
            paid_until: row.get(6)?,
            created_at: row.get(7)?,
        })
    }

    fn into_domain(self) -> Result<User> {
        Ok(User {
            id: parse_uuid(&self.id)?,
            bot_id: BotId(self.bot_id),
            telegram_user_id: TelegramUserId(self.telegram_user_id),
            chat_id: ChatId(self.chat_id),
            username: self.username,
            is_paid: self.is_paid,
            paid_until: parse_opt_ts(self.paid_until)?,
            created_at: parse_ts(&self.created_at)?,
        })
    }
}

#[async_trait]
impl UserRepository for SqliteUsers {
    async fn upsert(&self, incoming: &IncomingUser) -> Result<User> {
        let row = (
            Uuid::new_v4().to_string(),
            incoming.bot_id.0.clone(),
            incoming.telegram_user_id.0,
            incoming.chat_id.0,
            incoming.username.clone(),
            ts(&Utc::now()),
        );
        let user = self
            .db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    &format!(
                        "INSERT INTO users (id, bot_id, telegram_user_id, chat_id, username, \
                         is_paid, paid_until, created_at) \
                         VALUES (?1, ?2, ?3, ?4, ?5, 0, NULL, ?6) \
                         ON CONFLICT (bot_id, telegram_user_id) DO UPDATE SET \
                           chat_id = excluded.chat_id, \
                           username = COALESCE(excluded.username, users.username) \
                         RETURNING {COLUMNS}"
                    ),
                    params![row.0, row.1, row.2, row.3, row.4, row.5],
                    UserRow::from_row,
                )
            })
            .await
            .map_err(storage_err)?;
        user.into_domain()
    }

    async fn get(&self, id: Uuid) -> Result<Option<User>> {
        self.query_one(
            format!("SELECT {COLUMNS} FROM users WHERE id = ?1"),
            vec![id.to_string().into()],
        )
        .await
    }

    async fn find_by_telegram(
        &self,
        bot: &BotId,
        telegram_user_id: TelegramUserId,
    ) -> Result<Option<User>> {
        self.query_one(
            format!("SELECT {COLUMNS} FROM users WHERE bot_id = ?1 AND telegram_user_id = ?2"),
            vec![bot.0.clone().into(), telegram_user_id.0.into()],
        )
        .await
    }

    async fn grant_paid(&self, id: Uuid, paid_until: DateTime<Utc>) -> Result<()> {
        let (key, until) = (id.to_string(), ts(&paid_until));
        let updated = self
            .db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE users SET is_paid = 1, paid_until = ?2 WHERE id = ?1",
                    params![key, until],
                )
            })
            .await
            .map_err(storage_err)?;
        if updated == 0 {
            return Err(Error::NotFound(format!("user {id}")));
        }
        Ok(())
    }

    async fn extend_paid(
        &self,
        id: Uuid,
        now: DateTime<Utc>,
        days: u32,
    ) -> Result<DateTime<Utc>> {
        let key = id.to_string();
        let extended = self
            .db
            .connection()
            .call(move |conn| {
                let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
                let current: Option<Option<String>> = tx
                    .query_row(
                        "SELECT paid_until FROM users WHERE id = ?1",
                        params![key],
                        |r| r.get(0),
                    )
                    .optional()?;
                let Some(current) = current else {
                    return Ok(None);
                };
                let current = current
                    .map(|s| {
                        DateTime::parse_from_rfc3339(&s)
                            .map(|dt| dt.with_timezone(&Utc))
                            .map_err(|e| {
                                rusqlite::Error::FromSqlConversionFailure(0, Type::Text, Box::new(e))
                            })
                    })
                    .transpose()?;

                let base = match current {
                    Some(until) if until > now => until,
                    _ => now,
                };
                let until = base + Duration::days(i64::from(days));
                tx.execute(
                    "UPDATE users SET is_paid = 1, paid_until = ?2 WHERE id = ?1",
                    params![key, ts(&until)],
                )?;
                tx.commit()?;
                Ok(Some(until))
            })
            .await
            .map_err(storage_err)?;
        extended.ok_or_else(|| Error::NotFound(format!("user {id}")))
    }

    async fn revoke_expired(&self, now: DateTime<Utc>) -> Result<Vec<User>> {
        self.query(
            format!(
                "UPDATE users SET is_paid = 0 \
                 WHERE is_paid = 1 AND paid_until IS NOT NULL AND paid_until <= ?1 \
                 RETURNING {COLUMNS}"
            ),
            vec![ts(&now).into()],
        )
        .await
    }

    async fn list(&self, only_unpaid: bool) -> Result<Vec<User>> {
        self.query(
            format!(
                "SELECT {COLUMNS} FROM users WHERE (?1 = 0 OR is_paid = 0) \
                 ORDER BY created_at ASC, id ASC"
            ),
            vec![i64::from(only_unpaid).into()],
        )
        .await
    }
}
