use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension, Row};
use rtb_core::{
    domain::{BotId, Payment, PaymentMetadata, PaymentMethod, PaymentStatus},
    ports::PaymentRepository,
    Result,
};
use uuid::Uuid;

use crate::database::{parse_opt_ts, parse_ts, parse_uuid, storage_err, ts, Database};

pub struct SqlitePayments {
    db: Database,
}

impl SqlitePayments {
    pub fn new(db: Database) -> Self {
        Self { db }
    }
}

struct PaymentRow {
    id: String,
    user_id: String,
    bot_id: String,
    amount: i64,
    currency: String,
    method: String,
    provider_transaction_id: String,
    status: String,
    product_id: String,
    product_title: String,
    metadata: String,
    created_at: String,
    succeeded_at: Option<String>,
    failed_at: Option<String>,
    error_message: Option<String>,
}

impl PaymentRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            bot_id: row.get(2)?,
            amount: row.get(3)?,
            currency: row.get(4)?,
            method: row.get(5)?,
            provider_transaction_id: row.get(6)?,
            status: row.get(7)?,
            product_id: row.get(8)?,
            product_title: row.get(9)?,
            metadata: row.get(10)?,
            created_at: row.get(11)?,
            succeeded_at: row.get(12)?,
            failed_at: row.get(13)?,
            error_message: row.get(14)?,
        })
    }

    fn into_domain(self) -> Result<Payment> {
        Ok(Payment {
            id: parse_uuid(&self.id)?,
            user_id: parse_uuid(&self.user_id)?,
            bot_id: BotId(self.bot_id),
            amount: self.amount,
            currency: self.currency,
            method: PaymentMethod::parse(&self.method)?,
            provider_transaction_id: self.provider_transaction_id,
            status: PaymentStatus::parse(&self.status)?,
            product_id: self.product_id,
            product_title: self.product_title,
            metadata: serde_json::from_str::<PaymentMetadata>(&self.metadata)?,
            created_at: parse_ts(&self.created_at)?,
            succeeded_at: parse_opt_ts(self.succeeded_at)?,
            failed_at: parse_opt_ts(self.failed_at)?,
            error_message: self.error_message,
        })
    }
}

#[async_trait]
impl PaymentRepository for SqlitePayments {
    async fn insert(&self, p: &Payment) -> Result<()> {
        let values: Vec<rusqlite::types::Value> = vec![
            p.id.to_string().into(),
            p.user_id.to_string().into(),
            p.bot_id.0.clone().into(),
            p.amount.into(),
            p.currency.clone().into(),
            p.method.as_str().to_string().into(),
            p.provider_transaction_id.clone().into(),
            p.status.as_str().to_string().into(),
            p.product_id.clone().into(),
            p.product_title.clone().into(),
            serde_json::to_string(&p.metadata)?.into(),
            ts(&p.created_at).into(),
            p.succeeded_at.as_ref().map(ts).into(),
            p.failed_at.as_ref().map(ts).into(),
            p.error_message.clone().into(),
        ];
        self.db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO payments (id, user_id, bot_id, amount, currency, method, \
                     provider_transaction_id, status, product_id, product_title, metadata, \
                     created_at, succeeded_at, failed_at, error_message) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
                    rusqlite::params_from_iter(values),
                )?;
                Ok(())
            })
            .await
            .map_err(storage_err)
    }

    async fn get(&self, id: Uuid) -> Result<Option<Payment>> {
        let id = id.to_string();
        let row = self
            .db
            .connection()
            .call(move |conn| {
                conn.query_row(
                    "SELECT id, user_id, bot_id, amount, currency, method, \
                     provider_transaction_id, status, product_id, product_title, metadata, \
                     created_at, succeeded_at, failed_at, error_message \
                     FROM payments WHERE id = ?1",
                    params![id],
                    PaymentRow::from_row,
                )
                .optional()
            })
            .await
            .map_err(storage_err)?;
        row.map(PaymentRow::into_domain).transpose()
    }

    async fn mark_succeeded(
        &self,
        id: Uuid,
        provider_transaction_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool> {
        let (id, tx, at) = (id.to_string(), provider_transaction_id.to_string(), ts(&at));
        let updated = self
            .db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE payments SET status = 'succeeded', provider_transaction_id = ?2, \
                     succeeded_at = ?3 WHERE id = ?1 AND status = 'pending'",
                    params![id, tx, at],
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(updated == 1)
    }

    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<bool> {
        let (id, error, at) = (id.to_string(), error.to_string(), ts(&at));
        let updated = self
            .db
            .connection()
            .call(move |conn| {
                conn.execute(
                    "UPDATE payments SET status = 'failed', error_message = ?2, failed_at = ?3 \
                     WHERE id = ?1 AND status = 'pending'",
                    params![id, error, at],
                )
            })
            .await
            .map_err(storage_err)?;
        Ok(updated == 1)
    }
}
