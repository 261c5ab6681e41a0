//! Hexagonal ports for persistence and the payment provider.
//!
//! The SQLite adapter lives in `rtb-store`; the Telegram payment adapter in
//! `rtb-telegram`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    bus::DeadLetter,
    domain::{BotId, ChatId, IncomingUser, Payment, Request, TelegramUserId, User},
    status::{NewStatus, ObjectType, Status},
    Result,
};

#[async_trait]
pub trait RequestRepository: Send + Sync {
    async fn insert(&self, request: &Request) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Request>>;
    async fn set_response_text(&self, id: Uuid, text: &str) -> Result<()>;
}

/// Append-only status storage. Implementations assign `id` and the
/// per-object `seq`.
#[async_trait]
pub trait StatusRepository: Send + Sync {
    async fn insert(&self, status: NewStatus) -> Result<Status>;

    /// Row with the greatest `created_at` (ties broken by `seq`).
    async fn latest(&self, object_type: ObjectType, object_id: Uuid) -> Result<Option<Status>>;

    /// Full history ordered by `created_at` ascending.
    async fn list_by_object(&self, object_type: ObjectType, object_id: Uuid)
        -> Result<Vec<Status>>;
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    /// Find the user for `(bot, telegram user)` or create it; refreshes chat id
    /// and username on every call.
    async fn upsert(&self, incoming: &IncomingUser) -> Result<User>;
    async fn get(&self, id: Uuid) -> Result<Option<User>>;
    async fn find_by_telegram(
        &self,
        bot: &BotId,
        telegram_user_id: TelegramUserId,
    ) -> Result<Option<User>>;

    /// Set the paid flag and its expiry.
    async fn grant_paid(&self, id: Uuid, paid_until: DateTime<Utc>) -> Result<()>;

    /// Set the paid flag and push the expiry `days` past whichever is later,
    /// `now` or the current expiry, as one atomic step. Returns the new expiry.
    async fn extend_paid(&self, id: Uuid, now: DateTime<Utc>, days: u32)
        -> Result<DateTime<Utc>>;

    /// Clear the paid flag of every user whose `paid_until <= now`; returns them.
    async fn revoke_expired(&self, now: DateTime<Utc>) -> Result<Vec<User>>;

    async fn list(&self, only_unpaid: bool) -> Result<Vec<User>>;
}

#[async_trait]
pub trait PaymentRepository: Send + Sync {
    async fn insert(&self, payment: &Payment) -> Result<()>;
    async fn get(&self, id: Uuid) -> Result<Option<Payment>>;

    /// `pending -> succeeded` as one conditional write. `false` when the row
    /// was not pending (someone else already moved it).
    async fn mark_succeeded(
        &self,
        id: Uuid,
        provider_transaction_id: &str,
        at: DateTime<Utc>,
    ) -> Result<bool>;

    /// `pending -> failed` as one conditional write.
    async fn mark_failed(&self, id: Uuid, error: &str, at: DateTime<Utc>) -> Result<bool>;
}

#[async_trait]
pub trait DeadLetterRepository: Send + Sync {
    async fn insert(&self, letter: &DeadLetter) -> Result<()>;
    async fn list_pending(&self, limit: usize) -> Result<Vec<DeadLetter>>;
    async fn mark_replayed(&self, id: Uuid, at: DateTime<Utc>) -> Result<()>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InvoiceRequest {
    pub bot: BotId,
    pub chat_id: ChatId,
    pub title: String,
    pub description: String,
    /// Opaque token echoed back by the provider in its callbacks.
    pub payload: String,
    pub currency: String,
    pub amount: i64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Invoice {
    pub invoice_id: String,
}

#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_invoice(&self, req: InvoiceRequest) -> Result<Invoice>;

    /// Answer a pre-authorization (pre-checkout) query.
    async fn confirm_pre_authorization(
        &self,
        bot: &BotId,
        query_id: &str,
        accept: bool,
        reason: Option<&str>,
    ) -> Result<()>;
}
