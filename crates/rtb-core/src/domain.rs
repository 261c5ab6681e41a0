use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{errors::Error, Result};

/// Logical bot identifier (one process may serve several Telegram bots).
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BotId(pub String);

impl BotId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for BotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Telegram user id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TelegramUserId(pub i64);

/// Telegram chat id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChatId(pub i64);

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Telegram message id (numeric).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub i32);

/// A stable reference to a sent message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MessageRef {
    pub chat_id: ChatId,
    pub message_id: MessageId,
}

/// One user question awaiting an asynchronous answer.
///
/// Immutable after creation except `response_text`, which caches the reply.
#[derive(Clone, Debug, PartialEq)]
pub struct Request {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: BotId,
    pub external_update_ref: Option<i64>,
    pub text: String,
    pub response_text: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct User {
    pub id: Uuid,
    pub bot_id: BotId,
    pub telegram_user_id: TelegramUserId,
    pub chat_id: ChatId,
    pub username: Option<String>,
    pub is_paid: bool,
    pub paid_until: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

/// Identity of the sender of an inbound update, as reported by the transport.
#[derive(Clone, Debug)]
pub struct IncomingUser {
    pub bot_id: BotId,
    pub telegram_user_id: TelegramUserId,
    pub chat_id: ChatId,
    pub username: Option<String>,
}

/// Something that can be bought.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Product {
    pub id: String,
    pub title: String,
    pub description: String,
    /// Price in minor units of `currency` (whole stars for `XTR`).
    pub amount: i64,
    pub currency: String,
    pub duration_days: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentStatus {
    Pending,
    Succeeded,
    Failed,
    /// Modeled for out-of-band refunds; no transition reaches it yet.
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Succeeded => "succeeded",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Refunded => "refunded",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(PaymentStatus::Pending),
            "succeeded" => Ok(PaymentStatus::Succeeded),
            "failed" => Ok(PaymentStatus::Failed),
            "refunded" => Ok(PaymentStatus::Refunded),
            other => Err(Error::Storage(format!("unknown payment status: {other}"))),
        }
    }
}

impl fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PaymentMethod {
    /// Telegram Stars (`XTR`).
    ProviderStars,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::ProviderStars => "provider_stars",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "provider_stars" => Ok(PaymentMethod::ProviderStars),
            other => Err(Error::Storage(format!("unknown payment method: {other}"))),
        }
    }
}

/// Typed payment metadata, persisted as a JSON blob.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PaymentMetadata {
    #[default]
    None,
    Invoice {
        chat_id: i64,
        description: String,
        duration_days: u32,
    },
}

impl PaymentMetadata {
    pub fn duration_days(&self) -> Option<u32> {
        match self {
            PaymentMetadata::Invoice { duration_days, .. } => Some(*duration_days),
            PaymentMetadata::None => None,
        }
    }
}

/// One purchase attempt. `id` doubles as the opaque provider payload.
#[derive(Clone, Debug, PartialEq)]
pub struct Payment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub bot_id: BotId,
    pub amount: i64,
    pub currency: String,
    pub method: PaymentMethod,
    pub provider_transaction_id: String,
    pub status: PaymentStatus,
    pub product_id: String,
    pub product_title: String,
    pub metadata: PaymentMetadata,
    pub created_at: DateTime<Utc>,
    pub succeeded_at: Option<DateTime<Utc>>,
    pub failed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}
