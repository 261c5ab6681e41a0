//! Status event log: the append-only lifecycle trail of tracked objects.
//!
//! There is no mutable "state" column anywhere. The current state of an
//! object is the status row with the greatest `created_at`; the per-object
//! `seq` assigned at insert breaks ties between equal timestamps.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    alerting::{self, AlertSink},
    errors::Error,
    ports::StatusRepository,
    Result,
};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ObjectType {
    Request,
    Payment,
}

impl ObjectType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Request => "request",
            ObjectType::Payment => "payment",
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        match s {
            "request" => Ok(ObjectType::Request),
            "payment" => Ok(ObjectType::Payment),
            other => Err(Error::Storage(format!("unknown object type: {other}"))),
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle codes. The progression is conventional, not enforced: any code
/// may be appended at any time.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Received,
    SentToBus,
    ResponseReceived,
    ResponseDeliveredToUser,
    ResponseErrorReceived,
    ResponseErrorDelivered,
    Failed,
}

impl StatusCode {
    pub fn code(&self) -> i16 {
        match self {
            StatusCode::Received => 1,
            StatusCode::SentToBus => 2,
            StatusCode::ResponseReceived => 3,
            StatusCode::ResponseDeliveredToUser => 4,
            StatusCode::ResponseErrorReceived => 5,
            StatusCode::ResponseErrorDelivered => 6,
            StatusCode::Failed => 99,
        }
    }

    pub fn from_code(code: i16) -> Result<Self> {
        match code {
            1 => Ok(StatusCode::Received),
            2 => Ok(StatusCode::SentToBus),
            3 => Ok(StatusCode::ResponseReceived),
            4 => Ok(StatusCode::ResponseDeliveredToUser),
            5 => Ok(StatusCode::ResponseErrorReceived),
            6 => Ok(StatusCode::ResponseErrorDelivered),
            99 => Ok(StatusCode::Failed),
            other => Err(Error::Storage(format!("unknown status code: {other}"))),
        }
    }

    /// Terminal error states; appending one raises an alert.
    pub fn is_terminal_error(&self) -> bool {
        matches!(self, StatusCode::ResponseErrorDelivered | StatusCode::Failed)
    }

    /// The reply for this object has already been handed to the user.
    pub fn is_delivered(&self) -> bool {
        matches!(
            self,
            StatusCode::ResponseDeliveredToUser | StatusCode::ResponseErrorDelivered
        )
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Received => "received",
            StatusCode::SentToBus => "sent_to_bus",
            StatusCode::ResponseReceived => "response_received",
            StatusCode::ResponseDeliveredToUser => "response_delivered",
            StatusCode::ResponseErrorReceived => "response_error_received",
            StatusCode::ResponseErrorDelivered => "response_error_delivered",
            StatusCode::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Where in the lifecycle something happened.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Submission,
    Reply,
    Delivery,
    Payment,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Submission => "submission",
            Phase::Reply => "reply",
            Phase::Delivery => "delivery",
            Phase::Payment => "payment",
        };
        f.write_str(name)
    }
}

/// Typed status metadata, persisted as a JSON blob. Unknown future variants
/// stay readable as raw JSON in the store.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StatusMetadata {
    #[default]
    None,
    Submission {
        chat_id: i64,
        external_update_ref: Option<i64>,
    },
    Bus {
        topic: String,
    },
    Reply {
        chat_id: i64,
        stale: bool,
    },
    Delivery {
        chat_id: i64,
        message_id: Option<i32>,
    },
    Failure {
        phase: Phase,
        chat_id: Option<i64>,
    },
}

impl StatusMetadata {
    pub fn phase(&self) -> Option<Phase> {
        match self {
            StatusMetadata::None => None,
            StatusMetadata::Submission { .. } | StatusMetadata::Bus { .. } => {
                Some(Phase::Submission)
            }
            StatusMetadata::Reply { .. } => Some(Phase::Reply),
            StatusMetadata::Delivery { .. } => Some(Phase::Delivery),
            StatusMetadata::Failure { phase, .. } => Some(*phase),
        }
    }
}

/// A status row as stored.
#[derive(Clone, Debug, PartialEq)]
pub struct Status {
    pub id: Uuid,
    pub object_type: ObjectType,
    pub object_id: Uuid,
    pub status: StatusCode,
    pub seq: i64,
    pub error_message: Option<String>,
    pub metadata: StatusMetadata,
    pub created_at: DateTime<Utc>,
}

/// A status about to be appended.
#[derive(Clone, Debug, PartialEq)]
pub struct NewStatus {
    pub object_type: ObjectType,
    pub object_id: Uuid,
    pub status: StatusCode,
    pub error_message: Option<String>,
    pub metadata: StatusMetadata,
    pub created_at: DateTime<Utc>,
}

impl NewStatus {
    pub fn new(object_type: ObjectType, object_id: Uuid, status: StatusCode) -> Self {
        Self {
            object_type,
            object_id,
            status,
            error_message: None,
            metadata: StatusMetadata::None,
            created_at: Utc::now(),
        }
    }

    pub fn request(object_id: Uuid, status: StatusCode) -> Self {
        Self::new(ObjectType::Request, object_id, status)
    }

    pub fn payment(object_id: Uuid, status: StatusCode) -> Self {
        Self::new(ObjectType::Payment, object_id, status)
    }

    pub fn with_metadata(mut self, metadata: StatusMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error_message = Some(error.into());
        self
    }

    pub fn at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = created_at;
        self
    }
}

/// Service wrapper around the status repository.
///
/// Appends are never silent: a storage failure is returned to the caller.
/// Terminal error statuses raise an alert from a detached task.
pub struct StatusLog {
    repo: Arc<dyn StatusRepository>,
    alerts: Arc<dyn AlertSink>,
}

impl StatusLog {
    pub fn new(repo: Arc<dyn StatusRepository>, alerts: Arc<dyn AlertSink>) -> Self {
        Self { repo, alerts }
    }

    pub async fn append(&self, status: NewStatus) -> Result<Status> {
        let stored = self.repo.insert(status).await?;
        tracing::debug!(
            object_type = %stored.object_type,
            object_id = %stored.object_id,
            status = %stored.status,
            seq = stored.seq,
            "status appended"
        );

        if stored.status.is_terminal_error() {
            let repo = self.repo.clone();
            let alerts = self.alerts.clone();
            let status = stored.clone();
            tokio::spawn(async move {
                let history = repo
                    .list_by_object(status.object_type, status.object_id)
                    .await
                    .unwrap_or_default();
                let message = alerting::format_status_alert(&status, &history);
                alerting::notify_best_effort(alerts.as_ref(), &message).await;
            });
        }

        Ok(stored)
    }

    pub async fn latest(&self, object_type: ObjectType, object_id: Uuid) -> Result<Status> {
        self.repo
            .latest(object_type, object_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("no status for {object_type} {object_id}")))
    }

    /// Diagnostics only; never drive control flow from the full history.
    pub async fn all_by_object_id(
        &self,
        object_type: ObjectType,
        object_id: Uuid,
    ) -> Result<Vec<Status>> {
        self.repo.list_by_object(object_type, object_id).await
    }
}
