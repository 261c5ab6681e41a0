//! Request correlation pipeline.
//!
//! ```text
//! Received -> SentToBus -> ResponseReceived      -> ResponseDeliveredToUser
//!                       \-> ResponseErrorReceived -> ResponseErrorDelivered
//! (Failed from any point on an unrecoverable local error)
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use uuid::Uuid;

use crate::{
    bus::{BusHandler, BusProducer, BusRecord, RagReplyMessage, RagRequestMessage},
    domain::{BotId, ChatId, MessageRef, Request, User},
    errors::Error,
    guard::DeliveryGuard,
    messaging::{port::MessagingPort, types::split_message},
    ports::{RequestRepository, UserRepository},
    status::{NewStatus, ObjectType, Phase, StatusCode, StatusLog, StatusMetadata},
    Result,
};

#[derive(Clone, Debug)]
pub struct PipelineConfig {
    pub request_topic: String,
    /// Transient "thinking…" text; `None` disables the placeholder.
    pub placeholder_text: Option<String>,
    /// Sent instead of the answer when the processor reports an error.
    pub failure_text: String,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            request_topic: "rag.requests".to_string(),
            placeholder_text: Some("Thinking…".to_string()),
            failure_text: "Sorry, I could not prepare an answer. Please try again later."
                .to_string(),
        }
    }
}

/// What the processor gets to know about the asker.
#[derive(Serialize)]
struct RequestContext<'a> {
    bot_id: &'a str,
    user_id: Uuid,
    chat_id: i64,
    username: Option<&'a str>,
    is_paid: bool,
}

pub struct RequestPipeline {
    requests: Arc<dyn RequestRepository>,
    users: Arc<dyn UserRepository>,
    statuses: Arc<StatusLog>,
    producer: Arc<dyn BusProducer>,
    messenger: Arc<dyn MessagingPort>,
    guard: Arc<DeliveryGuard>,
    cfg: PipelineConfig,
}

impl RequestPipeline {
    pub fn new(
        requests: Arc<dyn RequestRepository>,
        users: Arc<dyn UserRepository>,
        statuses: Arc<StatusLog>,
        producer: Arc<dyn BusProducer>,
        messenger: Arc<dyn MessagingPort>,
        guard: Arc<DeliveryGuard>,
        cfg: PipelineConfig,
    ) -> Self {
        Self {
            requests,
            users,
            statuses,
            producer,
            messenger,
            guard,
            cfg,
        }
    }

    /// Persist a new request and hand it to the processor.
    ///
    /// If publishing fails the request row stays, the placeholder is removed,
    /// `Failed` is appended and the publish error is returned.
    pub async fn submit(
        &self,
        bot: &BotId,
        user: &User,
        text: &str,
        external_update_ref: Option<i64>,
    ) -> Result<Request> {
        let request = Request {
            id: Uuid::new_v4(),
            user_id: user.id,
            bot_id: bot.clone(),
            external_update_ref,
            text: text.to_string(),
            response_text: None,
            created_at: Utc::now(),
        };
        self.requests.insert(&request).await?;

        self.statuses
            .append(
                NewStatus::request(request.id, StatusCode::Received).with_metadata(
                    StatusMetadata::Submission {
                        chat_id: user.chat_id.0,
                        external_update_ref,
                    },
                ),
            )
            .await?;

        let context = RequestContext {
            bot_id: bot.as_str(),
            user_id: user.id,
            chat_id: user.chat_id.0,
            username: user.username.as_deref(),
            is_paid: user.is_paid,
        };
        let message = RagRequestMessage {
            request_id: request.id.to_string(),
            request_text: request.text.clone(),
            context_blob: serde_json::to_string(&context)?,
        };
        let payload = serde_json::to_string(&message)?;

        // The reply may arrive before `publish` returns, so the chat state and
        // placeholder must already be in place.
        self.guard.record_submission(bot, user.chat_id, request.id);
        if let Some(placeholder) = &self.cfg.placeholder_text {
            match self.messenger.send_text(bot, user.chat_id, placeholder).await {
                Ok(msg) => {
                    self.guard
                        .record_placeholder(bot, user.chat_id, request.id, msg.message_id)
                }
                Err(e) => tracing::warn!(request_id = %request.id, error = %e, "placeholder send failed"),
            }
        }

        let sent_at = Utc::now();
        if let Err(e) = self
            .producer
            .publish(&self.cfg.request_topic, &message.request_id, &payload)
            .await
        {
            tracing::error!(request_id = %request.id, error = %e, "bus publish failed");
            self.remove_placeholder(bot, user.chat_id, request.id).await;
            let failed = NewStatus::request(request.id, StatusCode::Failed)
                .with_error(e.to_string())
                .with_metadata(StatusMetadata::Failure {
                    phase: Phase::Submission,
                    chat_id: Some(user.chat_id.0),
                });
            if let Err(append_err) = self.statuses.append(failed).await {
                tracing::error!(request_id = %request.id, error = %append_err, "failed status not recorded");
            }
            return Err(e);
        }

        // Stamped before the publish so it sorts ahead of an early reply.
        self.statuses
            .append(
                NewStatus::request(request.id, StatusCode::SentToBus)
                    .with_metadata(StatusMetadata::Bus {
                        topic: self.cfg.request_topic.clone(),
                    })
                    .at(sent_at),
            )
            .await?;

        tracing::info!(request_id = %request.id, bot = %bot, chat_id = %user.chat_id, "request submitted");
        Ok(request)
    }

    /// Correlate a processor reply back to its chat and deliver it.
    pub async fn on_bus_reply(&self, reply: &RagReplyMessage) -> Result<()> {
        let request_id = Uuid::parse_str(reply.request_id.trim())
            .map_err(|e| Error::Bus(format!("invalid request_id {:?}: {e}", reply.request_id)))?;

        let Some(request) = self.requests.get(request_id).await? else {
            tracing::warn!(%request_id, "reply for unknown request");
            return Err(Error::NotFound(format!("request {request_id}")));
        };

        let Some(user) = self.users.get(request.user_id).await? else {
            tracing::error!(%request_id, user_id = %request.user_id, "reply for request without user");
            self.statuses
                .append(
                    NewStatus::request(request_id, StatusCode::Failed)
                        .with_error(format!("user {} not found", request.user_id))
                        .with_metadata(StatusMetadata::Failure {
                            phase: Phase::Reply,
                            chat_id: None,
                        }),
                )
                .await?;
            return Err(Error::NotFound(format!("user {}", request.user_id)));
        };

        match self.statuses.latest(ObjectType::Request, request_id).await {
            Ok(current) if current.status.is_delivered() => {
                tracing::info!(%request_id, status = %current.status, "duplicate reply ignored");
                return Err(Error::Business("reply already delivered".to_string()));
            }
            Ok(_) | Err(Error::NotFound(_)) => {}
            Err(e) => return Err(e),
        }

        let bot = &request.bot_id;
        let chat = user.chat_id;
        let stale = !self.guard.is_current(bot, chat, request_id);
        if stale {
            tracing::info!(%request_id, chat_id = %chat, "reply for superseded request; delivering anyway");
        }

        let processor_error = match &reply.error {
            Some(err) => Some(err.clone()),
            None if reply.response_text.trim().is_empty() => Some("empty response".to_string()),
            None => None,
        };
        if let Some(err) = processor_error {
            return self.deliver_error(request_id, bot, chat, stale, &err).await;
        }

        self.requests
            .set_response_text(request_id, &reply.response_text)
            .await?;
        self.statuses
            .append(
                NewStatus::request(request_id, StatusCode::ResponseReceived).with_metadata(
                    StatusMetadata::Reply {
                        chat_id: chat.0,
                        stale,
                    },
                ),
            )
            .await?;

        self.remove_placeholder(bot, chat, request_id).await;

        match self.send_chunked(bot, chat, &reply.response_text).await {
            Ok(msg) => {
                self.statuses
                    .append(
                        NewStatus::request(request_id, StatusCode::ResponseDeliveredToUser)
                            .with_metadata(StatusMetadata::Delivery {
                                chat_id: chat.0,
                                message_id: Some(msg.message_id.0),
                            }),
                    )
                    .await?;
                tracing::info!(%request_id, chat_id = %chat, "reply delivered");
            }
            Err(e) => {
                tracing::warn!(%request_id, chat_id = %chat, error = %e, "reply delivery failed");
                self.statuses
                    .append(
                        NewStatus::request(request_id, StatusCode::ResponseErrorDelivered)
                            .with_error(e.to_string())
                            .with_metadata(StatusMetadata::Delivery {
                                chat_id: chat.0,
                                message_id: None,
                            }),
                    )
                    .await?;
            }
        }
        Ok(())
    }

    /// Send `text` in as many messages as the transport's length limit needs.
    /// Returns the first message; stops at the first failed chunk.
    async fn send_chunked(&self, bot: &BotId, chat: ChatId, text: &str) -> Result<MessageRef> {
        let chunks = split_message(text, self.messenger.capabilities().max_message_len);
        let total = chunks.len();
        let mut first = None;
        for (i, chunk) in chunks.iter().enumerate() {
            match self.messenger.send_text(bot, chat, chunk).await {
                Ok(msg) => {
                    first.get_or_insert(msg);
                }
                Err(e) if total > 1 => {
                    return Err(Error::External(format!("part {}/{total}: {e}", i + 1)))
                }
                Err(e) => return Err(e),
            }
        }
        first.ok_or_else(|| Error::External("nothing to send".to_string()))
    }

    async fn deliver_error(
        &self,
        request_id: Uuid,
        bot: &BotId,
        chat: ChatId,
        stale: bool,
        processor_error: &str,
    ) -> Result<()> {
        tracing::warn!(%request_id, error = processor_error, "processor reported an error");
        self.statuses
            .append(
                NewStatus::request(request_id, StatusCode::ResponseErrorReceived)
                    .with_error(processor_error)
                    .with_metadata(StatusMetadata::Reply {
                        chat_id: chat.0,
                        stale,
                    }),
            )
            .await?;

        self.remove_placeholder(bot, chat, request_id).await;

        let sent = self
            .messenger
            .send_text(bot, chat, &self.cfg.failure_text)
            .await;
        let (message_id, error) = match sent {
            Ok(msg) => (Some(msg.message_id.0), processor_error.to_string()),
            Err(e) => {
                tracing::warn!(%request_id, chat_id = %chat, error = %e, "failure notice not delivered");
                (None, format!("{processor_error}; notice not delivered: {e}"))
            }
        };
        self.statuses
            .append(
                NewStatus::request(request_id, StatusCode::ResponseErrorDelivered)
                    .with_error(error)
                    .with_metadata(StatusMetadata::Delivery {
                        chat_id: chat.0,
                        message_id,
                    }),
            )
            .await?;
        Ok(())
    }

    async fn remove_placeholder(&self, bot: &BotId, chat: ChatId, request_id: Uuid) {
        let (message_id, should_delete) = self.guard.consume_placeholder(bot, chat, request_id);
        let (Some(message_id), true) = (message_id, should_delete) else {
            return;
        };
        let msg = MessageRef {
            chat_id: chat,
            message_id,
        };
        if let Err(e) = self.messenger.delete_message(bot, msg).await {
            tracing::debug!(%request_id, error = %e, "placeholder delete failed");
        }
    }
}

#[async_trait]
impl BusHandler for RequestPipeline {
    async fn handle(&self, record: &BusRecord) -> Result<()> {
        let reply: RagReplyMessage = serde_json::from_str(&record.payload)?;
        self.on_bus_reply(&reply).await
    }
}
