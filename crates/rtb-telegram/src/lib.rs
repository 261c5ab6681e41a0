//! Telegram adapter (teloxide).
//!
//! Implements the `rtb-core` messaging port and payment provider over the
//! Telegram Bot API, and runs one update dispatcher per configured bot.

use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;

use teloxide::{
    prelude::*,
    types::{InlineKeyboardButton, InlineKeyboardMarkup, LabeledPrice},
};

use tokio::time::sleep;

pub mod handlers;
pub mod router;

use rtb_core::{
    config::BotConfig,
    domain::{BotId, ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    ports::{Invoice, InvoiceRequest, PaymentProvider},
    Result,
};

/// Telegram Stars invoices carry no provider token.
const STARS_PROVIDER_TOKEN: &str = "";

/// Every configured bot, by logical id.
#[derive(Clone, Default)]
pub struct Bots {
    inner: Arc<HashMap<BotId, Bot>>,
}

impl Bots {
    pub fn new(configs: &[BotConfig]) -> Self {
        let inner = configs
            .iter()
            .map(|c| (c.id.clone(), Bot::new(c.token.clone())))
            .collect();
        Self {
            inner: Arc::new(inner),
        }
    }

    pub fn get(&self, id: &BotId) -> Result<&Bot> {
        self.inner
            .get(id)
            .ok_or_else(|| Error::Config(format!("unknown bot: {id}")))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&BotId, &Bot)> {
        self.inner.iter()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

fn tg_chat(chat_id: ChatId) -> teloxide::types::ChatId {
    teloxide::types::ChatId(chat_id.0)
}

fn tg_msg_id(message_id: MessageId) -> teloxide::types::MessageId {
    teloxide::types::MessageId(message_id.0)
}

fn map_err(e: teloxide::RequestError) -> Error {
    Error::External(format!("telegram error: {e}"))
}

/// Run a Bot API call, retrying once after a 429 `RetryAfter`.
async fn with_retry<T, Fut>(mut op: impl FnMut() -> Fut) -> Result<T>
where
    Fut: std::future::IntoFuture<Output = std::result::Result<T, teloxide::RequestError>>,
    Fut::IntoFuture: Send,
{
    const MAX_RETRIES: usize = 1;
    let mut attempts = 0usize;
    loop {
        match op().await {
            Ok(v) => return Ok(v),
            Err(e) => match e {
                teloxide::RequestError::RetryAfter(d) if attempts < MAX_RETRIES => {
                    attempts += 1;
                    tracing::debug!(?d, "telegram rate limit; retrying");
                    sleep(d).await;
                    continue;
                }
                other => return Err(map_err(other)),
            },
        }
    }
}

fn keyboard_markup(keyboard: InlineKeyboard) -> InlineKeyboardMarkup {
    let rows: Vec<Vec<InlineKeyboardButton>> = keyboard
        .buttons
        .into_iter()
        .map(|b| vec![InlineKeyboardButton::callback(b.label, b.callback_data)])
        .collect();
    InlineKeyboardMarkup::new(rows)
}

#[derive(Clone)]
pub struct TelegramMessenger {
    bots: Bots,
}

impl TelegramMessenger {
    pub fn new(bots: Bots) -> Self {
        Self { bots }
    }
}

#[async_trait]
impl MessagingPort for TelegramMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_delete: true,
            supports_inline_keyboards: true,
            max_message_len: 4096,
        }
    }

    async fn send_text(&self, bot: &BotId, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        let client = self.bots.get(bot)?;
        let msg = with_retry(|| client.send_message(tg_chat(chat_id), text.to_string())).await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn send_text_with_keyboard(
        &self,
        bot: &BotId,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        let client = self.bots.get(bot)?;
        let markup = keyboard_markup(keyboard);

        let msg = with_retry(|| {
            client
                .send_message(tg_chat(chat_id), text.to_string())
                .reply_markup(markup.clone())
        })
        .await?;

        Ok(MessageRef {
            chat_id,
            message_id: MessageId(msg.id.0),
        })
    }

    async fn delete_message(&self, bot: &BotId, msg: MessageRef) -> Result<()> {
        let client = self.bots.get(bot)?;
        with_retry(|| client.delete_message(tg_chat(msg.chat_id), tg_msg_id(msg.message_id)))
            .await?;
        Ok(())
    }
}

/// Telegram Stars payments: invoices and pre-checkout answers.
#[derive(Clone)]
pub struct TelegramPayments {
    bots: Bots,
}

impl TelegramPayments {
    pub fn new(bots: Bots) -> Self {
        Self { bots }
    }
}

#[async_trait]
impl PaymentProvider for TelegramPayments {
    async fn create_invoice(&self, req: InvoiceRequest) -> Result<Invoice> {
        let client = self.bots.get(&req.bot)?;
        let price = LabeledPrice {
            label: req.title.clone(),
            amount: req
                .amount
                .try_into()
                .map_err(|_| Error::Business(format!("amount out of range: {}", req.amount)))?,
        };

        let msg = with_retry(|| {
            client.send_invoice(
                tg_chat(req.chat_id),
                req.title.clone(),
                req.description.clone(),
                req.payload.clone(),
                STARS_PROVIDER_TOKEN,
                req.currency.clone(),
                vec![price.clone()],
            )
        })
        .await?;

        Ok(Invoice {
            invoice_id: msg.id.0.to_string(),
        })
    }

    async fn confirm_pre_authorization(
        &self,
        bot: &BotId,
        query_id: &str,
        accept: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        let client = self.bots.get(bot)?;
        with_retry(|| {
            let mut req = client.answer_pre_checkout_query(query_id.to_string(), accept);
            if let (false, Some(reason)) = (accept, reason) {
                req = req.error_message(reason.to_string());
            }
            req
        })
        .await?;
        Ok(())
    }
}
