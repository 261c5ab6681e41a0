//! Hand-written fakes for the outbound ports, shared by unit and integration tests.

use std::sync::{
    atomic::{AtomicBool, Ordering},
    Mutex,
};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;

use crate::{
    alerting::AlertSink,
    domain::{BotId, ChatId, MessageId, MessageRef},
    errors::Error,
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    ports::{Invoice, InvoiceRequest, PaymentProvider},
    Result,
};

/// Same ceiling as the Bot API; longer sends are rejected.
const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SentText {
    pub bot: BotId,
    pub chat_id: ChatId,
    pub text: String,
    pub keyboard: Option<InlineKeyboard>,
}

#[derive(Default)]
pub struct FakeMessenger {
    next_id: Mutex<i32>,
    sends: Mutex<Vec<SentText>>,
    deletes: Mutex<Vec<MessageRef>>,
    fail_sends: AtomicBool,
}

impl FakeMessenger {
    /// Make every subsequent send fail with an external error.
    pub fn fail_sends(&self, fail: bool) {
        self.fail_sends.store(fail, Ordering::SeqCst);
    }

    fn alloc(&self, chat_id: ChatId) -> MessageRef {
        let mut guard = self.next_id.lock().unwrap();
        *guard += 1;
        MessageRef {
            chat_id,
            message_id: MessageId(*guard),
        }
    }

    pub fn sent(&self) -> Vec<SentText> {
        self.sends.lock().unwrap().clone()
    }

    pub fn texts_for(&self, chat_id: ChatId) -> Vec<String> {
        self.sends
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.chat_id == chat_id)
            .map(|s| s.text.clone())
            .collect()
    }

    pub fn deleted(&self) -> Vec<MessageRef> {
        self.deletes.lock().unwrap().clone()
    }

    fn record(
        &self,
        bot: &BotId,
        chat_id: ChatId,
        text: &str,
        keyboard: Option<InlineKeyboard>,
    ) -> Result<MessageRef> {
        if self.fail_sends.load(Ordering::SeqCst) {
            return Err(Error::External("telegram error: chat not found".to_string()));
        }
        if text.chars().count() > MAX_MESSAGE_LEN {
            return Err(Error::External(
                "telegram error: Bad Request: message is too long".to_string(),
            ));
        }
        self.sends.lock().unwrap().push(SentText {
            bot: bot.clone(),
            chat_id,
            text: text.to_string(),
            keyboard,
        });
        Ok(self.alloc(chat_id))
    }
}

#[async_trait]
impl MessagingPort for FakeMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        MessagingCapabilities {
            supports_delete: true,
            supports_inline_keyboards: true,
            max_message_len: MAX_MESSAGE_LEN,
        }
    }

    async fn send_text(&self, bot: &BotId, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.record(bot, chat_id, text, None)
    }

    async fn send_text_with_keyboard(
        &self,
        bot: &BotId,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.record(bot, chat_id, text, Some(keyboard))
    }

    async fn delete_message(&self, _bot: &BotId, msg: MessageRef) -> Result<()> {
        self.deletes.lock().unwrap().push(msg);
        Ok(())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Confirmation {
    pub bot: BotId,
    pub query_id: String,
    pub accept: bool,
    pub reason: Option<String>,
}

#[derive(Default)]
pub struct FakePaymentProvider {
    invoices: Mutex<Vec<InvoiceRequest>>,
    confirmations: Mutex<Vec<Confirmation>>,
    fail_invoices: AtomicBool,
    fail_confirmations: AtomicBool,
}

impl FakePaymentProvider {
    pub fn fail_invoices(&self, fail: bool) {
        self.fail_invoices.store(fail, Ordering::SeqCst);
    }

    /// Pre-checkout answers are still recorded, then reported as failed.
    pub fn fail_confirmations(&self, fail: bool) {
        self.fail_confirmations.store(fail, Ordering::SeqCst);
    }

    pub fn invoices(&self) -> Vec<InvoiceRequest> {
        self.invoices.lock().unwrap().clone()
    }

    pub fn confirmations(&self) -> Vec<Confirmation> {
        self.confirmations.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentProvider for FakePaymentProvider {
    async fn create_invoice(&self, req: InvoiceRequest) -> Result<Invoice> {
        if self.fail_invoices.load(Ordering::SeqCst) {
            return Err(Error::External("provider unavailable".to_string()));
        }
        let mut invoices = self.invoices.lock().unwrap();
        invoices.push(req);
        Ok(Invoice {
            invoice_id: format!("inv-{}", invoices.len()),
        })
    }

    async fn confirm_pre_authorization(
        &self,
        bot: &BotId,
        query_id: &str,
        accept: bool,
        reason: Option<&str>,
    ) -> Result<()> {
        self.confirmations.lock().unwrap().push(Confirmation {
            bot: bot.clone(),
            query_id: query_id.to_string(),
            accept,
            reason: reason.map(|s| s.to_string()),
        });
        if self.fail_confirmations.load(Ordering::SeqCst) {
            return Err(Error::External("query is too old".to_string()));
        }
        Ok(())
    }
}

/// Alert sink that remembers every message it was asked to deliver.
#[derive(Default)]
pub struct RecordingAlertSink {
    messages: Mutex<Vec<String>>,
    notify: Notify,
}

impl RecordingAlertSink {
    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap().clone()
    }

    /// Alerts are fired from detached tasks; wait until `count` have arrived.
    pub async fn wait_for(&self, count: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        loop {
            let notified = self.notify.notified();
            let current = self.messages();
            if current.len() >= count || tokio::time::Instant::now() >= deadline {
                return current;
            }
            let _ = tokio::time::timeout_at(deadline, notified).await;
        }
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn notify(&self, message: &str) -> Result<()> {
        self.messages.lock().unwrap().push(message.to_string());
        self.notify.notify_waiters();
        Ok(())
    }
}
