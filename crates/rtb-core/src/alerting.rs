//! Best-effort operator alerts.
//!
//! Callers never see alert failures: they are logged and dropped, with no
//! retry.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::{
    domain::{BotId, ChatId},
    errors::Error,
    messaging::port::MessagingPort,
    status::Status,
    Result,
};

#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn notify(&self, message: &str) -> Result<()>;
}

/// Deliver `message`, logging (not returning) any failure.
pub async fn notify_best_effort(sink: &dyn AlertSink, message: &str) {
    if let Err(e) = sink.notify(message).await {
        tracing::warn!(error = %e, "alert delivery failed");
    }
}

/// Human-readable alert for a terminal error status.
pub fn format_status_alert(status: &Status, history: &[Status]) -> String {
    let phase = status
        .metadata
        .phase()
        .map(|p| p.to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let mut out = format!(
        "⚠️ {} {} reached {} during {phase}",
        status.object_type, status.object_id, status.status
    );
    if let Some(err) = &status.error_message {
        let mut err = err.clone();
        if err.len() > 500 {
            let mut cut = 500;
            while !err.is_char_boundary(cut) {
                cut -= 1;
            }
            err.truncate(cut);
        }
        out.push_str(&format!("\nerror: {err}"));
    }
    if !history.is_empty() {
        let trail = history
            .iter()
            .map(|s| s.status.to_string())
            .collect::<Vec<_>>()
            .join(" → ");
        out.push_str(&format!("\ntrail: {trail}"));
    }
    out
}

/// Writes alerts to the log only. Used when no operator channel is configured.
pub struct LogAlertSink;

#[async_trait]
impl AlertSink for LogAlertSink {
    async fn notify(&self, message: &str) -> Result<()> {
        tracing::warn!(target: "rtb::alert", "{message}");
        Ok(())
    }
}

/// Sends alerts to an operator chat through one of the bots.
pub struct ChatAlertSink {
    messenger: Arc<dyn MessagingPort>,
    bot: BotId,
    chat_id: ChatId,
}

impl ChatAlertSink {
    pub fn new(messenger: Arc<dyn MessagingPort>, bot: BotId, chat_id: ChatId) -> Self {
        Self {
            messenger,
            bot,
            chat_id,
        }
    }
}

#[async_trait]
impl AlertSink for ChatAlertSink {
    async fn notify(&self, message: &str) -> Result<()> {
        self.messenger
            .send_text(&self.bot, self.chat_id, message)
            .await?;
        Ok(())
    }
}

/// Posts `{"text": message}` to an incoming-webhook URL (Slack-compatible).
#[derive(Clone, Debug)]
pub struct WebhookAlertSink {
    url: String,
    http: reqwest::Client,
}

impl WebhookAlertSink {
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::External(format!("alert webhook client: {e}")))?;
        Ok(Self {
            url: url.into(),
            http,
        })
    }
}

#[async_trait]
impl AlertSink for WebhookAlertSink {
    async fn notify(&self, message: &str) -> Result<()> {
        let resp = self
            .http
            .post(&self.url)
            .json(&serde_json::json!({ "text": message }))
            .send()
            .await
            .map_err(|e| Error::External(format!("alert webhook request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "alert webhook failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }
        Ok(())
    }
}

/// Delivers to every inner sink; succeeds if at least one did.
pub struct FanoutAlertSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutAlertSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        Self { sinks }
    }
}

#[async_trait]
impl AlertSink for FanoutAlertSink {
    async fn notify(&self, message: &str) -> Result<()> {
        let mut last_err = None;
        let mut delivered = false;
        for sink in &self.sinks {
            match sink.notify(message).await {
                Ok(()) => delivered = true,
                Err(e) => last_err = Some(e),
            }
        }
        match (delivered, last_err) {
            (false, Some(e)) => Err(e),
            _ => Ok(()),
        }
    }
}
