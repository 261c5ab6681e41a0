//! Lifecycle jobs run by the scheduler.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use crate::{
    domain::User,
    messaging::port::MessagingPort,
    ports::UserRepository,
    scheduler::{Job, Schedule},
    Result,
};

/// Send `text` to each user, stopping early on cancellation. Returns how many
/// sends succeeded.
async fn notify_users(
    messenger: &dyn MessagingPort,
    users: &[User],
    text: &str,
    cancel: &CancellationToken,
    job: &str,
) -> usize {
    let mut delivered = 0;
    for user in users {
        if cancel.is_cancelled() {
            tracing::info!(job, delivered, "stopping early: shutdown requested");
            break;
        }
        match messenger.send_text(&user.bot_id, user.chat_id, text).await {
            Ok(_) => delivered += 1,
            Err(e) => tracing::warn!(
                job,
                user_id = %user.id,
                chat_id = %user.chat_id,
                error = %e,
                "notification not delivered"
            ),
        }
    }
    delivered
}

/// Revokes premium from users whose paid period is over and tells them.
pub struct SubscriptionExpiryJob {
    users: Arc<dyn UserRepository>,
    messenger: Arc<dyn MessagingPort>,
    schedule: Schedule,
    text: String,
}

impl SubscriptionExpiryJob {
    pub fn new(
        users: Arc<dyn UserRepository>,
        messenger: Arc<dyn MessagingPort>,
        schedule: Schedule,
        text: impl Into<String>,
    ) -> Self {
        Self {
            users,
            messenger,
            schedule,
            text: text.into(),
        }
    }
}

#[async_trait]
impl Job for SubscriptionExpiryJob {
    fn name(&self) -> &str {
        "subscription_expiry"
    }

    fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(now)
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let expired = self.users.revoke_expired(Utc::now()).await?;
        let notified =
            notify_users(self.messenger.as_ref(), &expired, &self.text, cancel, self.name()).await;
        tracing::info!(revoked = expired.len(), notified, "subscriptions expired");
        Ok(())
    }
}

/// Broadcasts a fixed message to every user (or only non-paying ones).
pub struct ScheduledPushJob {
    users: Arc<dyn UserRepository>,
    messenger: Arc<dyn MessagingPort>,
    schedule: Schedule,
    text: String,
    only_unpaid: bool,
}

impl ScheduledPushJob {
    pub fn new(
        users: Arc<dyn UserRepository>,
        messenger: Arc<dyn MessagingPort>,
        schedule: Schedule,
        text: impl Into<String>,
        only_unpaid: bool,
    ) -> Self {
        Self {
            users,
            messenger,
            schedule,
            text: text.into(),
            only_unpaid,
        }
    }
}

#[async_trait]
impl Job for ScheduledPushJob {
    fn name(&self) -> &str {
        "scheduled_push"
    }

    fn next_run(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        self.schedule.next_after(now)
    }

    async fn run(&self, cancel: &CancellationToken) -> Result<()> {
        let recipients = self.users.list(self.only_unpaid).await?;
        let delivered =
            notify_users(self.messenger.as_ref(), &recipients, &self.text, cancel, self.name())
                .await;
        tracing::info!(
            recipients = recipients.len(),
            delivered,
            only_unpaid = self.only_unpaid,
            "scheduled push sent"
        );
        Ok(())
    }
}
