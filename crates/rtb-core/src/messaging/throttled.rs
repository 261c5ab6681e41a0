use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::{
    domain::{BotId, ChatId, MessageRef},
    messaging::{
        port::MessagingPort,
        types::{InlineKeyboard, MessagingCapabilities},
    },
    Result,
};

#[derive(Clone, Copy, Debug)]
pub struct ThrottleConfig {
    /// Minimum spacing between *any* outbound calls (global flood control).
    pub global_min_interval: Duration,
    /// Minimum spacing between calls to the same chat of the same bot.
    pub per_chat_min_interval: Duration,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            global_min_interval: Duration::from_millis(40), // ~25/sec
            per_chat_min_interval: Duration::from_millis(1050), // ~0.95/sec
        }
    }
}

#[derive(Debug)]
struct IntervalLimiter {
    interval: Duration,
    next: Instant,
}

impl IntervalLimiter {
    fn new(interval: Duration) -> Self {
        Self {
            interval,
            next: Instant::now(),
        }
    }

    /// Reserve the next slot and return the wait duration required before executing.
    fn reserve_at(&mut self, now: Instant) -> Duration {
        let start = if now >= self.next { now } else { self.next };
        self.next = start + self.interval;
        start.saturating_duration_since(now)
    }

    fn reserve(&mut self) -> Duration {
        self.reserve_at(Instant::now())
    }
}

/// MessagingPort decorator that rate-limits outbound calls.
///
/// Scheduled pushes fan out to every user of a bot; this keeps them under
/// Telegram's flood limits. It does not guarantee zero 429s.
pub struct ThrottledMessenger {
    inner: Arc<dyn MessagingPort>,
    cfg: ThrottleConfig,
    global: Mutex<IntervalLimiter>,
    per_chat: Mutex<HashMap<(BotId, i64), Arc<Mutex<IntervalLimiter>>>>,
}

impl ThrottledMessenger {
    pub fn new(inner: Arc<dyn MessagingPort>, cfg: ThrottleConfig) -> Self {
        Self {
            inner,
            cfg,
            global: Mutex::new(IntervalLimiter::new(cfg.global_min_interval)),
            per_chat: Mutex::new(HashMap::new()),
        }
    }

    async fn limiter_for_chat(&self, bot: &BotId, chat_id: i64) -> Arc<Mutex<IntervalLimiter>> {
        let mut map = self.per_chat.lock().await;
        map.entry((bot.clone(), chat_id))
            .or_insert_with(|| {
                Arc::new(Mutex::new(IntervalLimiter::new(
                    self.cfg.per_chat_min_interval,
                )))
            })
            .clone()
    }

    async fn throttle_chat(&self, bot: &BotId, chat_id: i64) {
        let global_wait = { self.global.lock().await.reserve() };
        let chat_wait = {
            let lim = self.limiter_for_chat(bot, chat_id).await;
            let mut guard = lim.lock().await;
            guard.reserve()
        };

        let wait = global_wait.max(chat_wait);
        if !wait.is_zero() {
            sleep(wait).await;
        }
    }
}

#[async_trait::async_trait]
impl MessagingPort for ThrottledMessenger {
    fn capabilities(&self) -> MessagingCapabilities {
        self.inner.capabilities()
    }

    async fn send_text(&self, bot: &BotId, chat_id: ChatId, text: &str) -> Result<MessageRef> {
        self.throttle_chat(bot, chat_id.0).await;
        self.inner.send_text(bot, chat_id, text).await
    }

    async fn send_text_with_keyboard(
        &self,
        bot: &BotId,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef> {
        self.throttle_chat(bot, chat_id.0).await;
        self.inner
            .send_text_with_keyboard(bot, chat_id, text, keyboard)
            .await
    }

    async fn delete_message(&self, bot: &BotId, msg: MessageRef) -> Result<()> {
        self.throttle_chat(bot, msg.chat_id.0).await;
        self.inner.delete_message(bot, msg).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeMessenger;

    #[test]
    fn limiter_spaces_consecutive_reservations() {
        let now = Instant::now();
        let mut lim = IntervalLimiter {
            interval: Duration::from_millis(100),
            next: now,
        };
        assert_eq!(lim.reserve_at(now), Duration::ZERO);
        assert_eq!(lim.reserve_at(now), Duration::from_millis(100));
        assert_eq!(lim.reserve_at(now), Duration::from_millis(200));
        // Idle time resets the window.
        let later = now + Duration::from_secs(5);
        assert_eq!(lim.reserve_at(later), Duration::ZERO);
    }

    #[tokio::test]
    async fn delegates_to_inner_transport() {
        let inner = Arc::new(FakeMessenger::default());
        let throttled = ThrottledMessenger::new(
            inner.clone(),
            ThrottleConfig {
                global_min_interval: Duration::ZERO,
                per_chat_min_interval: Duration::ZERO,
            },
        );
        let bot = BotId::new("main");
        let msg = throttled.send_text(&bot, ChatId(7), "hi").await.unwrap();
        throttled.delete_message(&bot, msg).await.unwrap();

        assert_eq!(inner.texts_for(ChatId(7)), vec!["hi".to_string()]);
        assert_eq!(inner.deleted(), vec![msg]);
    }
}
