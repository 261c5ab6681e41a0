//! Per-conversation delivery guard.
//!
//! A best-effort cache, never a source of truth: it is empty after a restart
//! and everything must stay correct (if noisier) in that case.

use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use uuid::Uuid;

use crate::domain::{BotId, ChatId, MessageId};

#[derive(Debug, Default)]
struct ChatEntry {
    last_request: Option<Uuid>,
    placeholder: Option<Placeholder>,
}

#[derive(Debug)]
struct Placeholder {
    request_id: Uuid,
    message_id: MessageId,
    deleted: bool,
}

#[derive(Debug, Default)]
pub struct DeliveryGuard {
    chats: Mutex<HashMap<(BotId, ChatId), ChatEntry>>,
}

impl DeliveryGuard {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<(BotId, ChatId), ChatEntry>> {
        self.chats
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_entry<T>(&self, bot: &BotId, chat: ChatId, f: impl FnOnce(&mut ChatEntry) -> T) -> T {
        f(self.lock().entry((bot.clone(), chat)).or_default())
    }

    /// Remember `request_id` as the chat's most recent submission.
    pub fn record_submission(&self, bot: &BotId, chat: ChatId, request_id: Uuid) {
        self.with_entry(bot, chat, |e| e.last_request = Some(request_id));
    }

    /// Whether `request_id` is still the chat's most recent submission.
    ///
    /// Unknown chats (e.g. after a restart) count as current.
    pub fn is_current(&self, bot: &BotId, chat: ChatId, request_id: Uuid) -> bool {
        match self.lock().get(&(bot.clone(), chat)).and_then(|e| e.last_request) {
            Some(last) => last == request_id,
            None => true,
        }
    }

    /// Track the transient "thinking…" message sent for `request_id`.
    pub fn record_placeholder(
        &self,
        bot: &BotId,
        chat: ChatId,
        request_id: Uuid,
        message_id: MessageId,
    ) {
        self.with_entry(bot, chat, |e| {
            e.placeholder = Some(Placeholder {
                request_id,
                message_id,
                deleted: false,
            })
        });
    }

    /// Single-use token: returns the placeholder id and `true` exactly once
    /// for the request that owns it.
    ///
    /// Once the chat's latest request is settled and no placeholder is left
    /// to delete, the chat is forgotten.
    pub fn consume_placeholder(
        &self,
        bot: &BotId,
        chat: ChatId,
        request_id: Uuid,
    ) -> (Option<MessageId>, bool) {
        let mut chats = self.lock();
        let key = (bot.clone(), chat);
        let Some(entry) = chats.get_mut(&key) else {
            return (None, false);
        };

        let consumed = match entry.placeholder.as_mut() {
            Some(p) if p.request_id == request_id => {
                let should_delete = !p.deleted;
                p.deleted = true;
                (Some(p.message_id), should_delete)
            }
            _ => (None, false),
        };

        let settled = entry.last_request.map_or(true, |last| last == request_id);
        let pending_placeholder = entry.placeholder.as_ref().is_some_and(|p| !p.deleted);
        if settled && !pending_placeholder {
            chats.remove(&key);
        }
        consumed
    }

    #[cfg(test)]
    fn tracked_chats(&self) -> usize {
        self.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn newer_submission_supersedes_older() {
        let guard = DeliveryGuard::new();
        let bot = BotId::new("main");
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        guard.record_submission(&bot, ChatId(1), a);
        assert!(guard.is_current(&bot, ChatId(1), a));

        guard.record_submission(&bot, ChatId(1), b);
        assert!(!guard.is_current(&bot, ChatId(1), a));
        assert!(guard.is_current(&bot, ChatId(1), b));
    }

    #[test]
    fn unknown_chat_counts_as_current() {
        let guard = DeliveryGuard::new();
        assert!(guard.is_current(&BotId::new("main"), ChatId(9), Uuid::new_v4()));
    }

    #[test]
    fn chats_are_scoped_per_bot() {
        let guard = DeliveryGuard::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        guard.record_submission(&BotId::new("one"), ChatId(1), a);
        guard.record_submission(&BotId::new("two"), ChatId(1), b);
        assert!(guard.is_current(&BotId::new("one"), ChatId(1), a));
    }

    #[test]
    fn placeholder_is_consumed_once() {
        let guard = DeliveryGuard::new();
        let bot = BotId::new("main");
        let req = Uuid::new_v4();
        guard.record_placeholder(&bot, ChatId(1), req, MessageId(77));

        assert_eq!(
            guard.consume_placeholder(&bot, ChatId(1), req),
            (Some(MessageId(77)), true)
        );
        assert_eq!(guard.consume_placeholder(&bot, ChatId(1), req), (None, false));
    }

    #[test]
    fn placeholder_of_other_request_is_left_alone() {
        let guard = DeliveryGuard::new();
        let bot = BotId::new("main");
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());
        guard.record_placeholder(&bot, ChatId(1), new, MessageId(5));

        assert_eq!(guard.consume_placeholder(&bot, ChatId(1), old), (None, false));
        assert_eq!(
            guard.consume_placeholder(&bot, ChatId(1), new),
            (Some(MessageId(5)), true)
        );
    }

    #[test]
    fn answered_chats_are_forgotten() {
        let guard = DeliveryGuard::new();
        let bot = BotId::new("main");

        for chat in 0..100 {
            let req = Uuid::new_v4();
            guard.record_submission(&bot, ChatId(chat), req);
            guard.record_placeholder(&bot, ChatId(chat), req, MessageId(1));
            guard.consume_placeholder(&bot, ChatId(chat), req);
        }
        assert_eq!(guard.tracked_chats(), 0);

        // Without a placeholder the answer still settles the chat.
        let req = Uuid::new_v4();
        guard.record_submission(&bot, ChatId(7), req);
        guard.consume_placeholder(&bot, ChatId(7), req);
        assert_eq!(guard.tracked_chats(), 0);

        // Lookups never create entries.
        assert!(guard.is_current(&bot, ChatId(8), Uuid::new_v4()));
        assert_eq!(guard.tracked_chats(), 0);
    }

    #[test]
    fn superseded_answer_keeps_the_newer_request_tracked() {
        let guard = DeliveryGuard::new();
        let bot = BotId::new("main");
        let (old, new) = (Uuid::new_v4(), Uuid::new_v4());

        guard.record_submission(&bot, ChatId(1), old);
        guard.record_submission(&bot, ChatId(1), new);
        guard.record_placeholder(&bot, ChatId(1), new, MessageId(9));

        assert_eq!(guard.consume_placeholder(&bot, ChatId(1), old), (None, false));
        assert_eq!(guard.tracked_chats(), 1);
        assert!(!guard.is_current(&bot, ChatId(1), old));

        assert_eq!(
            guard.consume_placeholder(&bot, ChatId(1), new),
            (Some(MessageId(9)), true)
        );
        assert_eq!(guard.tracked_chats(), 0);
    }
}
