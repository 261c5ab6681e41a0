use async_trait::async_trait;

use crate::{
    domain::{BotId, ChatId, MessageRef},
    messaging::types::{InlineKeyboard, MessagingCapabilities},
    Result,
};

/// Outbound chat transport.
///
/// Every call names the bot it goes through, since one process can front
/// several Telegram bots.
#[async_trait]
pub trait MessagingPort: Send + Sync {
    fn capabilities(&self) -> MessagingCapabilities;

    async fn send_text(&self, bot: &BotId, chat_id: ChatId, text: &str) -> Result<MessageRef>;

    async fn send_text_with_keyboard(
        &self,
        bot: &BotId,
        chat_id: ChatId,
        text: &str,
        keyboard: InlineKeyboard,
    ) -> Result<MessageRef>;

    async fn delete_message(&self, bot: &BotId, msg: MessageRef) -> Result<()>;
}
