use teloxide::prelude::*;

use rtb_core::domain::{BotId, ChatId};

use crate::router::AppState;

use super::{commands::BUY_PREMIUM, payments::start_purchase, HandlerResult};

pub async fn handle_callback(
    bot: &Bot,
    q: CallbackQuery,
    state: &AppState,
    bot_id: &BotId,
) -> HandlerResult {
    let chat_id = q.message.as_ref().map(|m| ChatId(m.chat.id.0));
    let data = q.data.clone().unwrap_or_default();

    // Always answer the query so the client stops spinning.
    let _ = bot.answer_callback_query(q.id.clone()).await;

    let Some(chat_id) = chat_id else {
        return Ok(());
    };

    match data.as_str() {
        BUY_PREMIUM => start_purchase(state, bot_id, &q.from, chat_id).await,
        other => {
            tracing::debug!(bot = %bot_id, data = other, "unknown callback");
            Ok(())
        }
    }
}
