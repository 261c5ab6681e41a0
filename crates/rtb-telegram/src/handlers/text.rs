use teloxide::prelude::*;

use rtb_core::domain::{BotId, ChatId};

use crate::router::AppState;

use super::{incoming_user, HandlerResult, SOMETHING_WENT_WRONG};

/// A plain text message is a question for the processor.
pub async fn handle_text(msg: &Message, state: &AppState, bot_id: &BotId) -> HandlerResult {
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    if text.trim().is_empty() {
        return Ok(());
    }

    let chat = ChatId(msg.chat.id.0);
    let user = state.users.upsert(&incoming_user(bot_id, from, chat)).await?;

    if let Err(e) = state
        .pipeline
        .submit(bot_id, &user, text.trim(), Some(i64::from(msg.id.0)))
        .await
    {
        let _ = state
            .messenger
            .send_text(bot_id, chat, SOMETHING_WENT_WRONG)
            .await;
        return Err(e.into());
    }
    Ok(())
}
