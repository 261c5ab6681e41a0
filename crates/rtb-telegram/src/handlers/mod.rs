//! Telegram update handlers.
//!
//! Each handler is a thin adapter: it maps the update onto `rtb-core` types
//! and calls the pipeline or the payment service. Errors are logged here and
//! never returned to the dispatcher.

use std::sync::Arc;

use teloxide::{
    prelude::*,
    types::{CallbackQuery, Message, PreCheckoutQuery},
};

use rtb_core::domain::{BotId, ChatId, IncomingUser, TelegramUserId};

use crate::router::AppState;
mod callback;
mod commands;
mod payments;
mod text;

pub type HandlerResult = anyhow::Result<()>;

/// Generic reply when something on our side failed.
pub(crate) const SOMETHING_WENT_WRONG: &str = "Sorry, something went wrong. Please try again later.";

pub(crate) fn incoming_user(bot: &BotId, user: &teloxide::types::User, chat: ChatId) -> IncomingUser {
    IncomingUser {
        bot_id: bot.clone(),
        telegram_user_id: TelegramUserId(user.id.0 as i64),
        chat_id: chat,
        username: user.username.clone(),
    }
}

fn log_outcome(kind: &str, bot: &BotId, result: HandlerResult) -> ResponseResult<()> {
    if let Err(e) = result {
        tracing::error!(bot = %bot, update = kind, error = %format!("{e:#}"), "handler failed");
    }
    Ok(())
}

pub async fn handle_callback(
    bot: Bot,
    q: CallbackQuery,
    state: Arc<AppState>,
    bot_id: BotId,
) -> ResponseResult<()> {
    let result = callback::handle_callback(&bot, q, &state, &bot_id).await;
    log_outcome("callback", &bot_id, result)
}

pub async fn handle_pre_checkout(
    q: PreCheckoutQuery,
    state: Arc<AppState>,
    bot_id: BotId,
) -> ResponseResult<()> {
    let result = payments::handle_pre_checkout(q, &state, &bot_id).await;
    log_outcome("pre_checkout", &bot_id, result)
}

pub async fn handle_message(
    msg: Message,
    state: Arc<AppState>,
    bot_id: BotId,
) -> ResponseResult<()> {
    let result = route_message(msg, &state, &bot_id).await;
    log_outcome("message", &bot_id, result)
}

async fn route_message(msg: Message, state: &AppState, bot_id: &BotId) -> HandlerResult {
    if msg.successful_payment().is_some() {
        return payments::handle_successful_payment(&msg, state, bot_id).await;
    }

    let Some(text) = msg.text() else {
        let _ = state
            .messenger
            .send_text(bot_id, ChatId(msg.chat.id.0), "I can only answer text messages.")
            .await;
        return Ok(());
    };

    if text.starts_with('/') {
        return commands::handle_command(&msg, state, bot_id).await;
    }

    // Sequentialize questions per chat.
    let _guard = state.chat_locks.lock_chat(bot_id, ChatId(msg.chat.id.0)).await;
    text::handle_text(&msg, state, bot_id).await
}
