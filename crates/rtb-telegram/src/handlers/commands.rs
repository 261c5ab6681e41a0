use rtb_core::{
    domain::{BotId, ChatId, Product},
    messaging::types::InlineKeyboard,
};
use teloxide::prelude::*;

use crate::router::AppState;

use super::{incoming_user, payments::start_purchase, HandlerResult};

pub(crate) const BUY_PREMIUM: &str = "buy:premium";

const HELP_TEXT: &str = "Ask me anything: just send your question as a message.\n\n\
/start - welcome message\n\
/buy - get premium\n\
/status - your plan\n\
/help - this help";

fn parse_command(text: &str) -> (String, String) {
    // Telegram may send `/cmd@botname arg1 ...`
    let mut parts = text.trim().splitn(2, char::is_whitespace);
    let first = parts.next().unwrap_or("").trim();
    let rest = parts.next().unwrap_or("").trim().to_string();

    let cmd = first
        .trim_start_matches('/')
        .split('@')
        .next()
        .unwrap_or("")
        .to_lowercase();

    (cmd, rest)
}

fn buy_label(product: &Product) -> String {
    format!(
        "{} ({} {})",
        product.title, product.amount, product.currency
    )
}

pub(crate) fn start_keyboard(product: &Product) -> InlineKeyboard {
    InlineKeyboard::one_per_row(&[(buy_label(product), BUY_PREMIUM.to_string())], 48)
}

pub async fn handle_command(msg: &Message, state: &AppState, bot_id: &BotId) -> HandlerResult {
    let chat = ChatId(msg.chat.id.0);
    let (cmd, _args) = parse_command(msg.text().unwrap_or(""));

    match cmd.as_str() {
        "start" => {
            if let Some(from) = msg.from() {
                state.users.upsert(&incoming_user(bot_id, from, chat)).await?;
            }
            let text = format!(
                "Hi! Send me a question and I will look up an answer.\n\n{}",
                state.premium.description
            );
            state
                .messenger
                .send_text_with_keyboard(bot_id, chat, &text, start_keyboard(&state.premium))
                .await?;
        }
        "help" => {
            state.messenger.send_text(bot_id, chat, HELP_TEXT).await?;
        }
        "buy" => {
            let Some(from) = msg.from() else {
                return Ok(());
            };
            start_purchase(state, bot_id, from, chat).await?;
        }
        "status" => {
            let Some(from) = msg.from() else {
                return Ok(());
            };
            let user = state.users.upsert(&incoming_user(bot_id, from, chat)).await?;
            let text = match (user.is_paid, user.paid_until) {
                (true, Some(until)) => {
                    format!("Premium is active until {}.", until.format("%Y-%m-%d"))
                }
                (true, None) => "Premium is active.".to_string(),
                _ => "You are on the free plan. Use /buy to get premium.".to_string(),
            };
            state.messenger.send_text(bot_id, chat, &text).await?;
        }
        other => {
            tracing::debug!(bot = %bot_id, command = other, "unknown command");
            state
                .messenger
                .send_text(bot_id, chat, "Unknown command. Try /help.")
                .await?;
        }
    }
    Ok(())
}
