use teloxide::{prelude::*, types::PreCheckoutQuery};

use rtb_core::{
    domain::{BotId, ChatId, TelegramUserId},
    payments::CaptureOutcome,
};

use crate::router::AppState;

use super::{incoming_user, HandlerResult, SOMETHING_WENT_WRONG};

/// Create a pending payment and send its invoice.
pub(crate) async fn start_purchase(
    state: &AppState,
    bot_id: &BotId,
    from: &teloxide::types::User,
    chat: ChatId,
) -> HandlerResult {
    let user = state.users.upsert(&incoming_user(bot_id, from, chat)).await?;
    if let Err(e) = state
        .payments
        .create(bot_id, user.id, chat, &state.premium)
        .await
    {
        let _ = state
            .messenger
            .send_text(bot_id, chat, "Could not create the invoice. Please try again later.")
            .await;
        return Err(e.into());
    }
    Ok(())
}

pub async fn handle_pre_checkout(
    q: PreCheckoutQuery,
    state: &AppState,
    bot_id: &BotId,
) -> HandlerResult {
    let accepted = state
        .payments
        .validate_pre_authorization(
            bot_id,
            &q.id,
            TelegramUserId(q.from.id.0 as i64),
            i64::from(q.total_amount),
            &format!("{:?}", q.currency),
            &q.invoice_payload,
        )
        .await?;
    tracing::debug!(bot = %bot_id, query_id = %q.id, accepted, "pre-checkout answered");
    Ok(())
}

pub async fn handle_successful_payment(
    msg: &Message,
    state: &AppState,
    bot_id: &BotId,
) -> HandlerResult {
    let Some(paid) = msg.successful_payment() else {
        return Ok(());
    };
    let Some(from) = msg.from() else {
        return Ok(());
    };
    let chat = ChatId(msg.chat.id.0);

    let outcome = state
        .payments
        .capture(
            bot_id,
            TelegramUserId(from.id.0 as i64),
            chat,
            &paid.invoice_payload,
            &paid.telegram_payment_charge_id,
        )
        .await;

    match outcome {
        Ok(CaptureOutcome::Granted { paid_until }) => {
            tracing::info!(bot = %bot_id, chat_id = %chat, %paid_until, "premium granted");
            Ok(())
        }
        // Both were already logged and, where needed, reported to the user.
        Ok(CaptureOutcome::AlreadyProcessed | CaptureOutcome::GrantFailed) => Ok(()),
        Err(e) if e.is_business() => {
            tracing::warn!(bot = %bot_id, error = %e, "successful payment not matched");
            let _ = state
                .messenger
                .send_text(bot_id, chat, SOMETHING_WENT_WRONG)
                .await;
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}
