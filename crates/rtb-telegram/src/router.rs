use std::{collections::HashMap, sync::Arc};

use teloxide::{dispatching::Dispatcher, dptree, prelude::*};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use rtb_core::{
    domain::{BotId, ChatId, Product},
    messaging::port::MessagingPort,
    payments::PaymentService,
    pipeline::RequestPipeline,
    ports::UserRepository,
};

use crate::{handlers, Bots};

/// Services shared by every bot's dispatcher.
pub struct AppState {
    pub users: Arc<dyn UserRepository>,
    pub pipeline: Arc<RequestPipeline>,
    pub payments: Arc<PaymentService>,
    pub messenger: Arc<dyn MessagingPort>,
    pub premium: Product,
    pub chat_locks: ChatLocks,
}

/// Serializes question submission per `(bot, chat)`, so the delivery guard
/// sees submissions in arrival order.
#[derive(Default)]
pub struct ChatLocks {
    inner: Mutex<HashMap<(BotId, ChatId), Arc<Mutex<()>>>>,
}

impl ChatLocks {
    pub async fn lock_chat(&self, bot: &BotId, chat_id: ChatId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().await;
            map.entry((bot.clone(), chat_id))
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }
}

/// Long-poll every bot until `cancel` fires.
pub async fn run_polling(
    bots: Bots,
    state: Arc<AppState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    if bots.is_empty() {
        anyhow::bail!("no telegram bots configured");
    }

    let mut tasks = Vec::new();
    for (bot_id, bot) in bots.iter() {
        match bot.get_me().await {
            Ok(me) => tracing::info!(bot = %bot_id, username = %me.username(), "bot started"),
            Err(e) => tracing::warn!(bot = %bot_id, error = %e, "get_me failed; polling anyway"),
        }

        let handler = dptree::entry()
            .branch(Update::filter_pre_checkout_query().endpoint(handlers::handle_pre_checkout))
            .branch(Update::filter_callback_query().endpoint(handlers::handle_callback))
            .branch(Update::filter_message().endpoint(handlers::handle_message));

        let mut dispatcher = Dispatcher::builder(bot.clone(), handler)
            .dependencies(dptree::deps![state.clone(), bot_id.clone()])
            .build();

        let shutdown = dispatcher.shutdown_token();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            cancel.cancelled().await;
            if let Ok(done) = shutdown.shutdown() {
                done.await;
            }
        });

        let bot_id = bot_id.clone();
        tasks.push(tokio::spawn(async move {
            dispatcher.dispatch().await;
            tracing::info!(bot = %bot_id, "dispatcher stopped");
        }));
    }

    for task in tasks {
        task.await?;
    }
    Ok(())
}
