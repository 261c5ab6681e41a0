use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use rtb_core::{
    alerting::{AlertSink, ChatAlertSink, FanoutAlertSink, LogAlertSink, WebhookAlertSink},
    bus::{run_consumer, BusConsumer, BusProducer, DeadLetterReplayer},
    config::Config,
    domain::ChatId,
    guard::DeliveryGuard,
    jobs::{ScheduledPushJob, SubscriptionExpiryJob},
    messaging::{port::MessagingPort, throttled::ThrottledMessenger},
    payments::PaymentService,
    pipeline::RequestPipeline,
    scheduler::{Job, JobScheduler},
    status::StatusLog,
};
use rtb_store::{Database, Store};
use rtb_telegram::{
    router::{run_polling, AppState, ChatLocks},
    Bots, TelegramMessenger, TelegramPayments,
};

const DEFAULT_REPLAY_LIMIT: usize = 100;

enum Command {
    Serve,
    ReplayDeadLetters { limit: usize },
}

fn parse_args(mut args: impl Iterator<Item = String>) -> anyhow::Result<Command> {
    match args.next().as_deref() {
        None | Some("serve") => Ok(Command::Serve),
        Some("replay-dead-letters") => {
            let limit = match args.next() {
                Some(n) => n
                    .parse()
                    .with_context(|| format!("invalid replay limit: {n}"))?,
                None => DEFAULT_REPLAY_LIMIT,
            };
            Ok(Command::ReplayDeadLetters { limit })
        }
        Some(other) => {
            anyhow::bail!("unknown command `{other}` (expected `serve` or `replay-dead-letters [limit]`)")
        }
    }
}

/// Durable producer and reply consumer over the application database.
fn bus(cfg: &Config, store: &Store) -> (Arc<dyn BusProducer>, Arc<dyn BusConsumer>) {
    let bus = store.bus();
    let consumer: Arc<dyn BusConsumer> = Arc::new(bus.consumer(
        &cfg.consumer_group,
        &cfg.response_topic,
        cfg.bus_poll_interval,
    ));
    let producer: Arc<dyn BusProducer> = Arc::new(bus);
    (producer, consumer)
}

fn alert_sink(
    cfg: &Config,
    messenger: Arc<dyn MessagingPort>,
) -> anyhow::Result<Arc<dyn AlertSink>> {
    let mut sinks: Vec<Arc<dyn AlertSink>> = Vec::new();
    if let (Some(chat), Some(bot)) = (cfg.alert_chat_id, cfg.alert_bot()) {
        sinks.push(Arc::new(ChatAlertSink::new(messenger, bot.clone(), ChatId(chat))));
    }
    if let Some(url) = &cfg.alert_webhook_url {
        sinks.push(Arc::new(WebhookAlertSink::new(url.clone())?));
    }
    if sinks.is_empty() {
        return Ok(Arc::new(LogAlertSink));
    }
    if sinks.len() == 1 {
        return Ok(sinks.remove(0));
    }
    Ok(Arc::new(FanoutAlertSink::new(sinks)))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rtb_core::logging::init("rtb")?;

    let command = parse_args(std::env::args().skip(1))?;
    let cfg = Config::load()?;
    let store = Store::new(Database::open(&cfg.database_path).await?);
    let (producer, consumer) = bus(&cfg, &store);

    if let Command::ReplayDeadLetters { limit } = command {
        let replayer = DeadLetterReplayer::new(store.dead_letters.clone(), producer);
        let replayed = replayer.replay_pending(limit).await?;
        tracing::info!(replayed, "dead-letter replay finished");
        return Ok(());
    }

    let bots = Bots::new(&cfg.bots);
    let raw_messenger: Arc<dyn MessagingPort> = Arc::new(TelegramMessenger::new(bots.clone()));
    let messenger: Arc<dyn MessagingPort> =
        Arc::new(ThrottledMessenger::new(raw_messenger, cfg.throttle));

    let alerts = alert_sink(&cfg, messenger.clone())?;
    let statuses = Arc::new(StatusLog::new(store.statuses.clone(), alerts));

    let pipeline = Arc::new(RequestPipeline::new(
        store.requests.clone(),
        store.users.clone(),
        statuses.clone(),
        producer,
        messenger.clone(),
        Arc::new(DeliveryGuard::new()),
        cfg.pipeline(),
    ));
    let payments = Arc::new(PaymentService::new(
        store.payments.clone(),
        store.users.clone(),
        Arc::new(TelegramPayments::new(bots.clone())),
        messenger.clone(),
        statuses,
    ));

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("shutdown requested");
            }
            cancel.cancel();
        });
    }

    let consumer_task = tokio::spawn(run_consumer(
        consumer,
        pipeline.clone(),
        store.dead_letters.clone(),
        cancel.clone(),
    ));

    let mut jobs: Vec<Arc<dyn Job>> = vec![Arc::new(SubscriptionExpiryJob::new(
        store.users.clone(),
        messenger.clone(),
        cfg.expiry_schedule.clone(),
        cfg.expiry_text.clone(),
    ))];
    if let Some(text) = &cfg.push_text {
        jobs.push(Arc::new(ScheduledPushJob::new(
            store.users.clone(),
            messenger.clone(),
            cfg.push_schedule.clone(),
            text.clone(),
            cfg.push_only_unpaid,
        )));
    }
    let job_tasks = JobScheduler::new(cancel.clone()).start(jobs);

    tracing::info!(
        bots = cfg.bots.len(),
        request_topic = %cfg.request_topic,
        response_topic = %cfg.response_topic,
        database = %cfg.database_path.display(),
        timezone = %cfg.timezone,
        "rtb started"
    );

    let state = Arc::new(AppState {
        users: store.users.clone(),
        pipeline,
        payments,
        messenger,
        premium: cfg.premium.clone(),
        chat_locks: ChatLocks::default(),
    });
    let polled = run_polling(bots, state, cancel.clone()).await;

    // Polling only returns on shutdown or a fatal error; stop everything else.
    cancel.cancel();
    consumer_task.await?;
    for task in job_tasks {
        task.await?;
    }
    polled
}
