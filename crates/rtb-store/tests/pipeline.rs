//! Request lifecycle against a real (in-memory) SQLite store.

use std::{
    sync::{Arc, OnceLock},
    time::Duration,
};

use async_trait::async_trait;
use rtb_core::{
    bus::{
        memory::MemoryBus, run_consumer, BusProducer, DeadLetterReplayer, RagReplyMessage,
        RagRequestMessage,
    },
    domain::{BotId, ChatId, IncomingUser, TelegramUserId, User},
    guard::DeliveryGuard,
    pipeline::{PipelineConfig, RequestPipeline},
    ports::{DeadLetterRepository, RequestRepository, UserRepository},
    status::{ObjectType, StatusCode, StatusLog, StatusMetadata},
    testing::{FakeMessenger, RecordingAlertSink},
    Error, Result,
};
use rtb_store::{Database, Store};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    store: Store,
    bus: MemoryBus,
    messenger: Arc<FakeMessenger>,
    alerts: Arc<RecordingAlertSink>,
    statuses: Arc<StatusLog>,
    pipeline: Arc<RequestPipeline>,
}

async fn harness_with(placeholder: Option<&str>, producer: Option<Arc<dyn BusProducer>>) -> Harness {
    let store = Store::new(Database::open_in_memory().await.unwrap());
    let bus = MemoryBus::new();
    let messenger = Arc::new(FakeMessenger::default());
    let alerts = Arc::new(RecordingAlertSink::default());
    let statuses = Arc::new(StatusLog::new(store.statuses.clone(), alerts.clone()));
    let producer: Arc<dyn BusProducer> = match producer {
        Some(p) => p,
        None => Arc::new(bus.clone()),
    };
    let pipeline = Arc::new(RequestPipeline::new(
        store.requests.clone(),
        store.users.clone(),
        statuses.clone(),
        producer,
        messenger.clone(),
        Arc::new(DeliveryGuard::new()),
        PipelineConfig {
            placeholder_text: placeholder.map(|s| s.to_string()),
            ..PipelineConfig::default()
        },
    ));
    Harness {
        store,
        bus,
        messenger,
        alerts,
        statuses,
        pipeline,
    }
}

async fn harness() -> Harness {
    harness_with(None, None).await
}

fn bot() -> BotId {
    BotId::new("main")
}

async fn user(h: &Harness, chat: i64) -> User {
    h.store
        .users
        .upsert(&IncomingUser {
            bot_id: bot(),
            telegram_user_id: TelegramUserId(chat + 1000),
            chat_id: ChatId(chat),
            username: Some("tester".to_string()),
        })
        .await
        .unwrap()
}

async fn codes(h: &Harness, id: Uuid) -> Vec<StatusCode> {
    h.statuses
        .all_by_object_id(ObjectType::Request, id)
        .await
        .unwrap()
        .into_iter()
        .map(|s| s.status)
        .collect()
}

fn reply(id: Uuid, text: &str) -> RagReplyMessage {
    RagReplyMessage {
        request_id: id.to_string(),
        response_text: text.to_string(),
        error: None,
    }
}

#[tokio::test]
async fn hello_world_round_trip() {
    let h = harness().await;
    let u = user(&h, 42).await;

    let req = h.pipeline.submit(&bot(), &u, "hello", Some(9001)).await.unwrap();
    assert_eq!(codes(&h, req.id).await, vec![StatusCode::Received, StatusCode::SentToBus]);

    let published = h.bus.records("rag.requests");
    assert_eq!(published.len(), 1);
    assert_eq!(published[0].key, req.id.to_string());
    let msg: RagRequestMessage = serde_json::from_str(&published[0].payload).unwrap();
    assert_eq!(msg.request_id, req.id.to_string());
    assert_eq!(msg.request_text, "hello");
    let context: serde_json::Value = serde_json::from_str(&msg.context_blob).unwrap();
    assert_eq!(context["chat_id"], 42);

    h.pipeline.on_bus_reply(&reply(req.id, "world")).await.unwrap();
    assert_eq!(
        codes(&h, req.id).await,
        vec![
            StatusCode::Received,
            StatusCode::SentToBus,
            StatusCode::ResponseReceived,
            StatusCode::ResponseDeliveredToUser,
        ]
    );

    let sent = h.messenger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!((sent[0].chat_id, sent[0].text.as_str()), (ChatId(42), "world"));

    let stored = h.store.requests.get(req.id).await.unwrap().unwrap();
    assert_eq!(stored.response_text.as_deref(), Some("world"));
    assert_eq!(stored.external_update_ref, Some(9001));
    assert!(h.alerts.messages().is_empty());
}

#[tokio::test]
async fn placeholder_is_removed_once_and_duplicates_are_skipped() {
    let h = harness_with(Some("Thinking…"), None).await;
    let u = user(&h, 42).await;

    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();
    assert_eq!(h.messenger.texts_for(ChatId(42)), vec!["Thinking…".to_string()]);

    h.pipeline.on_bus_reply(&reply(req.id, "world")).await.unwrap();
    assert_eq!(h.messenger.deleted().len(), 1);

    let dup = h.pipeline.on_bus_reply(&reply(req.id, "world")).await.unwrap_err();
    assert!(dup.is_business());
    assert_eq!(
        h.messenger.texts_for(ChatId(42)),
        vec!["Thinking…".to_string(), "world".to_string()]
    );
    assert_eq!(h.messenger.deleted().len(), 1);
    assert_eq!(codes(&h, req.id).await.len(), 4);
}

#[tokio::test]
async fn superseded_reply_is_still_delivered_and_marked_stale() {
    let h = harness().await;
    let u = user(&h, 42).await;

    let first = h.pipeline.submit(&bot(), &u, "one", None).await.unwrap();
    let _second = h.pipeline.submit(&bot(), &u, "two", None).await.unwrap();

    h.pipeline.on_bus_reply(&reply(first.id, "answer one")).await.unwrap();
    assert_eq!(h.messenger.texts_for(ChatId(42)), vec!["answer one".to_string()]);

    let history = h
        .statuses
        .all_by_object_id(ObjectType::Request, first.id)
        .await
        .unwrap();
    let received = history
        .iter()
        .find(|s| s.status == StatusCode::ResponseReceived)
        .unwrap();
    assert_eq!(
        received.metadata,
        StatusMetadata::Reply {
            chat_id: 42,
            stale: true
        }
    );
}

#[tokio::test]
async fn processor_error_sends_generic_text_and_alerts() {
    let h = harness().await;
    let u = user(&h, 42).await;
    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    h.pipeline
        .on_bus_reply(&RagReplyMessage {
            request_id: req.id.to_string(),
            response_text: String::new(),
            error: Some("index offline".to_string()),
        })
        .await
        .unwrap();

    assert_eq!(
        codes(&h, req.id).await[2..],
        [StatusCode::ResponseErrorReceived, StatusCode::ResponseErrorDelivered]
    );
    assert_eq!(
        h.messenger.texts_for(ChatId(42)),
        vec![PipelineConfig::default().failure_text]
    );
    let alerts = h.alerts.wait_for(1).await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("response_error_delivered"));
    assert!(alerts[0].contains("index offline"));
}

#[tokio::test]
async fn delivery_failure_is_recorded_without_retry() {
    let h = harness().await;
    let u = user(&h, 42).await;
    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    h.messenger.fail_sends(true);
    h.pipeline.on_bus_reply(&reply(req.id, "world")).await.unwrap();

    let latest = h.statuses.latest(ObjectType::Request, req.id).await.unwrap();
    assert_eq!(latest.status, StatusCode::ResponseErrorDelivered);
    assert!(latest.error_message.unwrap().contains("chat not found"));
    assert!(!codes(&h, req.id).await.contains(&StatusCode::Failed));
    assert_eq!(h.alerts.wait_for(1).await.len(), 1);
}

struct DownProducer;

#[async_trait]
impl BusProducer for DownProducer {
    async fn publish(&self, _topic: &str, _key: &str, _payload: &str) -> Result<()> {
        Err(Error::Bus("broker unreachable".to_string()))
    }
}

#[tokio::test]
async fn publish_failure_keeps_request_and_marks_it_failed() {
    let h = harness_with(Some("Thinking…"), Some(Arc::new(DownProducer))).await;
    let u = user(&h, 42).await;

    let err = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap_err();
    assert!(matches!(err, Error::Bus(_)));

    let id: String = h
        .store
        .db
        .connection()
        .call(|conn| conn.query_row("SELECT id FROM requests", [], |r| r.get(0)))
        .await
        .map_err(|e: tokio_rusqlite::Error<rusqlite::Error>| e.to_string())
        .unwrap();
    let id = Uuid::parse_str(&id).unwrap();
    assert_eq!(codes(&h, id).await, vec![StatusCode::Received, StatusCode::Failed]);

    let alerts = h.alerts.wait_for(1).await;
    assert!(alerts[0].contains("during submission"));
    assert!(alerts[0].contains("broker unreachable"));
    // The placeholder of a request that never reached the bus is taken back.
    let sent = h.messenger.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].text, "Thinking…");
    let deleted = h.messenger.deleted();
    assert_eq!(deleted.len(), 1);
    assert_eq!(deleted[0].chat_id, ChatId(42));
}

/// A processor that answers before `publish` has returned.
#[derive(Default)]
struct InstantProcessor {
    pipeline: OnceLock<Arc<RequestPipeline>>,
}

#[async_trait]
impl BusProducer for InstantProcessor {
    async fn publish(&self, _topic: &str, _key: &str, payload: &str) -> Result<()> {
        let msg: RagRequestMessage = serde_json::from_str(payload)?;
        let pipeline = self
            .pipeline
            .get()
            .cloned()
            .ok_or_else(|| Error::Bus("processor not wired".to_string()))?;
        pipeline
            .on_bus_reply(&RagReplyMessage {
                request_id: msg.request_id,
                response_text: "world".to_string(),
                error: None,
            })
            .await
    }
}

#[tokio::test]
async fn reply_arriving_before_publish_returns_removes_the_placeholder() {
    let processor = Arc::new(InstantProcessor::default());
    let h = harness_with(Some("Thinking…"), Some(processor.clone())).await;
    assert!(processor.pipeline.set(h.pipeline.clone()).is_ok());
    let u = user(&h, 42).await;

    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    assert_eq!(
        h.messenger.texts_for(ChatId(42)),
        vec!["Thinking…".to_string(), "world".to_string()]
    );
    assert_eq!(h.messenger.deleted().len(), 1);
    assert_eq!(
        codes(&h, req.id).await,
        vec![
            StatusCode::Received,
            StatusCode::SentToBus,
            StatusCode::ResponseReceived,
            StatusCode::ResponseDeliveredToUser,
        ]
    );
    let latest = h.statuses.latest(ObjectType::Request, req.id).await.unwrap();
    assert_eq!(latest.status, StatusCode::ResponseDeliveredToUser);
}

#[tokio::test]
async fn long_answer_is_delivered_in_parts() {
    let h = harness().await;
    let u = user(&h, 42).await;
    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    let answer = "x".repeat(5000);
    h.pipeline.on_bus_reply(&reply(req.id, &answer)).await.unwrap();

    let texts = h.messenger.texts_for(ChatId(42));
    assert_eq!(texts.len(), 2);
    assert!(texts.iter().all(|t| t.chars().count() <= 4096));
    assert_eq!(texts.concat(), answer);

    let latest = h.statuses.latest(ObjectType::Request, req.id).await.unwrap();
    assert_eq!(latest.status, StatusCode::ResponseDeliveredToUser);
    assert!(h.alerts.messages().is_empty());
}

#[tokio::test]
async fn reply_for_unknown_request_is_a_business_error() {
    let h = harness().await;
    let err = h
        .pipeline
        .on_bus_reply(&reply(Uuid::new_v4(), "orphan"))
        .await
        .unwrap_err();
    assert!(err.is_business());
    assert!(h.messenger.sent().is_empty());
}

#[tokio::test]
async fn reply_for_request_without_user_fails_the_request() {
    let h = harness().await;
    let u = user(&h, 42).await;
    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    // A copy of the request owned by a user that does not exist.
    let mut orphan = h.store.requests.get(req.id).await.unwrap().unwrap();
    orphan.id = Uuid::new_v4();
    orphan.user_id = Uuid::new_v4();
    h.store.requests.insert(&orphan).await.unwrap();

    let err = h.pipeline.on_bus_reply(&reply(orphan.id, "x")).await.unwrap_err();
    assert!(err.is_business());
    assert_eq!(codes(&h, orphan.id).await, vec![StatusCode::Failed]);
    assert!(h.alerts.wait_for(1).await[0].contains("during reply"));
}

#[tokio::test]
async fn consumer_delivers_replies_and_dead_letters_garbage() {
    let h = harness().await;
    let u = user(&h, 42).await;
    let req = h.pipeline.submit(&bot(), &u, "hello", None).await.unwrap();

    h.bus
        .publish("rag.responses", "junk", "{not json")
        .await
        .unwrap();
    h.bus
        .publish(
            "rag.responses",
            &req.id.to_string(),
            &serde_json::to_string(&reply(req.id, "world")).unwrap(),
        )
        .await
        .unwrap();

    let consumer = Arc::new(h.bus.consumer("rag.responses"));
    let cancel = CancellationToken::new();
    let task = tokio::spawn(run_consumer(
        consumer.clone(),
        h.pipeline.clone(),
        h.store.dead_letters.clone(),
        cancel.clone(),
    ));

    tokio::time::timeout(Duration::from_secs(2), async {
        while consumer.committed() < 2 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    cancel.cancel();
    task.await.unwrap();

    assert_eq!(h.messenger.texts_for(ChatId(42)), vec!["world".to_string()]);

    let letters = h.store.dead_letters.list_pending(10).await.unwrap();
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].key, "junk");
    assert_eq!(letters[0].payload, "{not json");
    assert!(letters[0].reason.contains("json"));

    // Replay puts it back on its topic and clears it from the pending list.
    let replayer = DeadLetterReplayer::new(h.store.dead_letters.clone(), Arc::new(h.bus.clone()));
    assert_eq!(replayer.replay_pending(10).await.unwrap(), 1);
    assert!(h.store.dead_letters.list_pending(10).await.unwrap().is_empty());
    assert_eq!(h.bus.records("rag.responses").len(), 3);
}
