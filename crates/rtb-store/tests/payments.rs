//! Payment lifecycle against a real (in-memory) SQLite store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use rtb_core::{
    domain::{BotId, ChatId, IncomingUser, PaymentStatus, Product, TelegramUserId, User},
    payments::{CaptureOutcome, PaymentService},
    ports::{PaymentRepository, UserRepository},
    status::{ObjectType, StatusCode, StatusLog},
    testing::{FakeMessenger, FakePaymentProvider, RecordingAlertSink},
    Error,
};
use rtb_store::{Database, Store};
use uuid::Uuid;

struct Harness {
    store: Store,
    provider: Arc<FakePaymentProvider>,
    messenger: Arc<FakeMessenger>,
    alerts: Arc<RecordingAlertSink>,
    statuses: Arc<StatusLog>,
    service: Arc<PaymentService>,
}

async fn harness() -> Harness {
    let store = Store::new(Database::open_in_memory().await.unwrap());
    let provider = Arc::new(FakePaymentProvider::default());
    let messenger = Arc::new(FakeMessenger::default());
    let alerts = Arc::new(RecordingAlertSink::default());
    let statuses = Arc::new(StatusLog::new(store.statuses.clone(), alerts.clone()));
    let service = Arc::new(PaymentService::new(
        store.payments.clone(),
        store.users.clone(),
        provider.clone(),
        messenger.clone(),
        statuses.clone(),
    ));
    Harness {
        store,
        provider,
        messenger,
        alerts,
        statuses,
        service,
    }
}

fn bot() -> BotId {
    BotId::new("main")
}

fn premium(amount: i64) -> Product {
    Product {
        id: "premium_30d".to_string(),
        title: "Premium".to_string(),
        description: "30 days of premium answers".to_string(),
        amount,
        currency: "XTR".to_string(),
        duration_days: 30,
    }
}

async fn buyer(h: &Harness) -> User {
    h.store
        .users
        .upsert(&IncomingUser {
            bot_id: bot(),
            telegram_user_id: TelegramUserId(777),
            chat_id: ChatId(42),
            username: None,
        })
        .await
        .unwrap()
}

#[tokio::test]
async fn purchase_end_to_end() {
    let h = harness().await;
    let u = buyer(&h).await;

    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(500))
        .await
        .unwrap();
    assert_eq!(payment.status, PaymentStatus::Pending);
    let stored = h.store.payments.get(payment.id).await.unwrap().unwrap();
    assert_eq!((stored.amount, stored.currency.as_str()), (500, "XTR"));

    let invoices = h.provider.invoices();
    assert_eq!(invoices.len(), 1);
    assert_eq!(invoices[0].payload, payment.id.to_string());
    assert_eq!(invoices[0].currency, "XTR");
    assert_eq!(invoices[0].amount, 500);

    let payload = payment.id.to_string();
    let accepted = h
        .service
        .validate_pre_authorization(&bot(), "q-1", TelegramUserId(777), 500, "XTR", &payload)
        .await
        .unwrap();
    assert!(accepted);
    let confirmations = h.provider.confirmations();
    assert!(confirmations[0].accept);
    assert_eq!(confirmations[0].query_id, "q-1");

    let before = Utc::now();
    let outcome = h
        .service
        .capture(&bot(), TelegramUserId(777), ChatId(42), &payload, "charge-1")
        .await
        .unwrap();
    let CaptureOutcome::Granted { paid_until } = outcome else {
        panic!("expected a grant, got {outcome:?}");
    };
    assert!(paid_until >= before + Duration::days(30));

    let stored = h.store.payments.get(payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Succeeded);
    assert_eq!(stored.provider_transaction_id, "charge-1");
    assert!(stored.succeeded_at.is_some());

    let user = h.store.users.get(u.id).await.unwrap().unwrap();
    assert!(user.is_paid);
    assert_eq!(user.paid_until, Some(paid_until));
    assert_eq!(h.messenger.texts_for(ChatId(42)).len(), 1);
}

#[tokio::test]
async fn pre_authorization_rejects_amount_mismatch() {
    let h = harness().await;
    let u = buyer(&h).await;
    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();

    let accepted = h
        .service
        .validate_pre_authorization(
            &bot(),
            "q-2",
            TelegramUserId(777),
            150,
            "XTR",
            &payment.id.to_string(),
        )
        .await
        .unwrap();
    assert!(!accepted);

    let confirmation = &h.provider.confirmations()[0];
    assert!(!confirmation.accept);
    assert_eq!(confirmation.reason.as_deref(), Some("amount mismatch"));

    // Validation never mutates the payment.
    let stored = h.store.payments.get(payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Pending);
}

#[tokio::test]
async fn pre_authorization_rejects_other_users_and_unknown_payloads() {
    let h = harness().await;
    let u = buyer(&h).await;
    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();
    h.store
        .users
        .upsert(&IncomingUser {
            bot_id: bot(),
            telegram_user_id: TelegramUserId(888),
            chat_id: ChatId(43),
            username: None,
        })
        .await
        .unwrap();

    let svc = &h.service;
    let payload = payment.id.to_string();
    assert!(!svc
        .validate_pre_authorization(&bot(), "a", TelegramUserId(888), 100, "XTR", &payload)
        .await
        .unwrap());
    assert!(!svc
        .validate_pre_authorization(&bot(), "b", TelegramUserId(777), 100, "XTR", "not-a-uuid")
        .await
        .unwrap());
    assert!(!svc
        .validate_pre_authorization(&bot(), "c", TelegramUserId(777), 100, "EUR", &payload)
        .await
        .unwrap());

    let reasons: Vec<Option<String>> = h
        .provider
        .confirmations()
        .into_iter()
        .map(|c| c.reason)
        .collect();
    assert_eq!(
        reasons,
        vec![
            Some("user mismatch".to_string()),
            Some("payment not found".to_string()),
            Some("currency mismatch".to_string()),
        ]
    );
}

#[tokio::test]
async fn sequential_captures_grant_once() {
    let h = harness().await;
    let u = buyer(&h).await;
    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();
    let payload = payment.id.to_string();

    let first = h
        .service
        .capture(&bot(), TelegramUserId(777), ChatId(42), &payload, "charge-1")
        .await
        .unwrap();
    let second = h
        .service
        .capture(&bot(), TelegramUserId(777), ChatId(42), &payload, "charge-1")
        .await
        .unwrap();

    assert!(matches!(first, CaptureOutcome::Granted { .. }));
    assert_eq!(second, CaptureOutcome::AlreadyProcessed);
    assert_eq!(h.messenger.texts_for(ChatId(42)).len(), 1);

    // Pre-authorization after capture is refused.
    assert!(!h
        .service
        .validate_pre_authorization(&bot(), "late", TelegramUserId(777), 100, "XTR", &payload)
        .await
        .unwrap());
    assert_eq!(
        h.provider.confirmations()[0].reason.as_deref(),
        Some("payment is not pending")
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_captures_grant_exactly_once() {
    let h = harness().await;
    let u = buyer(&h).await;
    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();

    let mut tasks = Vec::new();
    for i in 0..8 {
        let service = h.service.clone();
        let payload = payment.id.to_string();
        tasks.push(tokio::spawn(async move {
            service
                .capture(
                    &BotId::new("main"),
                    TelegramUserId(777),
                    ChatId(42),
                    &payload,
                    &format!("charge-{i}"),
                )
                .await
                .unwrap()
        }));
    }

    let mut granted = 0;
    for t in tasks {
        if matches!(t.await.unwrap(), CaptureOutcome::Granted { .. }) {
            granted += 1;
        }
    }
    assert_eq!(granted, 1);
    assert_eq!(h.messenger.texts_for(ChatId(42)).len(), 1);

    let user = h.store.users.get(u.id).await.unwrap().unwrap();
    let until = user.paid_until.unwrap();
    assert!(until < Utc::now() + Duration::days(31));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn parallel_captures_of_two_payments_both_count() {
    let h = harness().await;
    let u = buyer(&h).await;
    let before = Utc::now();
    let mut payloads = Vec::new();
    for _ in 0..2 {
        let payment = h
            .service
            .create(&bot(), u.id, ChatId(42), &premium(100))
            .await
            .unwrap();
        payloads.push(payment.id.to_string());
    }

    let mut tasks = Vec::new();
    for (i, payload) in payloads.into_iter().enumerate() {
        let service = h.service.clone();
        tasks.push(tokio::spawn(async move {
            service
                .capture(
                    &BotId::new("main"),
                    TelegramUserId(777),
                    ChatId(42),
                    &payload,
                    &format!("charge-{i}"),
                )
                .await
                .unwrap()
        }));
    }
    for t in tasks {
        assert!(matches!(t.await.unwrap(), CaptureOutcome::Granted { .. }));
    }

    let until = h.store.users.get(u.id).await.unwrap().unwrap().paid_until.unwrap();
    assert!(until >= before + Duration::days(60));
    assert!(until <= Utc::now() + Duration::days(60));
}

#[tokio::test]
async fn renewal_extends_from_current_expiry() {
    let h = harness().await;
    let u = buyer(&h).await;
    let current = Utc::now() + Duration::days(10);
    h.store.users.grant_paid(u.id, current).await.unwrap();

    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();
    let outcome = h
        .service
        .capture(
            &bot(),
            TelegramUserId(777),
            ChatId(42),
            &payment.id.to_string(),
            "charge-1",
        )
        .await
        .unwrap();
    assert_eq!(
        outcome,
        CaptureOutcome::Granted {
            paid_until: current + Duration::days(30)
        }
    );
}

#[tokio::test]
async fn invoice_failure_fails_the_payment_and_alerts() {
    let h = harness().await;
    let u = buyer(&h).await;
    h.provider.fail_invoices(true);

    let err = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap_err();
    assert!(!err.is_business());

    let alerts = h.alerts.wait_for(1).await;
    assert_eq!(alerts.len(), 1);
    assert!(alerts[0].contains("payment"));
    assert!(alerts[0].contains("provider unavailable"));

    // The alert names the payment; its row stays, now failed.
    let id = alerts[0]
        .split_whitespace()
        .nth(2)
        .and_then(|s| Uuid::parse_str(s).ok())
        .unwrap();
    let stored = h.store.payments.get(id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Failed);
    assert!(stored.failed_at.is_some());
    assert!(stored.error_message.unwrap().contains("provider unavailable"));
}

#[tokio::test]
async fn grant_failure_keeps_capture_and_notifies() {
    let h = harness().await;
    // Payment for a user row that does not exist: the grant cannot succeed.
    let ghost = Uuid::new_v4();
    let payment = h
        .service
        .create(&bot(), ghost, ChatId(42), &premium(100))
        .await
        .unwrap();

    let outcome = h
        .service
        .capture(
            &bot(),
            TelegramUserId(777),
            ChatId(42),
            &payment.id.to_string(),
            "charge-1",
        )
        .await
        .unwrap();
    assert_eq!(outcome, CaptureOutcome::GrantFailed);

    let stored = h.store.payments.get(payment.id).await.unwrap().unwrap();
    assert_eq!(stored.status, PaymentStatus::Succeeded);

    let failed = h
        .statuses
        .latest(ObjectType::Payment, payment.id)
        .await
        .unwrap();
    assert_eq!(failed.status, StatusCode::Failed);
    assert!(h.alerts.wait_for(1).await[0].contains("during payment"));
    assert_eq!(h.messenger.texts_for(ChatId(42)).len(), 1);
}

#[tokio::test]
async fn pre_authorization_storage_error_survives_a_failed_answer() {
    let h = harness().await;
    let u = buyer(&h).await;
    let payment = h
        .service
        .create(&bot(), u.id, ChatId(42), &premium(100))
        .await
        .unwrap();

    h.store
        .db
        .connection()
        .call(|conn| conn.execute_batch("DROP TABLE payments"))
        .await
        .map_err(|e: tokio_rusqlite::Error<rusqlite::Error>| e.to_string())
        .unwrap();
    h.provider.fail_confirmations(true);

    let err = h
        .service
        .validate_pre_authorization(
            &bot(),
            "q-9",
            TelegramUserId(777),
            100,
            "XTR",
            &payment.id.to_string(),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Storage(_)));

    let confirmations = h.provider.confirmations();
    assert_eq!(confirmations.len(), 1);
    assert!(!confirmations[0].accept);
    assert_eq!(confirmations[0].reason.as_deref(), Some("internal error"));
}

#[tokio::test]
async fn capture_of_unknown_payment_is_a_business_error() {
    let h = harness().await;
    let err = h
        .service
        .capture(
            &bot(),
            TelegramUserId(777),
            ChatId(42),
            &Uuid::new_v4().to_string(),
            "charge-1",
        )
        .await
        .unwrap_err();
    assert!(err.is_business());
}
