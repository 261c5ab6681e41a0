//! Payment state machine for Telegram Stars purchases.
//!
//! `Pending` is written before the provider is contacted; a payment leaves it
//! exactly once, through a conditional update. The winner of that update is
//! the only caller that grants the entitlement.

use std::{fmt, sync::Arc};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::{
    domain::{
        BotId, ChatId, Payment, PaymentMetadata, PaymentMethod, PaymentStatus, Product,
        TelegramUserId,
    },
    errors::Error,
    messaging::port::MessagingPort,
    ports::{InvoiceRequest, PaymentProvider, PaymentRepository, UserRepository},
    status::{NewStatus, Phase, StatusCode, StatusLog, StatusMetadata},
    Result,
};

const GRANT_FAILED_TEXT: &str =
    "Your payment went through, but activating premium failed. Support has been notified.";

/// Why a pre-authorization was declined. `reason()` is what the provider
/// shows to the buyer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Rejection {
    PaymentNotFound,
    UserMismatch,
    AmountMismatch,
    CurrencyMismatch,
    NotPending,
}

impl Rejection {
    pub fn reason(&self) -> &'static str {
        match self {
            Rejection::PaymentNotFound => "payment not found",
            Rejection::UserMismatch => "user mismatch",
            Rejection::AmountMismatch => "amount mismatch",
            Rejection::CurrencyMismatch => "currency mismatch",
            Rejection::NotPending => "payment is not pending",
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.reason())
    }
}

/// Pure pre-authorization checks, in the order they are reported.
pub fn check_pre_authorization(
    payment: Option<&Payment>,
    bot: &BotId,
    payer: Option<Uuid>,
    amount: i64,
    currency: &str,
) -> std::result::Result<(), Rejection> {
    let payment = match payment {
        Some(p) if &p.bot_id == bot => p,
        _ => return Err(Rejection::PaymentNotFound),
    };
    if payer != Some(payment.user_id) {
        return Err(Rejection::UserMismatch);
    }
    if payment.amount != amount {
        return Err(Rejection::AmountMismatch);
    }
    if !payment.currency.eq_ignore_ascii_case(currency) {
        return Err(Rejection::CurrencyMismatch);
    }
    if payment.status != PaymentStatus::Pending {
        return Err(Rejection::NotPending);
    }
    Ok(())
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CaptureOutcome {
    /// This call moved the payment to `Succeeded` and granted the entitlement.
    Granted { paid_until: DateTime<Utc> },
    /// The payment was already out of `Pending`; nothing was done.
    AlreadyProcessed,
    /// The payment is `Succeeded` but the grant failed; operators were alerted.
    GrantFailed,
}

pub struct PaymentService {
    payments: Arc<dyn PaymentRepository>,
    users: Arc<dyn UserRepository>,
    provider: Arc<dyn PaymentProvider>,
    messenger: Arc<dyn MessagingPort>,
    statuses: Arc<StatusLog>,
}

impl PaymentService {
    pub fn new(
        payments: Arc<dyn PaymentRepository>,
        users: Arc<dyn UserRepository>,
        provider: Arc<dyn PaymentProvider>,
        messenger: Arc<dyn MessagingPort>,
        statuses: Arc<StatusLog>,
    ) -> Self {
        Self {
            payments,
            users,
            provider,
            messenger,
            statuses,
        }
    }

    /// Write a `Pending` payment and ask the provider for an invoice whose
    /// payload is the payment id.
    pub async fn create(
        &self,
        bot: &BotId,
        user_id: Uuid,
        chat_id: ChatId,
        product: &Product,
    ) -> Result<Payment> {
        let payment = Payment {
            id: Uuid::new_v4(),
            user_id,
            bot_id: bot.clone(),
            amount: product.amount,
            currency: product.currency.clone(),
            method: PaymentMethod::ProviderStars,
            provider_transaction_id: String::new(),
            status: PaymentStatus::Pending,
            product_id: product.id.clone(),
            product_title: product.title.clone(),
            metadata: PaymentMetadata::Invoice {
                chat_id: chat_id.0,
                description: product.description.clone(),
                duration_days: product.duration_days,
            },
            created_at: Utc::now(),
            succeeded_at: None,
            failed_at: None,
            error_message: None,
        };
        self.payments.insert(&payment).await?;

        let invoice = self
            .provider
            .create_invoice(InvoiceRequest {
                bot: bot.clone(),
                chat_id,
                title: product.title.clone(),
                description: product.description.clone(),
                payload: payment.id.to_string(),
                currency: product.currency.clone(),
                amount: product.amount,
            })
            .await;

        match invoice {
            Ok(invoice) => {
                tracing::info!(
                    payment_id = %payment.id,
                    invoice_id = %invoice.invoice_id,
                    amount = payment.amount,
                    currency = %payment.currency,
                    "invoice created"
                );
                Ok(payment)
            }
            Err(e) => {
                tracing::error!(payment_id = %payment.id, error = %e, "invoice creation failed");
                let reason = e.to_string();
                if !self.payments.mark_failed(payment.id, &reason, Utc::now()).await? {
                    tracing::warn!(payment_id = %payment.id, "payment left pending before it could fail");
                }
                self.record_failure(payment.id, chat_id, &reason).await;
                Err(e)
            }
        }
    }

    /// Answer a pre-checkout query. Returns whether it was accepted; a
    /// rejection is a normal outcome, not an error.
    pub async fn validate_pre_authorization(
        &self,
        bot: &BotId,
        query_id: &str,
        payer: TelegramUserId,
        amount: i64,
        currency: &str,
        payload: &str,
    ) -> Result<bool> {
        let checked = self.check(bot, payer, amount, currency, payload).await;
        let verdict = match checked {
            Ok(verdict) => verdict,
            Err(e) => {
                // Telegram expects an answer either way.
                if let Err(answer_err) = self
                    .provider
                    .confirm_pre_authorization(bot, query_id, false, Some("internal error"))
                    .await
                {
                    tracing::warn!(
                        query_id,
                        error = %answer_err,
                        cause = %e,
                        "pre-checkout rejection not delivered"
                    );
                }
                return Err(e);
            }
        };

        match verdict {
            Ok(()) => {
                self.provider
                    .confirm_pre_authorization(bot, query_id, true, None)
                    .await?;
                tracing::info!(payload, "pre-authorization accepted");
                Ok(true)
            }
            Err(rejection) => {
                tracing::warn!(payload, payer = payer.0, amount, currency, %rejection, "pre-authorization rejected");
                self.provider
                    .confirm_pre_authorization(bot, query_id, false, Some(rejection.reason()))
                    .await?;
                Ok(false)
            }
        }
    }

    async fn check(
        &self,
        bot: &BotId,
        payer: TelegramUserId,
        amount: i64,
        currency: &str,
        payload: &str,
    ) -> Result<std::result::Result<(), Rejection>> {
        let payment = match Uuid::parse_str(payload.trim()) {
            Ok(id) => self.payments.get(id).await?,
            Err(_) => None,
        };
        let payer = self
            .users
            .find_by_telegram(bot, payer)
            .await?
            .map(|u| u.id);
        Ok(check_pre_authorization(
            payment.as_ref(),
            bot,
            payer,
            amount,
            currency,
        ))
    }

    /// Handle a successful-payment callback. Safe to call any number of
    /// times, concurrently: exactly one call grants.
    pub async fn capture(
        &self,
        bot: &BotId,
        payer: TelegramUserId,
        chat_id: ChatId,
        payload: &str,
        provider_transaction_id: &str,
    ) -> Result<CaptureOutcome> {
        let payment_id = Uuid::parse_str(payload.trim())
            .map_err(|_| Error::NotFound(format!("payment {payload:?}")))?;
        let Some(payment) = self.payments.get(payment_id).await? else {
            tracing::warn!(%payment_id, "capture for unknown payment");
            return Err(Error::NotFound(format!("payment {payment_id}")));
        };

        if payment.status != PaymentStatus::Pending {
            tracing::info!(%payment_id, status = %payment.status, "capture ignored; payment not pending");
            return Ok(CaptureOutcome::AlreadyProcessed);
        }

        let now = Utc::now();
        if !self
            .payments
            .mark_succeeded(payment_id, provider_transaction_id, now)
            .await?
        {
            tracing::info!(%payment_id, "capture lost the race; already processed");
            return Ok(CaptureOutcome::AlreadyProcessed);
        }
        tracing::info!(%payment_id, payer = payer.0, provider_transaction_id, "payment captured");

        match self.grant(&payment, now).await {
            Ok(paid_until) => {
                let text = format!(
                    "Payment received, thank you! Premium is active until {}.",
                    paid_until.format("%Y-%m-%d")
                );
                if let Err(e) = self.messenger.send_text(bot, chat_id, &text).await {
                    tracing::warn!(%payment_id, error = %e, "payment confirmation not delivered");
                }
                Ok(CaptureOutcome::Granted { paid_until })
            }
            Err(e) => {
                tracing::error!(%payment_id, user_id = %payment.user_id, error = %e, "entitlement grant failed");
                self.record_failure(payment_id, chat_id, &format!("grant failed: {e}"))
                    .await;
                if let Err(e) = self.messenger.send_text(bot, chat_id, GRANT_FAILED_TEXT).await {
                    tracing::warn!(%payment_id, error = %e, "grant failure notice not delivered");
                }
                Ok(CaptureOutcome::GrantFailed)
            }
        }
    }

    /// Extend the paid period from whichever is later: now or the current
    /// expiry.
    async fn grant(&self, payment: &Payment, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
        let days = payment.metadata.duration_days().ok_or_else(|| {
            Error::Business(format!("payment {} has no entitlement duration", payment.id))
        })?;
        self.users.extend_paid(payment.user_id, now, days).await
    }

    async fn record_failure(&self, payment_id: Uuid, chat_id: ChatId, error: &str) {
        let status = NewStatus::payment(payment_id, StatusCode::Failed)
            .with_error(error)
            .with_metadata(StatusMetadata::Failure {
                phase: Phase::Payment,
                chat_id: Some(chat_id.0),
            });
        if let Err(e) = self.statuses.append(status).await {
            tracing::error!(%payment_id, error = %e, "payment failure status not recorded");
        }
    }
}
