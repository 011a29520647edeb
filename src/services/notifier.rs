//! Holder notifications for gift card lifecycle events.
//!
//! Ledger operations hand a [`GiftCardNotification`] to the
//! [`NotificationDispatcher`] after their write has committed. `enqueue` never
//! waits: events go onto a bounded queue consumed by
//! [`crate::jobs::notification_worker`], which composes the email, retries
//! delivery with exponential backoff and records events it had to give up on.
//! Nothing that happens here is reported back to the ledger caller.

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use askama::Template;
use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::jobs::notification_worker;
use crate::services::certificate::{format_amount, CompanyInfo};
use crate::services::mailer::{EmailMessage, MailError, Mailer};
use crate::services::qr_generator;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationKind {
    Issued,
    BalanceChanged,
    Revoked,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Issued => "issued",
            NotificationKind::BalanceChanged => "balance_changed",
            NotificationKind::Revoked => "revoked",
        }
    }
}

/// Identity of a notification. The card version separates successive
/// balance changes; redelivery of the same key is suppressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct NotificationKey {
    pub gift_card_id: Uuid,
    pub kind: NotificationKind,
    pub version: i32,
}

/// Snapshot needed to write the holder-facing message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GiftCardNotification {
    pub key: NotificationKey,
    pub code: String,
    pub amount: i64,
    pub balance: i64,
    pub previous_balance: Option<i64>,
    pub holder_name: String,
    pub holder_email: String,
}

/// Bounded retry schedule for a single event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Wait after the given failed attempt (1-based): doubles each time,
    /// capped at `max_backoff`
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }
}

/// Memory bounds for the notification pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatcherLimits {
    /// Events waiting for the worker; `enqueue` rejects beyond this
    pub queue_capacity: usize,
    /// Events being delivered (or backing off) at once
    pub max_in_flight: usize,
    /// Delivered keys remembered for duplicate suppression
    pub delivered_history: usize,
    /// Failed deliveries kept for inspection, newest last
    pub failed_history: usize,
}

impl Default for DispatcherLimits {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_in_flight: 16,
            delivered_history: 10_000,
            failed_history: 1_000,
        }
    }
}

/// An event that was dropped without being delivered
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailedDelivery {
    pub key: NotificationKey,
    pub recipient: String,
    pub attempts: u32,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

#[derive(Default)]
struct DeliveryState {
    delivered: HashSet<NotificationKey>,
    // Insertion order of `delivered`, oldest first
    delivered_order: VecDeque<NotificationKey>,
    in_flight: HashSet<NotificationKey>,
    failed: VecDeque<FailedDelivery>,
}

/// Shared record of delivered, in-flight and failed notifications.
///
/// Both histories are bounded: the oldest delivered key and the oldest
/// failure are evicted once their limit is reached.
#[derive(Clone)]
pub struct DeliveryLog {
    state: Arc<Mutex<DeliveryState>>,
    delivered_history: usize,
    failed_history: usize,
}

impl Default for DeliveryLog {
    fn default() -> Self {
        let limits = DispatcherLimits::default();
        Self::with_limits(limits.delivered_history, limits.failed_history)
    }
}

impl DeliveryLog {
    pub fn with_limits(delivered_history: usize, failed_history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(DeliveryState::default())),
            delivered_history: delivered_history.max(1),
            failed_history: failed_history.max(1),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut DeliveryState) -> T) -> T {
        let mut state = self
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        f(&mut state)
    }

    /// Claims `key` for delivery. False if it was already delivered or is
    /// being delivered by another task.
    pub fn try_begin(&self, key: &NotificationKey) -> bool {
        self.with_state(|s| !s.delivered.contains(key) && s.in_flight.insert(*key))
    }

    pub fn mark_delivered(&self, key: &NotificationKey) {
        let limit = self.delivered_history;
        self.with_state(|s| {
            s.in_flight.remove(key);
            if s.delivered.insert(*key) {
                s.delivered_order.push_back(*key);
            }
            while s.delivered_order.len() > limit {
                if let Some(oldest) = s.delivered_order.pop_front() {
                    s.delivered.remove(&oldest);
                }
            }
        });
    }

    pub fn mark_failed(&self, failure: FailedDelivery) {
        let limit = self.failed_history;
        self.with_state(|s| {
            s.in_flight.remove(&failure.key);
            s.failed.push_back(failure);
            while s.failed.len() > limit {
                s.failed.pop_front();
            }
        });
    }

    pub fn is_delivered(&self, key: &NotificationKey) -> bool {
        self.with_state(|s| s.delivered.contains(key))
    }

    pub fn delivered_count(&self) -> usize {
        self.with_state(|s| s.delivered.len())
    }

    pub fn failed(&self) -> Vec<FailedDelivery> {
        self.with_state(|s| s.failed.iter().cloned().collect())
    }
}

#[derive(Template)]
#[template(path = "emails/issued.html")]
struct IssuedEmail<'a> {
    company_name: &'a str,
    contact_lines: Vec<String>,
    holder_name: &'a str,
    code: &'a str,
    amount: String,
    has_qr: bool,
    qr_base64: String,
}

#[derive(Template)]
#[template(path = "emails/balance_changed.html")]
struct BalanceChangedEmail<'a> {
    company_name: &'a str,
    contact_lines: Vec<String>,
    holder_name: &'a str,
    code: &'a str,
    amount: String,
    previous_balance: String,
    balance: String,
}

#[derive(Template)]
#[template(path = "emails/revoked.html")]
struct RevokedEmail<'a> {
    company_name: &'a str,
    contact_lines: Vec<String>,
    holder_name: &'a str,
    code: &'a str,
}

/// Turns notification snapshots into emails
#[derive(Debug, Clone)]
pub struct EmailComposer {
    company: CompanyInfo,
}

impl EmailComposer {
    pub fn new(company: CompanyInfo) -> Self {
        Self { company }
    }

    fn money(&self, minor_units: i64) -> String {
        format_amount(minor_units, &self.company.currency_symbol)
    }

    pub fn compose(&self, event: &GiftCardNotification) -> Result<EmailMessage, MailError> {
        let company_name = self.company.name.as_str();
        let contact_lines = self.company.contact_lines();

        let (subject, html) = match event.key.kind {
            NotificationKind::Issued => {
                // The QR is a convenience; the code is in the email either way
                let qr_base64 = match qr_generator::encode_png(&event.code) {
                    Ok(qr) => Some(STANDARD.encode(qr.png)),
                    Err(e) => {
                        tracing::warn!(
                            card_id = %event.key.gift_card_id,
                            error = %e,
                            "QR encoding failed, sending issuance email without image"
                        );
                        None
                    }
                };
                let html = IssuedEmail {
                    company_name,
                    contact_lines,
                    holder_name: &event.holder_name,
                    code: &event.code,
                    amount: self.money(event.amount),
                    has_qr: qr_base64.is_some(),
                    qr_base64: qr_base64.unwrap_or_default(),
                }
                .render()?;
                (format!("Your {} gift card", company_name), html)
            }
            NotificationKind::BalanceChanged => {
                let html = BalanceChangedEmail {
                    company_name,
                    contact_lines,
                    holder_name: &event.holder_name,
                    code: &event.code,
                    amount: self.money(event.amount),
                    previous_balance: self.money(event.previous_balance.unwrap_or(event.amount)),
                    balance: self.money(event.balance),
                }
                .render()?;
                (
                    format!("Your {} gift card balance was updated", company_name),
                    html,
                )
            }
            NotificationKind::Revoked => {
                let html = RevokedEmail {
                    company_name,
                    contact_lines,
                    holder_name: &event.holder_name,
                    code: &event.code,
                }
                .render()?;
                (
                    format!("Your {} gift card has been cancelled", company_name),
                    html,
                )
            }
        };

        Ok(EmailMessage {
            to: event.holder_email.clone(),
            subject,
            html,
        })
    }
}

/// Everything a delivery task needs
pub struct DeliveryContext {
    pub mailer: Arc<dyn Mailer>,
    pub composer: EmailComposer,
    pub policy: RetryPolicy,
    pub log: DeliveryLog,
    pub max_in_flight: usize,
}

/// Producer side of the notification queue
#[derive(Clone)]
pub struct NotificationDispatcher {
    sender: mpsc::Sender<GiftCardNotification>,
    log: DeliveryLog,
}

/// Handle to the running worker; call [`DispatcherWorker::shutdown`] to drain it
pub struct DispatcherWorker {
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<()>,
}

impl NotificationDispatcher {
    /// Spawns the delivery worker and returns the queue handle.
    /// Must be called inside a tokio runtime.
    pub fn start(
        mailer: Arc<dyn Mailer>,
        composer: EmailComposer,
        policy: RetryPolicy,
        limits: DispatcherLimits,
    ) -> (Self, DispatcherWorker) {
        let (sender, receiver) = mpsc::channel(limits.queue_capacity.max(1));
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let log = DeliveryLog::with_limits(limits.delivered_history, limits.failed_history);

        let context = Arc::new(DeliveryContext {
            mailer,
            composer,
            policy,
            log: log.clone(),
            max_in_flight: limits.max_in_flight.max(1),
        });
        let handle = tokio::spawn(notification_worker::run(receiver, shutdown_rx, context));

        tracing::info!(
            capacity = limits.queue_capacity,
            max_in_flight = limits.max_in_flight,
            max_attempts = policy.max_attempts,
            "Notification worker started"
        );

        (
            Self { sender, log },
            DispatcherWorker {
                shutdown: shutdown_tx,
                handle,
            },
        )
    }

    /// Queues an event without waiting. A full or closed queue drops the
    /// event and records it as a failed delivery.
    pub fn enqueue(&self, event: GiftCardNotification) {
        let key = event.key;
        let recipient = event.holder_email.clone();

        match self.sender.try_send(event) {
            Ok(()) => {
                tracing::debug!(
                    card_id = %key.gift_card_id,
                    kind = key.kind.as_str(),
                    "Notification queued"
                );
            }
            Err(e) => {
                let reason = match e {
                    mpsc::error::TrySendError::Full(_) => "notification queue full",
                    mpsc::error::TrySendError::Closed(_) => "notification queue closed",
                };
                tracing::error!(
                    card_id = %key.gift_card_id,
                    kind = key.kind.as_str(),
                    reason,
                    "NotificationDeliveryFailed"
                );
                self.log.mark_failed(FailedDelivery {
                    key,
                    recipient,
                    attempts: 0,
                    error: reason.to_string(),
                    failed_at: Utc::now(),
                });
            }
        }
    }

    pub fn delivery_log(&self) -> &DeliveryLog {
        &self.log
    }
}

impl DispatcherWorker {
    /// Stops accepting new events, delivers what is already queued and waits
    /// for in-flight deliveries to finish or exhaust their retries.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(());
        if let Err(e) = self.handle.await {
            tracing::error!(error = %e, "Notification worker panicked");
        }
        tracing::info!("Notification worker stopped");
    }
}
