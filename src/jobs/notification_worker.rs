use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;

use crate::services::notifier::{DeliveryContext, FailedDelivery, GiftCardNotification};

#[derive(Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Delivered { attempts: u32 },
    Skipped,
    Failed { attempts: u32 },
}

/// Background job that drains the notification queue.
///
/// Each event is delivered in its own task so one event's backoff does not
/// hold up the rest of the queue. At most `max_in_flight` deliveries run at
/// once; while that many are pending the queue is left alone, so it fills up
/// and `enqueue` starts rejecting. On shutdown the queue is closed, remaining
/// events are still delivered, and the job returns once every delivery task
/// has finished.
pub async fn run(
    mut receiver: mpsc::Receiver<GiftCardNotification>,
    mut shutdown: oneshot::Receiver<()>,
    context: Arc<DeliveryContext>,
) {
    let max_in_flight = context.max_in_flight.max(1);
    let mut tasks = JoinSet::new();

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                receiver.close();
                break;
            }
            next = receiver.recv(), if tasks.len() < max_in_flight => match next {
                Some(event) => {
                    tasks.spawn(deliver(context.clone(), event));
                }
                None => break,
            },
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
        }
    }

    while let Some(event) = receiver.recv().await {
        if tasks.len() >= max_in_flight {
            tasks.join_next().await;
        }
        tasks.spawn(deliver(context.clone(), event));
    }
    while tasks.join_next().await.is_some() {}
}

/// Delivers one event, retrying with backoff until the policy's attempt
/// budget is spent
pub async fn deliver(context: Arc<DeliveryContext>, event: GiftCardNotification) -> DeliveryOutcome {
    let key = event.key;

    if !context.log.try_begin(&key) {
        tracing::debug!(
            card_id = %key.gift_card_id,
            kind = key.kind.as_str(),
            "Notification already delivered or in flight, skipping"
        );
        return DeliveryOutcome::Skipped;
    }

    let message = match context.composer.compose(&event) {
        Ok(message) => message,
        Err(e) => {
            tracing::error!(
                card_id = %key.gift_card_id,
                kind = key.kind.as_str(),
                error = %e,
                "NotificationDeliveryFailed: could not compose email"
            );
            context.log.mark_failed(FailedDelivery {
                key,
                recipient: event.holder_email,
                attempts: 0,
                error: e.to_string(),
                failed_at: Utc::now(),
            });
            return DeliveryOutcome::Failed { attempts: 0 };
        }
    };

    let max_attempts = context.policy.max_attempts.max(1);
    let mut last_error = String::new();

    for attempt in 1..=max_attempts {
        match context.mailer.send(&message).await {
            Ok(()) => {
                context.log.mark_delivered(&key);
                tracing::info!(
                    card_id = %key.gift_card_id,
                    kind = key.kind.as_str(),
                    attempt,
                    "Notification delivered"
                );
                return DeliveryOutcome::Delivered { attempts: attempt };
            }
            Err(e) => {
                tracing::warn!(
                    card_id = %key.gift_card_id,
                    kind = key.kind.as_str(),
                    attempt,
                    error = %e,
                    "Notification delivery attempt failed"
                );
                last_error = e.to_string();

                if attempt < max_attempts {
                    tokio::time::sleep(context.policy.backoff_for(attempt)).await;
                }
            }
        }
    }

    tracing::error!(
        card_id = %key.gift_card_id,
        kind = key.kind.as_str(),
        attempts = max_attempts,
        error = %last_error,
        "NotificationDeliveryFailed: retry budget exhausted, event dropped"
    );
    context.log.mark_failed(FailedDelivery {
        key,
        recipient: message.to,
        attempts: max_attempts,
        error: last_error,
        failed_at: Utc::now(),
    });

    DeliveryOutcome::Failed {
        attempts: max_attempts,
    }
}
