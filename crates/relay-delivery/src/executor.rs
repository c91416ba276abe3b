//! Delivery executor: one outbound call, then exactly one broker outcome.
//!
//! Every message handed to [`DeliveryExecutor::deliver`] ends in exactly one
//! of:
//!
//! - ack after a 2xx response
//! - republish to the retry queue with `attempt + 1`, then ack
//! - republish to the failed queue with `attempt` unchanged, then ack
//! - nack without requeue when the republish itself fails
//!
//! The only exception is shutdown during the HTTP call, which leaves the
//! delivery unresolved so the broker redelivers it once the channel closes.

use std::sync::Arc;

use bytes::Bytes;
use relay_broker::{BrokerChannel, QueueTopology};
use relay_core::{ApiTarget, DeliveryTag, ForwardMethod, PendingMessage};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    client::{ForwardClient, ForwardRequest, ForwardResponse},
    error::{DeliveryError, Result},
    retry::{Escalation, RetryLadder},
    wake::WakeCoordinator,
};

/// Broker outcome of one delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Backend accepted the message; acked.
    Delivered,
    /// Republished to the retry queue; acked.
    RetryScheduled {
        /// Attempt number of the republished copy
        next_attempt: u32,
    },
    /// Republished to the failed queue; acked.
    DeadLettered {
        /// Attempt number of the parked copy
        attempt: u32,
    },
    /// Superseded by a newer message of the same class; acked without delivery.
    Discarded,
    /// Republish failed; nacked without requeue and lost.
    Dropped,
    /// No ack or nack was recorded; the broker will redeliver.
    Unresolved,
}

/// Forwards messages to the configured backend and resolves them on the
/// broker.
pub struct DeliveryExecutor {
    client: ForwardClient,
    channel: Arc<dyn BrokerChannel>,
    target: ApiTarget,
    topology: QueueTopology,
    ladder: RetryLadder,
    wake: Option<Arc<WakeCoordinator>>,
    cancel: CancellationToken,
}

impl DeliveryExecutor {
    /// Creates an executor bound to one broker channel.
    pub fn new(
        client: ForwardClient,
        channel: Arc<dyn BrokerChannel>,
        target: ApiTarget,
        topology: QueueTopology,
        ladder: RetryLadder,
        cancel: CancellationToken,
    ) -> Self {
        Self { client, channel, target, topology, ladder, wake: None, cancel }
    }

    /// Triggers the given coordinator on failures against a wake-capable
    /// target.
    #[must_use]
    pub fn with_wake(mut self, wake: Arc<WakeCoordinator>) -> Self {
        self.wake = Some(wake);
        self
    }

    /// Backend this executor forwards to.
    pub fn target(&self) -> &ApiTarget {
        &self.target
    }

    /// Delivers one message and resolves it on the broker.
    pub async fn deliver(&self, message: PendingMessage) -> DeliveryOutcome {
        let result = tokio::select! {
            biased;
            () = self.cancel.cancelled() => {
                info!(delivery_tag = %message.delivery_tag, "shutdown during delivery, leaving unacknowledged");
                return DeliveryOutcome::Unresolved;
            },
            result = self.forward(&message) => result,
        };

        match result {
            Ok(response) => {
                info!(
                    delivery_tag = %message.delivery_tag,
                    attempt = message.attempt,
                    status = response.status_code,
                    duration_ms = response.duration.as_millis() as u64,
                    "delivered"
                );
                self.ack(message.delivery_tag, DeliveryOutcome::Delivered).await
            },
            Err(error) => self.handle_failure(message, error).await,
        }
    }

    /// Parks a message that could not be parsed, keeping its attempt count.
    pub async fn reject(
        &self,
        delivery_tag: DeliveryTag,
        raw_body: Bytes,
        attempt: u32,
        reason: &str,
    ) -> DeliveryOutcome {
        warn!(delivery_tag = %delivery_tag, attempt, reason, "malformed message, moving to failed queue");
        self.republish_then_ack(
            delivery_tag,
            raw_body,
            self.topology.failed(),
            attempt,
            DeliveryOutcome::DeadLettered { attempt },
        )
        .await
    }

    /// Acks a superseded message without delivering it.
    pub async fn discard(&self, delivery_tag: DeliveryTag) -> DeliveryOutcome {
        debug!(delivery_tag = %delivery_tag, "discarding superseded message");
        self.ack(delivery_tag, DeliveryOutcome::Discarded).await
    }

    async fn forward(&self, message: &PendingMessage) -> Result<ForwardResponse> {
        let url_suffix = message.url_suffix.as_deref().ok_or(DeliveryError::MissingUrlSuffix)?;
        let method = message
            .http_method
            .as_deref()
            .and_then(ForwardMethod::parse)
            .ok_or(DeliveryError::MissingMethod)?;

        let request = ForwardRequest {
            method,
            url: self.target.url_for(url_suffix),
            payload: message.payload.clone(),
            attempt: message.attempt,
        };
        self.client.forward(&request).await
    }

    async fn handle_failure(&self, message: PendingMessage, error: DeliveryError) -> DeliveryOutcome {
        if self.target.is_wake_capable() {
            self.request_wake();
        }

        match self.ladder.decide(message.attempt) {
            Escalation::Retry { next_attempt } => {
                warn!(
                    delivery_tag = %message.delivery_tag,
                    attempt = message.attempt,
                    next_attempt,
                    retry_delay_s = self.topology.retry_delay().as_secs(),
                    reason = %error,
                    "delivery failed, scheduling retry"
                );
                self.republish_then_ack(
                    message.delivery_tag,
                    message.raw_body,
                    self.topology.retry(),
                    next_attempt,
                    DeliveryOutcome::RetryScheduled { next_attempt },
                )
                .await
            },
            Escalation::DeadLetter { attempt } => {
                error!(
                    delivery_tag = %message.delivery_tag,
                    attempt,
                    max_attempts = self.ladder.max_attempts(),
                    reason = %error,
                    "delivery failed, attempts exhausted, moving to failed queue"
                );
                self.republish_then_ack(
                    message.delivery_tag,
                    message.raw_body,
                    self.topology.failed(),
                    attempt,
                    DeliveryOutcome::DeadLettered { attempt },
                )
                .await
            },
        }
    }

    fn request_wake(&self) {
        let Some(wake) = self.wake.clone() else {
            return;
        };
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            wake.trigger(&cancel).await;
        });
    }

    async fn republish_then_ack(
        &self,
        delivery_tag: DeliveryTag,
        body: Bytes,
        queue: &str,
        attempt: u32,
        outcome: DeliveryOutcome,
    ) -> DeliveryOutcome {
        if let Err(publish_error) = self.channel.publish(queue, body, attempt).await {
            error!(
                delivery_tag = %delivery_tag,
                queue,
                error = %publish_error,
                "republish failed, dropping message"
            );
            return match self.channel.nack(delivery_tag).await {
                Ok(()) => DeliveryOutcome::Dropped,
                Err(nack_error) => {
                    error!(delivery_tag = %delivery_tag, error = %nack_error, "nack failed");
                    DeliveryOutcome::Unresolved
                },
            };
        }

        self.ack(delivery_tag, outcome).await
    }

    async fn ack(&self, delivery_tag: DeliveryTag, outcome: DeliveryOutcome) -> DeliveryOutcome {
        match self.channel.ack(delivery_tag).await {
            Ok(()) => outcome,
            Err(error) => {
                error!(delivery_tag = %delivery_tag, error = %error, "ack failed");
                DeliveryOutcome::Unresolved
            },
        }
    }
}
