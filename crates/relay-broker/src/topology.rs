//! Queue topology and the connect-declare-verify readiness loop.
//!
//! Three durable queues make up the topology:
//!
//! - `<base>`: the primary queue, no arguments.
//! - `<base>.retry`: holds a failed message for the retry delay, then
//!   dead-letters it through the default exchange back to `<base>`.
//! - `<base>.failed`: terminal parking queue, messages expire after 24 hours.
//!
//! [`TopologyManager::ensure_ready`] keeps trying until every queue is
//! declared and passively verified, backing off between attempts. It only
//! gives up when shutdown is requested.

use std::{sync::Arc, time::Duration};

use relay_core::Clock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    channel::{BrokerChannel, BrokerConnector},
    error::{BrokerError, Result},
};

/// Delay between consecutive readiness failures, indexed by failure count.
/// The last entry repeats.
pub const RECONNECT_BACKOFF: [Duration; 4] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(5),
    Duration::from_secs(10),
];

/// Time a message may sit in the failed queue.
pub const FAILED_MESSAGE_TTL: Duration = Duration::from_secs(86_400);

/// Returns the wait after the given number of consecutive failures.
pub fn backoff_delay(failures: usize) -> Duration {
    RECONNECT_BACKOFF[failures.min(RECONNECT_BACKOFF.len() - 1)]
}

/// Where an expired message is re-routed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetterTarget {
    /// Exchange name; empty for the default exchange.
    pub exchange: String,
    /// Routing key, which on the default exchange is the queue name.
    pub routing_key: String,
}

/// Durable queue declaration with its optional arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    /// Queue name.
    pub name: String,
    /// `x-dead-letter-exchange` and `x-dead-letter-routing-key`.
    pub dead_letter: Option<DeadLetterTarget>,
    /// `x-message-ttl`.
    pub message_ttl: Option<Duration>,
}

/// Names and arguments of the primary, retry and failed queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueTopology {
    primary: String,
    retry: String,
    failed: String,
    retry_delay: Duration,
}

impl QueueTopology {
    /// Derives the three queue names from a base name.
    pub fn new(base: impl Into<String>, retry_delay: Duration) -> Self {
        let primary = base.into();
        Self {
            retry: format!("{primary}.retry"),
            failed: format!("{primary}.failed"),
            primary,
            retry_delay,
        }
    }

    /// Primary queue consumed by the dispatcher.
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Delay queue feeding back into the primary queue.
    pub fn retry(&self) -> &str {
        &self.retry
    }

    /// Terminal queue for malformed or exhausted messages.
    pub fn failed(&self) -> &str {
        &self.failed
    }

    /// Time a message waits in the retry queue.
    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Declarations for all three queues, primary first.
    pub fn declarations(&self) -> [QueueDeclaration; 3] {
        [
            QueueDeclaration { name: self.primary.clone(), dead_letter: None, message_ttl: None },
            QueueDeclaration {
                name: self.retry.clone(),
                dead_letter: Some(DeadLetterTarget {
                    exchange: String::new(),
                    routing_key: self.primary.clone(),
                }),
                message_ttl: Some(self.retry_delay),
            },
            QueueDeclaration {
                name: self.failed.clone(),
                dead_letter: None,
                message_ttl: Some(FAILED_MESSAGE_TTL),
            },
        ]
    }
}

/// Establishes a ready broker session.
pub struct TopologyManager {
    connector: Arc<dyn BrokerConnector>,
    topology: QueueTopology,
    clock: Arc<dyn Clock>,
}

impl TopologyManager {
    /// Creates a manager for the given topology.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        topology: QueueTopology,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { connector, topology, clock }
    }

    /// Queue topology this manager declares.
    pub fn topology(&self) -> &QueueTopology {
        &self.topology
    }

    /// Returns a channel on which all three queues exist.
    ///
    /// Retries forever with [`RECONNECT_BACKOFF`] between failures.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Cancelled` once `cancel` fires, whether during
    /// an attempt or during the wait between attempts.
    pub async fn ensure_ready(&self, cancel: &CancellationToken) -> Result<Arc<dyn BrokerChannel>> {
        let mut failures = 0usize;

        loop {
            if cancel.is_cancelled() {
                return Err(BrokerError::Cancelled);
            }

            let attempt = tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BrokerError::Cancelled),
                result = self.establish() => result,
            };

            let error = match attempt {
                Ok(channel) => {
                    info!(
                        primary = %self.topology.primary,
                        retry = %self.topology.retry,
                        failed = %self.topology.failed,
                        "broker topology ready"
                    );
                    return Ok(channel);
                },
                Err(error) => error,
            };

            let delay = backoff_delay(failures);
            failures += 1;
            warn!(
                attempt = failures,
                retry_in_ms = delay.as_millis() as u64,
                error = %error,
                "broker not ready, retrying"
            );

            tokio::select! {
                biased;
                () = cancel.cancelled() => return Err(BrokerError::Cancelled),
                () = self.clock.sleep(delay) => {},
            }
        }
    }

    async fn establish(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self.connector.connect().await?;

        if let Err(error) = self.declare_all(channel.as_ref()).await {
            if let Err(close_error) = channel.close().await {
                debug!(error = %close_error, "failed to close partial broker session");
            }
            return Err(error);
        }

        Ok(channel)
    }

    async fn declare_all(&self, channel: &dyn BrokerChannel) -> Result<()> {
        let declarations = self.topology.declarations();

        for declaration in &declarations {
            channel.declare_queue(declaration).await?;
        }
        for declaration in &declarations {
            channel.verify_queue(&declaration.name).await?;
        }

        Ok(())
    }
}
