//! Time-window coalescing for bursts of same-class events.
//!
//! Each engine owns one worker task fed by an unbounded queue. The worker
//! takes the first message as the window's representative and then races the
//! next queued message against the window closing:
//!
//! - an arrival whose event timestamp lies within the window of the
//!   representative's timestamp is merged: the newer of the two stays
//!   representative and the other is acked without delivery
//! - an arrival outside the window is held back as the head of the next cycle
//! - when the window closes the representative is delivered
//!
//! Windows are measured on event timestamps, not arrival order. The wait is
//! measured on the wall clock against `timestamp + window` and never exceeds
//! one window, so a device clock running ahead cannot hold a message back.
//! A representative without a usable timestamp is superseded by whatever
//! arrives next.

use std::{panic::AssertUnwindSafe, sync::Arc, time::Duration};

use chrono::{DateTime, TimeDelta, Utc};
use futures_util::FutureExt;
use relay_core::{Clock, PendingMessage};
use tokio::{
    sync::mpsc::{self, UnboundedReceiver, UnboundedSender},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    error::{DeliveryError, Result},
    executor::DeliveryExecutor,
};

/// Handle to a running debounce worker.
pub struct DebounceEngine {
    name: &'static str,
    sender: UnboundedSender<PendingMessage>,
    worker: JoinHandle<()>,
}

impl DebounceEngine {
    /// Starts a worker forwarding through `executor`.
    pub fn spawn(
        name: &'static str,
        window: Duration,
        executor: Arc<DeliveryExecutor>,
        clock: Arc<dyn Clock>,
        cancel: CancellationToken,
    ) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        let worker = DebounceWorker { name, window, receiver, executor, clock, cancel, stash: None };
        let worker = tokio::spawn(worker.run());
        Self { name, sender, worker }
    }

    /// Engine name used in logs.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Queues a message without waiting for its delivery.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::WorkerStopped` after shutdown; the message is
    /// then left unacknowledged.
    pub fn enqueue(&self, message: PendingMessage) -> Result<()> {
        let timestamp = message.event_timestamp;
        self.sender
            .send(message)
            .map_err(|_| DeliveryError::WorkerStopped { engine: self.name })?;
        info!(engine = self.name, event_time = %timestamp, "queued for debounce");
        Ok(())
    }

    /// Waits for the worker to exit. Cancel its token first.
    pub async fn join(self) {
        drop(self.sender);
        if let Err(error) = self.worker.await {
            error!(engine = self.name, error = %error, "debounce worker panicked");
        }
    }
}

struct DebounceWorker {
    name: &'static str,
    window: Duration,
    receiver: UnboundedReceiver<PendingMessage>,
    executor: Arc<DeliveryExecutor>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
    stash: Option<PendingMessage>,
}

impl DebounceWorker {
    async fn run(mut self) {
        debug!(engine = self.name, window_ms = self.window.as_millis() as u64, "debounce worker started");

        loop {
            let head = match self.stash.take() {
                Some(message) => message,
                None => {
                    tokio::select! {
                        biased;
                        () = self.cancel.cancelled() => break,
                        next = self.receiver.recv() => match next {
                            Some(message) => message,
                            None => break,
                        },
                    }
                },
            };

            let Some(representative) = self.close_window(head).await else {
                break;
            };
            self.forward(representative).await;
        }

        debug!(engine = self.name, "debounce worker stopped");
    }

    /// Merges arrivals into `representative` until its window closes.
    /// Returns `None` on shutdown.
    async fn close_window(&mut self, mut representative: PendingMessage) -> Option<PendingMessage> {
        loop {
            let remaining = self.remaining(&representative);

            tokio::select! {
                biased;
                () = self.cancel.cancelled() => return None,
                next = self.receiver.recv() => {
                    let Some(next) = next else {
                        return Some(representative);
                    };
                    if !self.supersedes(&representative, &next) {
                        self.stash = Some(next);
                        return Some(representative);
                    }
                    // Keep the newest state; arrival order is not event order.
                    let (keep, discard) = if next.event_timestamp >= representative.event_timestamp {
                        (next, representative)
                    } else {
                        (representative, next)
                    };
                    debug!(
                        engine = self.name,
                        kept = %keep.event_timestamp,
                        discarded = %discard.event_timestamp,
                        "coalesced"
                    );
                    self.executor.discard(discard.delivery_tag).await;
                    representative = keep;
                },
                () = self.clock.sleep(remaining) => return Some(representative),
            }
        }
    }

    /// Wall-clock time until `representative`'s window ends, at most one
    /// window.
    fn remaining(&self, representative: &PendingMessage) -> Duration {
        let window = TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX);
        let window_end = representative
            .event_timestamp
            .checked_add_signed(window)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        (window_end - self.clock.now_utc()).to_std().unwrap_or(Duration::ZERO).min(self.window)
    }

    fn supersedes(&self, representative: &PendingMessage, next: &PendingMessage) -> bool {
        if representative.event_timestamp == DateTime::<Utc>::MIN_UTC {
            return true;
        }
        let window = TimeDelta::from_std(self.window).unwrap_or(TimeDelta::MAX);
        let gap = next.event_timestamp - representative.event_timestamp;
        gap <= window && gap >= -window
    }

    async fn forward(&self, representative: PendingMessage) {
        let delivery_tag = representative.delivery_tag;
        let delivery = AssertUnwindSafe(self.executor.deliver(representative)).catch_unwind().await;

        if delivery.is_err() {
            error!(engine = self.name, delivery_tag = %delivery_tag, "delivery panicked, discarding message");
            self.executor.discard(delivery_tag).await;
        }
    }
}
