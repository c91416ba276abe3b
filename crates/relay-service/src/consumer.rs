//! Consumer session: reads the primary queue and routes each delivery.
//!
//! Volume render and capture changes go through their own debounce engine.
//! Every other event class, unknown codes included, is delivered inline.
//! Bodies that do not parse are parked in the failed queue with their
//! attempt count unchanged.

use std::{fmt, sync::Arc, time::Duration};

use futures_util::StreamExt;
use relay_broker::{BrokerChannel, BrokerError, DeliveryStream, InboundDelivery, QueueTopology};
use relay_core::{ApiTarget, Clock, DeviceEventType, Envelope};
use relay_delivery::{
    DebounceEngine, DeliveryExecutor, DeliveryOutcome, ForwardClient, RetryLadder, WakeCoordinator,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const RENDER_ENGINE: &str = "volume_render";
const CAPTURE_ENGINE: &str = "volume_capture";

/// Everything a session needs besides its channel. Built once at startup.
#[derive(Clone)]
pub struct DispatchSettings {
    /// Pooled client shared by every session.
    pub client: ForwardClient,
    /// Backend to forward to.
    pub target: ApiTarget,
    /// Queue names and retry delay.
    pub topology: QueueTopology,
    /// Attempt limit.
    pub ladder: RetryLadder,
    /// Coalescing window for volume change events.
    pub debounce_window: Duration,
    /// Wake-up coordinator, shared across sessions.
    pub wake: Option<Arc<WakeCoordinator>>,
    /// Clock driving debounce windows.
    pub clock: Arc<dyn Clock>,
}

/// What happened to one delivery at the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Delivered inline with the given outcome.
    Inline(DeliveryOutcome),
    /// Handed to a debounce engine; resolved later by its worker.
    Queued {
        /// Engine name
        engine: &'static str,
    },
    /// Body did not parse; parked with the given outcome.
    Malformed(DeliveryOutcome),
    /// Engine already stopped; left unacknowledged for redelivery.
    Stranded,
}

/// Why a session stopped consuming.
#[derive(Debug)]
pub enum SessionEnd {
    /// Shutdown was requested.
    Cancelled,
    /// The broker closed the subscription.
    StreamEnded,
    /// The subscription reported an error.
    Failed(BrokerError),
}

impl fmt::Display for SessionEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::StreamEnded => write!(f, "subscription ended"),
            Self::Failed(error) => write!(f, "subscription failed: {error}"),
        }
    }
}

/// Routes deliveries from one broker channel.
///
/// Delivery tags are scoped to the channel, so the executor and both debounce
/// engines live exactly as long as the session.
pub struct ConsumerSession {
    executor: Arc<DeliveryExecutor>,
    render: DebounceEngine,
    capture: DebounceEngine,
    cancel: CancellationToken,
}

impl ConsumerSession {
    /// Starts the debounce workers for a fresh channel.
    ///
    /// `cancel` stops the workers and interrupts in-flight deliveries.
    pub fn start(
        channel: Arc<dyn BrokerChannel>,
        settings: &DispatchSettings,
        cancel: CancellationToken,
    ) -> Self {
        let mut executor = DeliveryExecutor::new(
            settings.client.clone(),
            channel,
            settings.target.clone(),
            settings.topology.clone(),
            settings.ladder,
            cancel.clone(),
        );
        if let Some(wake) = &settings.wake {
            executor = executor.with_wake(wake.clone());
        }
        let executor = Arc::new(executor);

        let render = DebounceEngine::spawn(
            RENDER_ENGINE,
            settings.debounce_window,
            executor.clone(),
            settings.clock.clone(),
            cancel.clone(),
        );
        let capture = DebounceEngine::spawn(
            CAPTURE_ENGINE,
            settings.debounce_window,
            executor.clone(),
            settings.clock.clone(),
            cancel.clone(),
        );

        Self { executor, render, capture, cancel }
    }

    /// Consumes `deliveries` one at a time until the stream ends, fails, or
    /// the session is cancelled.
    pub async fn run(&self, mut deliveries: DeliveryStream) -> SessionEnd {
        loop {
            let next = tokio::select! {
                biased;
                () = self.cancel.cancelled() => return SessionEnd::Cancelled,
                next = deliveries.next() => next,
            };

            match next {
                Some(Ok(delivery)) => {
                    self.dispatch(delivery).await;
                },
                Some(Err(error)) => {
                    warn!(error = %error, "subscription failed");
                    return SessionEnd::Failed(error);
                },
                None => {
                    info!("subscription ended by broker");
                    return SessionEnd::StreamEnded;
                },
            }
        }
    }

    /// Parses and routes a single delivery.
    pub async fn dispatch(&self, delivery: InboundDelivery) -> Dispatch {
        let InboundDelivery { delivery_tag, body, attempt } = delivery;

        let envelope = match Envelope::parse(&body) {
            Ok(envelope) => envelope,
            Err(parse_error) => {
                let reason = parse_error.to_string();
                return Dispatch::Malformed(
                    self.executor.reject(delivery_tag, body, attempt, &reason).await,
                );
            },
        };

        let message = envelope.into_pending(delivery_tag, body, attempt);
        debug!(
            delivery_tag = %delivery_tag,
            attempt,
            event_type = ?message.event_type,
            "received message"
        );

        let engine = match message.event_type {
            Some(DeviceEventType::VolumeRenderChanged) => &self.render,
            Some(DeviceEventType::VolumeCaptureChanged) => &self.capture,
            _ => return Dispatch::Inline(self.executor.deliver(message).await),
        };

        match engine.enqueue(message) {
            Ok(()) => Dispatch::Queued { engine: engine.name() },
            Err(enqueue_error) => {
                error!(
                    delivery_tag = %delivery_tag,
                    error = %enqueue_error,
                    "debounce engine unavailable, leaving message unacknowledged"
                );
                Dispatch::Stranded
            },
        }
    }

    /// Stops the debounce workers and waits for them to exit.
    ///
    /// Messages still held in a debounce window stay unacknowledged.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        self.render.join().await;
        self.capture.join().await;
    }
}
