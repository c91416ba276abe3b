//! In-memory broker for testing the pipeline without RabbitMQ.
//!
//! `MockChannel` records every operation in order, can inject failures per
//! operation, and exposes a delivery feed that tests push messages into.
//! `MockConnector` hands out channels and can fail a scripted number of
//! connection attempts.

use std::{
    collections::{HashSet, VecDeque},
    future::Future,
    pin::Pin,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use relay_core::DeliveryTag;
use tokio::sync::{mpsc, Notify, RwLock};

use crate::{
    channel::{BrokerChannel, BrokerConnector, DeliveryStream, InboundDelivery},
    error::{BrokerError, Result},
    topology::QueueDeclaration,
};

/// Operation recorded by [`MockChannel`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelOp {
    /// Queue declared.
    Declared(QueueDeclaration),
    /// Queue passively verified.
    Verified(String),
    /// Subscription started.
    Consumed(String),
    /// Delivery acknowledged.
    Ack(DeliveryTag),
    /// Delivery rejected without requeue.
    Nack(DeliveryTag),
    /// Message published.
    Published(PublishedMessage),
    /// Channel closed.
    Closed,
}

/// Message captured by [`MockChannel::publish`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    /// Destination queue.
    pub queue: String,
    /// Body as published.
    pub body: Bytes,
    /// Value of the `x-attempt` header.
    pub attempt: u32,
}

#[derive(Debug, Default)]
struct Failures {
    declare: Option<String>,
    missing_queues: HashSet<String>,
    consume: Option<String>,
    publish_to: HashSet<String>,
    acknowledge: bool,
}

type Feed = mpsc::UnboundedSender<Result<InboundDelivery>>;
type FeedReceiver = mpsc::UnboundedReceiver<Result<InboundDelivery>>;

/// In-memory channel recording every operation.
pub struct MockChannel {
    ops: Arc<RwLock<Vec<ChannelOp>>>,
    failures: Arc<RwLock<Failures>>,
    changed: Arc<Notify>,
    feed: Mutex<Option<Feed>>,
    receiver: Mutex<Option<FeedReceiver>>,
}

impl MockChannel {
    /// Creates a channel with an open delivery feed.
    pub fn new() -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        Self {
            ops: Arc::new(RwLock::new(Vec::new())),
            failures: Arc::new(RwLock::new(Failures::default())),
            changed: Arc::new(Notify::new()),
            feed: Mutex::new(Some(sender)),
            receiver: Mutex::new(Some(receiver)),
        }
    }

    /// Queues a delivery for the subscriber.
    pub fn push_delivery(&self, delivery_tag: u64, body: impl Into<Bytes>, attempt: u32) {
        self.push(Ok(InboundDelivery {
            delivery_tag: DeliveryTag(delivery_tag),
            body: body.into(),
            attempt,
        }));
    }

    /// Queues a stream error for the subscriber.
    pub fn push_error(&self, error: BrokerError) {
        self.push(Err(error));
    }

    /// Ends the delivery stream, as when the broker drops the connection.
    pub fn end_stream(&self) {
        if let Ok(mut feed) = self.feed.lock() {
            feed.take();
        }
    }

    fn push(&self, item: Result<InboundDelivery>) {
        if let Ok(feed) = self.feed.lock() {
            if let Some(sender) = feed.as_ref() {
                let _ = sender.send(item);
            }
        }
    }

    /// Fails every queue declaration with the given message.
    pub async fn fail_declare(&self, message: impl Into<String>) {
        self.failures.write().await.declare = Some(message.into());
    }

    /// Makes passive verification of a queue fail.
    pub async fn hide_queue(&self, queue: impl Into<String>) {
        self.failures.write().await.missing_queues.insert(queue.into());
    }

    /// Fails the next subscription attempt.
    pub async fn fail_consume(&self, message: impl Into<String>) {
        self.failures.write().await.consume = Some(message.into());
    }

    /// Fails every publish to the given queue.
    pub async fn fail_publish_to(&self, queue: impl Into<String>) {
        self.failures.write().await.publish_to.insert(queue.into());
    }

    /// Fails every ack and nack.
    pub async fn fail_acknowledge(&self) {
        self.failures.write().await.acknowledge = true;
    }

    /// Every recorded operation in order.
    pub async fn ops(&self) -> Vec<ChannelOp> {
        self.ops.read().await.clone()
    }

    /// Acknowledged delivery tags in order.
    pub async fn acked(&self) -> Vec<DeliveryTag> {
        self.ops
            .read()
            .await
            .iter()
            .filter_map(|op| match op {
                ChannelOp::Ack(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    /// Rejected delivery tags in order.
    pub async fn nacked(&self) -> Vec<DeliveryTag> {
        self.ops
            .read()
            .await
            .iter()
            .filter_map(|op| match op {
                ChannelOp::Nack(tag) => Some(*tag),
                _ => None,
            })
            .collect()
    }

    /// Published messages in order.
    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.ops
            .read()
            .await
            .iter()
            .filter_map(|op| match op {
                ChannelOp::Published(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Number of acks plus nacks recorded so far.
    pub async fn resolved_count(&self) -> usize {
        self.ops
            .read()
            .await
            .iter()
            .filter(|op| matches!(op, ChannelOp::Ack(_) | ChannelOp::Nack(_)))
            .count()
    }

    /// Whether the channel has been closed.
    pub async fn is_closed(&self) -> bool {
        self.ops.read().await.contains(&ChannelOp::Closed)
    }

    /// Waits until `count` deliveries have been acked or nacked.
    pub async fn wait_for_resolved(&self, count: usize) {
        loop {
            let notified = self.changed.notified();
            if self.resolved_count().await >= count {
                return;
            }
            notified.await;
        }
    }

    /// Waits until the recorded operations satisfy the predicate.
    pub async fn wait_until<F>(&self, predicate: F)
    where
        F: Fn(&[ChannelOp]) -> bool,
    {
        loop {
            let notified = self.changed.notified();
            if predicate(&self.ops.read().await) {
                return;
            }
            notified.await;
        }
    }

    async fn record(&self, op: ChannelOp) {
        self.ops.write().await.push(op);
        self.changed.notify_waiters();
    }
}

impl Default for MockChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerChannel for MockChannel {
    fn declare_queue(
        &self,
        declaration: &QueueDeclaration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let declaration = declaration.clone();
        Box::pin(async move {
            if let Some(message) = self.failures.read().await.declare.clone() {
                return Err(BrokerError::declare(declaration.name, message));
            }
            self.record(ChannelOp::Declared(declaration)).await;
            Ok(())
        })
    }

    fn verify_queue(&self, queue: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            if self.failures.read().await.missing_queues.contains(&queue) {
                return Err(BrokerError::QueueMissing { queue });
            }
            self.record(ChannelOp::Verified(queue)).await;
            Ok(())
        })
    }

    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            if let Some(message) = self.failures.write().await.consume.take() {
                return Err(BrokerError::Consume { queue, message });
            }

            let receiver = self.receiver.lock().ok().and_then(|mut receiver| receiver.take());
            let Some(receiver) = receiver else {
                return Err(BrokerError::Consume {
                    queue,
                    message: "mock channel already has a subscriber".to_string(),
                });
            };

            self.record(ChannelOp::Consumed(queue)).await;

            let deliveries = stream::unfold(receiver, |mut receiver| async move {
                receiver.recv().await.map(|item| (item, receiver))
            });
            Ok(deliveries.boxed())
        })
    }

    fn ack(&self, delivery_tag: DeliveryTag) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.failures.read().await.acknowledge {
                return Err(BrokerError::acknowledge(delivery_tag.0, "injected ack failure"));
            }
            self.record(ChannelOp::Ack(delivery_tag)).await;
            Ok(())
        })
    }

    fn nack(
        &self,
        delivery_tag: DeliveryTag,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            if self.failures.read().await.acknowledge {
                return Err(BrokerError::acknowledge(delivery_tag.0, "injected nack failure"));
            }
            self.record(ChannelOp::Nack(delivery_tag)).await;
            Ok(())
        })
    }

    fn publish(
        &self,
        queue: &str,
        body: Bytes,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let queue = queue.to_string();
        Box::pin(async move {
            if self.failures.read().await.publish_to.contains(&queue) {
                return Err(BrokerError::publish(queue, "injected publish failure"));
            }
            self.record(ChannelOp::Published(PublishedMessage { queue, body, attempt })).await;
            Ok(())
        })
    }

    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.end_stream();
            self.record(ChannelOp::Closed).await;
            Ok(())
        })
    }
}

/// Connector handing out [`MockChannel`]s in order.
///
/// Once the scripted channels run out, the last one is handed out again.
pub struct MockConnector {
    channels: Mutex<VecDeque<Arc<MockChannel>>>,
    last: Mutex<Option<Arc<MockChannel>>>,
    failures_remaining: AtomicUsize,
    attempts: AtomicUsize,
}

impl MockConnector {
    /// Creates a connector that always returns the given channel.
    pub fn new(channel: Arc<MockChannel>) -> Self {
        Self::with_channels(vec![channel])
    }

    /// Creates a connector returning each channel once, in order.
    pub fn with_channels(channels: Vec<Arc<MockChannel>>) -> Self {
        Self {
            channels: Mutex::new(channels.into()),
            last: Mutex::new(None),
            failures_remaining: AtomicUsize::new(0),
            attempts: AtomicUsize::new(0),
        }
    }

    /// Fails the next `count` connection attempts.
    pub fn fail_next(&self, count: usize) {
        self.failures_remaining.store(count, Ordering::SeqCst);
    }

    /// Total connection attempts, failed ones included.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    fn next_channel(&self) -> Option<Arc<MockChannel>> {
        let next = self.channels.lock().ok()?.pop_front();
        let mut last = self.last.lock().ok()?;
        if let Some(channel) = next {
            *last = Some(channel);
        }
        last.clone()
    }
}

impl BrokerConnector for MockConnector {
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrokerChannel>>> + Send + '_>> {
        Box::pin(async move {
            self.attempts.fetch_add(1, Ordering::SeqCst);

            let failing = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if failing {
                return Err(BrokerError::connection("connection refused"));
            }

            let channel = self
                .next_channel()
                .ok_or_else(|| BrokerError::connection("no mock channel configured"))?;
            let channel: Arc<dyn BrokerChannel> = channel;
            Ok(channel)
        })
    }
}
