//! Broker abstraction used by the forwarding pipeline.
//!
//! The pipeline never talks to an AMQP client directly. It works against
//! `BrokerConnector` and `BrokerChannel` so that the topology, dispatch and
//! delivery logic can be exercised against the in-memory implementation in
//! [`crate::mock`]. The production implementation lives in [`crate::amqp`].

use std::{future::Future, pin::Pin, sync::Arc};

use bytes::Bytes;
use futures_util::Stream;
use relay_core::DeliveryTag;

use crate::{error::Result, topology::QueueDeclaration};

/// One message received from the primary queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundDelivery {
    /// Handle for ack and nack on the channel that produced it.
    pub delivery_tag: DeliveryTag,
    /// Body exactly as received.
    pub body: Bytes,
    /// Attempt number read from the `x-attempt` header.
    pub attempt: u32,
}

/// Stream of deliveries from a subscription. Ends when the channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<InboundDelivery>> + Send>>;

/// Opens sessions against the broker.
pub trait BrokerConnector: Send + Sync + 'static {
    /// Opens a connection and a channel on it.
    fn connect(&self) -> Pin<Box<dyn Future<Output = Result<Arc<dyn BrokerChannel>>> + Send + '_>>;
}

/// An open channel and the connection that owns it.
///
/// Implementations must be safe to use from several tasks at once; the
/// dispatcher and every debounce worker ack through the same channel.
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declares a durable queue with its arguments.
    fn declare_queue(
        &self,
        declaration: &QueueDeclaration,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Passively declares a queue, failing if it does not exist.
    fn verify_queue(&self, queue: &str) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Starts a manual-ack subscription.
    fn consume(
        &self,
        queue: &str,
    ) -> Pin<Box<dyn Future<Output = Result<DeliveryStream>> + Send + '_>>;

    /// Acknowledges a delivery.
    fn ack(&self, delivery_tag: DeliveryTag) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Negatively acknowledges a delivery without requeue.
    fn nack(
        &self,
        delivery_tag: DeliveryTag,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Publishes a persistent JSON message through the default exchange with
    /// the given attempt number in its `x-attempt` header.
    fn publish(
        &self,
        queue: &str,
        body: Bytes,
        attempt: u32,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;

    /// Closes the channel and its connection.
    fn close(&self) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}
