//! Broker side of the relay forwarder.
//!
//! Defines the channel abstraction the pipeline is written against, the
//! `lapin` implementation used in production, an in-memory implementation for
//! tests, and the topology manager that turns a bare connection into a ready
//! session with the primary, retry and failed queues in place.
//!
//! # Topology
//!
//! ```text
//!   publisher ──► <base> ──► relay ──► REST API
//!                  ▲           │
//!                  │ TTL       ├─ failure, attempts left ──► <base>.retry
//!                  └───────────┘
//!                              └─ malformed or exhausted ──► <base>.failed (24h)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod amqp;
pub mod channel;
pub mod error;
pub mod mock;
pub mod topology;

pub use amqp::{AmqpConnector, AmqpSettings};
pub use channel::{BrokerChannel, BrokerConnector, DeliveryStream, InboundDelivery};
pub use error::{BrokerError, Result};
pub use topology::{QueueTopology, TopologyManager, RECONNECT_BACKOFF};
