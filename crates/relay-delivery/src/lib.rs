//! Outbound side of the relay forwarder.
//!
//! Turns pending messages into HTTP calls against the configured REST
//! backend and settles each delivery on the broker exactly once.
//!
//! # Components
//!
//! - [`client::ForwardClient`]: JSON `PUT`/`POST` with timeout and status
//!   classification
//! - [`executor::DeliveryExecutor`]: forward, then ack, or escalate through
//!   the retry and failed queues via [`retry::RetryLadder`]
//! - [`debounce::DebounceEngine`]: per-class worker that forwards one
//!   representative per quiet window and acks the superseded messages
//! - [`wake::WakeCoordinator`]: single-flight wake-up of a suspended backend,
//!   triggered by failed deliveries

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod client;
pub mod debounce;
pub mod error;
pub mod executor;
pub mod retry;
pub mod wake;

pub use client::{ClientConfig, ForwardClient};
pub use debounce::DebounceEngine;
pub use error::{DeliveryError, Result};
pub use executor::{DeliveryExecutor, DeliveryOutcome};
pub use retry::{Escalation, RetryLadder};
pub use wake::{WakeCoordinator, WakeSettings, WakeState};
