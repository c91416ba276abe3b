//! Core domain model for the relay forwarder.
//!
//! Provides the message types that flow through the pipeline, envelope
//! parsing for inbound broker payloads, the at-rest secret cipher, and the
//! clock abstraction used for deterministic timing in tests. Every other
//! crate in the workspace builds on these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod crypto;
pub mod envelope;
pub mod error;
pub mod models;
pub mod time;

pub use crypto::SecretCipher;
pub use envelope::Envelope;
pub use error::{CryptoError, EnvelopeError};
pub use models::{
    ApiTarget, DeliveryTag, DeviceEventType, ForwardMethod, PendingMessage, ATTEMPT_HEADER,
};
pub use time::{Clock, RealClock, TestClock};
