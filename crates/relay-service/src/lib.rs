//! Relay forwarder service.
//!
//! Ties the broker, delivery and configuration layers together:
//!
//! ```text
//!  relay.toml + RELAY_* env ─▶ Config
//!                                │
//!  ForwarderService ── TopologyManager ─▶ channel
//!        │                                   │
//!        └── ConsumerSession ◀── deliveries ─┘
//!              ├─ volume render  ─▶ DebounceEngine ─┐
//!              ├─ volume capture ─▶ DebounceEngine ─┼─▶ DeliveryExecutor ─▶ REST API
//!              └─ everything else ──────────────────┘
//! ```

#![forbid(unsafe_code)]

pub mod config;
pub mod consumer;
pub mod service;

pub use config::Config;
pub use consumer::{ConsumerSession, Dispatch, DispatchSettings, SessionEnd};
pub use service::ForwarderService;
