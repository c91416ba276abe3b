//! Single-flight wake-up for a backend that may be suspended.
//!
//! # State machine
//!
//! ```text
//!   Idle ──trigger──► Requested ──call done (any outcome)──► InProgress
//!    ▲                                                          │
//!    └────────────────────── cooldown elapsed ──────────────────┘
//! ```
//!
//! Triggers arriving in any state other than `Idle` are ignored. State and
//! the pending reset task live under one mutex, and arming a new reset task
//! aborts the previous one under that same lock, so at most one reset is ever
//! pending.
//!
//! The coordinator outlives consumer sessions. A caller's cancellation token
//! only interrupts the wake call; the cooldown reset always runs to
//! completion and is aborted only when the coordinator is dropped.

use std::{fmt, sync::Arc, time::Duration};

use relay_core::{Clock, SecretCipher};
use serde_json::json;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    client::USER_AGENT,
    error::{DeliveryError, Result},
};

/// Placeholder in the start URL replaced with the backend name.
pub const NAME_PLACEHOLDER: &str = "{codespace}";

const ACCEPT: &str = "application/vnd.github.v3+json";

/// Wake cycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WakeState {
    /// No wake call outstanding.
    Idle,
    /// Wake call in flight.
    Requested,
    /// Wake call finished, cooling down.
    InProgress,
}

impl fmt::Display for WakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Requested => write!(f, "requested"),
            Self::InProgress => write!(f, "in_progress"),
        }
    }
}

/// Where and how to wake the backend.
#[derive(Debug, Clone)]
pub struct WakeSettings {
    /// Start URL, possibly containing [`NAME_PLACEHOLDER`].
    pub start_url: String,
    /// Backend name, plaintext or encrypted.
    pub name: String,
    /// Bearer token, plaintext or encrypted.
    pub token: String,
    /// Passphrase for encrypted name and token.
    pub passphrase: String,
    /// Time after a wake call during which further triggers are ignored.
    pub cooldown: Duration,
    /// Timeout for the wake call itself.
    pub request_timeout: Duration,
}

#[derive(Debug)]
struct WakeInner {
    state: WakeState,
    reset: Option<JoinHandle<()>>,
}

/// Guards wake calls so at most one is made per cooldown period.
pub struct WakeCoordinator {
    settings: WakeSettings,
    cipher: SecretCipher,
    client: reqwest::Client,
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<WakeInner>>,
}

impl WakeCoordinator {
    /// Creates an idle coordinator.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::ConfigurationError` if the HTTP client cannot
    /// be built.
    pub fn new(settings: WakeSettings, clock: Arc<dyn Clock>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| DeliveryError::configuration(format!("failed to build wake client: {e}")))?;

        Ok(Self {
            settings,
            cipher: SecretCipher::new(),
            client,
            clock,
            inner: Arc::new(Mutex::new(WakeInner { state: WakeState::Idle, reset: None })),
        })
    }

    /// Current state.
    pub async fn state(&self) -> WakeState {
        self.inner.lock().await.state
    }

    /// Requests a wake-up unless one is already outstanding or cooling down.
    ///
    /// Returns `true` when this call performed the wake request. Failures of
    /// the request are logged and otherwise ignored. Cancelling `cancel`
    /// abandons the request but still starts the cooldown.
    pub async fn trigger(&self, cancel: &CancellationToken) -> bool {
        {
            let mut inner = self.inner.lock().await;
            if inner.state != WakeState::Idle {
                debug!(state = %inner.state, "wake already requested, skipping");
                return false;
            }
            inner.state = WakeState::Requested;
        }

        let name = self.cipher.decrypt_or_original(&self.settings.name, &self.settings.passphrase);
        let token = self.cipher.decrypt_or_original(&self.settings.token, &self.settings.passphrase);
        let url = expand_start_url(&self.settings.start_url, &name);

        info!(name = %name, "requesting backend wake-up");
        let outcome = tokio::select! {
            biased;
            () = cancel.cancelled() => Err(DeliveryError::network("wake request cancelled")),
            result = self.send(&url, &name, &token) => result,
        };
        match outcome {
            Ok(status) => info!(name = %name, status, "wake request accepted"),
            Err(error) => warn!(name = %name, error = %error, "wake request failed"),
        }

        self.arm_reset().await;
        true
    }

    async fn send(&self, url: &str, name: &str, token: &str) -> Result<u16> {
        let response = self
            .client
            .post(url)
            .bearer_auth(token)
            .header(reqwest::header::ACCEPT, ACCEPT)
            .json(&json!({ "codespace_name": name }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::timeout(self.settings.request_timeout.as_secs())
                } else {
                    DeliveryError::network(e.to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(DeliveryError::http_status(status));
        }
        Ok(status.as_u16())
    }

    async fn arm_reset(&self) {
        let mut inner = self.inner.lock().await;
        inner.state = WakeState::InProgress;

        if let Some(previous) = inner.reset.take() {
            previous.abort();
        }

        let shared = self.inner.clone();
        let clock = self.clock.clone();
        let cooldown = self.settings.cooldown;
        inner.reset = Some(tokio::spawn(async move {
            clock.sleep(cooldown).await;
            let mut inner = shared.lock().await;
            inner.state = WakeState::Idle;
            inner.reset = None;
            debug!("wake cooldown elapsed");
        }));
    }
}

impl Drop for WakeCoordinator {
    fn drop(&mut self) {
        if let Ok(mut inner) = self.inner.try_lock() {
            if let Some(reset) = inner.reset.take() {
                reset.abort();
            }
        }
    }
}

/// Replaces every case-insensitive occurrence of [`NAME_PLACEHOLDER`].
pub fn expand_start_url(template: &str, name: &str) -> String {
    let lowered = template.to_ascii_lowercase();
    let mut expanded = String::with_capacity(template.len() + name.len());
    let mut cursor = 0;

    while let Some(offset) = lowered[cursor..].find(NAME_PLACEHOLDER) {
        let start = cursor + offset;
        expanded.push_str(&template[cursor..start]);
        expanded.push_str(name);
        cursor = start + NAME_PLACEHOLDER.len();
    }
    expanded.push_str(&template[cursor..]);
    expanded
}
