//! Session supervision: connect, consume, tear down, reconnect.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use relay_broker::{AmqpConnector, BrokerChannel, BrokerConnector, TopologyManager};
use relay_core::{Clock, RealClock};
use relay_delivery::{ForwardClient, WakeCoordinator};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    config::Config,
    consumer::{ConsumerSession, DispatchSettings, SessionEnd},
};

/// Long-running forwarder.
///
/// Each session gets its own channel, executor and debounce workers. When a
/// session ends for any reason other than shutdown, the service waits the
/// network recovery interval and starts a new one.
pub struct ForwarderService {
    manager: TopologyManager,
    settings: DispatchSettings,
    recovery_interval: Duration,
    clock: Arc<dyn Clock>,
}

impl ForwarderService {
    /// Creates a service over any broker connector.
    pub fn new(
        connector: Arc<dyn BrokerConnector>,
        settings: DispatchSettings,
        recovery_interval: Duration,
    ) -> Self {
        let clock = settings.clock.clone();
        let manager = TopologyManager::new(connector, settings.topology.clone(), clock.clone());
        Self { manager, settings, recovery_interval, clock }
    }

    /// Builds the production service: AMQP connector, pooled HTTP client and,
    /// for a Codespace backend, the wake coordinator.
    pub fn from_config(config: &Config) -> Result<Self> {
        let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
        let target = config.api_target();

        let client =
            ForwardClient::new(config.to_client_config()).context("Failed to build HTTP client")?;

        let wake = match (target.is_wake_capable(), config.to_wake_settings()) {
            (true, Some(wake_settings)) => Some(Arc::new(
                WakeCoordinator::new(wake_settings, clock.clone())
                    .context("Failed to build wake coordinator")?,
            )),
            (true, None) => {
                warn!(target_name = %target, "no codespace start_url configured, backend will not be woken");
                None
            },
            (false, _) => None,
        };

        let settings = DispatchSettings {
            client,
            target,
            topology: config.to_queue_topology(),
            ladder: config.to_retry_ladder(),
            debounce_window: config.debounce_window(),
            wake,
            clock,
        };

        let connector = Arc::new(AmqpConnector::new(config.to_amqp_settings()));
        Ok(Self::new(connector, settings, config.network_recovery_interval()))
    }

    /// Runs sessions until `cancel` fires.
    pub async fn run(&self, cancel: CancellationToken) {
        let topology = self.manager.topology();
        info!(
            queue = topology.primary(),
            retry_queue = topology.retry(),
            failed_queue = topology.failed(),
            target_name = %self.settings.target,
            base_url = self.settings.target.base_url(),
            max_attempts = self.settings.ladder.max_attempts(),
            retry_delay_s = topology.retry_delay().as_secs(),
            debounce_window_ms = self.settings.debounce_window.as_millis() as u64,
            "forwarder starting"
        );

        loop {
            let channel = match self.manager.ensure_ready(&cancel).await {
                Ok(channel) => channel,
                Err(error) => {
                    debug!(error = %error, "stopped before broker became ready");
                    break;
                },
            };

            let end = self.run_session(channel, &cancel).await;
            if cancel.is_cancelled() {
                break;
            }

            warn!(
                reason = %end,
                retry_in_s = self.recovery_interval.as_secs(),
                "broker session lost, reconnecting"
            );
            tokio::select! {
                biased;
                () = cancel.cancelled() => break,
                () = self.clock.sleep(self.recovery_interval) => {},
            }
        }

        info!("forwarder stopped");
    }

    async fn run_session(
        &self,
        channel: Arc<dyn BrokerChannel>,
        cancel: &CancellationToken,
    ) -> SessionEnd {
        let queue = self.manager.topology().primary();

        let end = match channel.consume(queue).await {
            Ok(deliveries) => {
                let session =
                    ConsumerSession::start(channel.clone(), &self.settings, cancel.child_token());
                info!(queue, "consuming");
                let end = session.run(deliveries).await;
                session.shutdown().await;
                end
            },
            Err(error) => SessionEnd::Failed(error),
        };

        if let Err(error) = channel.close().await {
            debug!(error = %error, "error closing broker session");
        }

        end
    }
}
