//! Supervisor - the periodic driver loop
//!
//! Owns the tick timer and the shutdown decision. Each tick asks the simulator
//! for a reading and offers it to the MQTT session exactly once.
//!
//! ```text
//!            ┌──────── shutdown signal ────────┐
//!            │                                 ▼
//! ticker ──► tick() ──► SimulatorHandle    drain: cancel token,
//!            │          MqttSession        DISCONNECT, join tasks
//!            └─ fatal error (classified) ──────┘
//! ```
//!
//! A tick body is never interrupted: the shutdown signal is only observed
//! between ticks, so an in-flight publish finishes (bounded by the publish
//! timeout) before the session closes.

use std::future::Future;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ThermostatConfig;
use crate::error::{Severity, ThermostatError};
use crate::mqtt::message_manager::SystemStatus;
use crate::mqtt::mqtt_handler::{
    ConnectionState, MqttSession, PublishOutcome, Running, SessionError, SessionStats,
};
use crate::simulator::{DriftSource, RandomDrift, Simulator, SimulatorHandle, SimulatorTick};

const FATAL_CHANNEL_CAPACITY: usize = 4;

pub struct Supervisor {
    config: ThermostatConfig,
}

impl Supervisor {
    pub fn new(config: ThermostatConfig) -> Self {
        Self { config }
    }

    /// Runs until `shutdown_signal` completes or a fatal error occurs.
    ///
    /// Returns the final session statistics after a clean shutdown, or the
    /// fatal error that caused it.
    pub async fn run<F>(self, shutdown_signal: F) -> Result<SessionStats, ThermostatError>
    where
        F: Future<Output = ()>,
    {
        let simulator = Simulator::new(self.config.simulation.clone(), RandomDrift::from_os_rng());
        self.run_with(simulator, shutdown_signal).await
    }

    pub async fn run_with<D, F>(
        self,
        simulator: Simulator<D>,
        shutdown_signal: F,
    ) -> Result<SessionStats, ThermostatError>
    where
        D: DriftSource + 'static,
        F: Future<Output = ()>,
    {
        let shutdown_timeout = Duration::from_secs(self.config.runtime.shutdown_timeout_secs);
        let cancel_token = CancellationToken::new();

        let (simulator, simulator_task) = SimulatorHandle::spawn(simulator);
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<SessionError>(FATAL_CHANNEL_CAPACITY);
        let mut session = MqttSession::configure(
            self.config.mqtt.clone(),
            simulator.clone(),
            cancel_token.clone(),
        )
        .start(fatal_tx);

        let tick_period = Duration::from_secs(self.config.simulation.interval_secs);
        let mut ticker = tokio::time::interval_at(Instant::now() + tick_period, tick_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let stats_period = Duration::from_secs(self.config.runtime.stats_interval_secs);
        let mut stats_ticker = tokio::time::interval_at(Instant::now() + stats_period, stats_period);

        let mut state_rx = session.subscribe_state();
        let mut awaiting_first_connection = true;

        tokio::pin!(shutdown_signal);
        info!(interval = ?tick_period, "Starting temperature simulation");

        let mut result = loop {
            tokio::select! {
                _ = &mut shutdown_signal => {
                    info!("Simulation stopped by user");
                    break Ok(());
                }
                Some(error) = fatal_rx.recv() => {
                    error!("Fatal session error: {}", error);
                    break Err(ThermostatError::from(error));
                }
                Ok(()) = state_rx.changed(), if awaiting_first_connection => {
                    // First reading goes out as soon as the broker accepts us
                    if *state_rx.borrow_and_update() == ConnectionState::Connected {
                        awaiting_first_connection = false;
                        ticker.reset_immediately();
                    }
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.tick(&mut session, &simulator).await {
                        match e.severity() {
                            Severity::Fatal => {
                                error!("Fatal error during tick: {}", e);
                                break Err(e);
                            }
                            Severity::Recoverable => warn!("Tick failed: {}", e),
                        }
                    }
                }
                _ = stats_ticker.tick() => self.log_stats(&session),
            }
        };

        cancel_token.cancel();
        let mut closed = session.shutdown(shutdown_timeout).await;
        if let Some(failure) = closed.take_driver_failure() {
            if result.is_ok() {
                result = Err(failure.into());
            }
        }
        let stats = closed.final_stats();
        info!(
            published = stats.readings_published,
            failed = stats.publish_failures,
            heater_commands = stats.heater_commands,
            reconnects = stats.reconnects,
            "Final session stats"
        );

        // The actor stops once the last handle is gone
        drop(closed);
        drop(simulator);
        if tokio::time::timeout(shutdown_timeout, simulator_task)
            .await
            .is_err()
        {
            warn!("Simulator task did not stop within {:?}", shutdown_timeout);
        }

        info!("Shutdown complete");
        result.map(|()| stats)
    }

    async fn tick(
        &self,
        session: &mut MqttSession<Running>,
        simulator: &SimulatorHandle,
    ) -> Result<(), ThermostatError> {
        if let Some(failure) = session.driver_exit().await {
            return Err(failure.into());
        }

        let SimulatorTick { reading, state } = simulator.tick().await?;
        let heater = if state.heater_on { "ON" } else { "OFF" };

        match session.publish(&reading).await {
            PublishOutcome::Delivered => info!(
                temperature = reading.temperature,
                heater,
                "Published: {:.2}°C (Heater: {})",
                reading.temperature,
                heater
            ),
            PublishOutcome::Failed(reason) => {
                error!(
                    temperature = reading.temperature,
                    heater,
                    "Publish failed: {}",
                    reason
                );
                return Ok(());
            }
        }

        if self.config.mqtt.publish_status {
            let status = SystemStatus::new(&reading, state.heater_on);
            match session.publish_status(&status).await {
                PublishOutcome::Delivered => debug!("Published system status"),
                PublishOutcome::Failed(reason) => warn!("Status publish failed: {}", reason),
            }
        }
        Ok(())
    }

    fn log_stats(&self, session: &MqttSession<Running>) {
        let stats = session.stats();
        info!(
            state = %session.connection_state(),
            published = stats.readings_published,
            failed = stats.publish_failures,
            statuses = stats.statuses_published,
            heater_commands = stats.heater_commands,
            malformed = stats.malformed_messages,
            reconnects = stats.reconnects,
            last_activity = ?stats.last_activity,
            "Session stats"
        );
    }
}
