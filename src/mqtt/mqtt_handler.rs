//! MQTT session lifecycle and connection state machine
//!
//! # Connection states
//!
//! ```text
//!                 start                 CONNACK
//! Disconnected ──────────► Connecting ──────────► Connected
//!      ▲                    ▲      │                  │
//!      │          backoff   │      │ error            │ unexpected disconnect
//!      │          elapsed   │      ▼                  │
//!      │                   Reconnecting ◄─────────────┘
//!      │                        │
//!      └────── shutdown ────────┘ (from any state)
//! ```
//!
//! Every CONNACK re-subscribes the heater topic because the session is clean.
//! A subscription that cannot be queued stays pending and is retried on the
//! next event. The reconnect delay comes from [`ReconnectBackoff`] and is
//! reset by every successful connection.
//!
//! # Session lifecycle
//!
//! [`MqttSession`] is a statum machine: `Configured ──start──► Running
//! ──shutdown──► Closed`. Only a running session can publish. The rumqttc
//! event loop is driven by a [`ConnectionDriver`] in its own task, so
//! publishing on the tick path and dispatching inbound commands never block
//! each other.
//!
//! On shutdown the driver owns the DISCONNECT: seeing the cancellation token
//! while connected it queues one and polls until it is written, in any other
//! state it stops at once.

use chrono::{DateTime, Utc};
use rumqttc::{
    AsyncClient, ClientError, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop,
    Outgoing, Packet, Publish, QoS, SubAck, SubscribeReasonCode,
};
use statum::{machine, state};
use std::any::Any;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::backoff::ReconnectBackoff;
use super::config::MqttConfig;
use super::message_manager::{
    encode_reading, encode_status, InboundMessage, PayloadError, SystemStatus,
};
use crate::error::Severity;
use crate::simulator::{HeaterCommand, Reading, SimulatorError, SimulatorHandle};

#[derive(Clone, Copy, Default, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Client request failed: {0}")]
    Client(#[from] ClientError),

    #[error("Not connected (state: {0})")]
    NotConnected(ConnectionState),

    #[error("Publish timed out after {0:?}")]
    PublishTimeout(Duration),

    #[error("Malformed payload: {0}")]
    Payload(#[from] PayloadError),

    #[error("Failed to dispatch heater command: {0}")]
    Dispatch(#[from] SimulatorError),

    #[error("MQTT event loop stopped unexpectedly")]
    EventLoopStopped,

    #[error("MQTT event loop task panicked: {0}")]
    EventLoopPanicked(String),
}

impl SessionError {
    pub fn severity(&self) -> Severity {
        match self {
            // Every client handle is gone, nothing can reach the broker anymore
            SessionError::Connection(ConnectionError::RequestsDone) => Severity::Fatal,
            SessionError::EventLoopStopped | SessionError::EventLoopPanicked(_) => Severity::Fatal,
            SessionError::Connection(_)
            | SessionError::Client(_)
            | SessionError::NotConnected(_)
            | SessionError::PublishTimeout(_)
            | SessionError::Payload(_)
            | SessionError::Dispatch(_) => Severity::Recoverable,
        }
    }
}

/// Classifies how the driver task ended when it did not return normally
fn driver_failure(error: JoinError) -> SessionError {
    if error.is_panic() {
        SessionError::EventLoopPanicked(panic_message(error.into_panic()))
    } else {
        SessionError::EventLoopStopped
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    match payload.downcast::<String>() {
        Ok(message) => *message,
        Err(payload) => payload
            .downcast_ref::<&str>()
            .map(|message| message.to_string())
            .unwrap_or_else(|| "unknown panic payload".to_string()),
    }
}

/// Number of topic filters the broker refused in a SUBACK
fn refused_filters(ack: &SubAck) -> usize {
    ack.return_codes
        .iter()
        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
        .count()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Handed to the transport with QoS 1
    Delivered,
    /// Dropped; the next tick supersedes it
    Failed(String),
}

#[derive(Clone, Debug, Default, PartialEq)]
pub struct SessionStats {
    pub readings_published: u64,
    pub publish_failures: u64,
    pub statuses_published: u64,
    pub status_failures: u64,
    pub heater_commands: u64,
    pub malformed_messages: u64,
    pub reconnects: u64,
    pub last_activity: Option<DateTime<Utc>>,
}

type SharedStats = Arc<Mutex<SessionStats>>;

fn lock_stats(stats: &Mutex<SessionStats>) -> MutexGuard<'_, SessionStats> {
    stats.lock().unwrap_or_else(PoisonError::into_inner)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

/// Drives the rumqttc event loop: connection state, backoff, inbound dispatch
struct ConnectionDriver {
    client: AsyncClient,
    heater_topic: String,
    simulator: SimulatorHandle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    stats: SharedStats,
    backoff: ReconnectBackoff,
    cancel_token: CancellationToken,
    has_connected: bool,
    subscribe_pending: bool,
}

impl ConnectionDriver {
    fn new(
        client: AsyncClient,
        config: &MqttConfig,
        simulator: SimulatorHandle,
        state_tx: Arc<watch::Sender<ConnectionState>>,
        stats: SharedStats,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            client,
            heater_topic: config.heater_topic.clone(),
            simulator,
            state_tx,
            stats,
            backoff: ReconnectBackoff::from(&config.reconnect),
            cancel_token,
            has_connected: false,
            subscribe_pending: false,
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            debug!("Connection state {} -> {}", previous, state);
        }
    }

    async fn run(mut self, mut event_loop: EventLoop, fatal_tx: mpsc::Sender<SessionError>) {
        self.set_state(ConnectionState::Connecting);
        let mut disconnect_queued = false;

        loop {
            let polled = tokio::select! {
                polled = event_loop.poll() => polled,
                _ = self.cancel_token.cancelled(), if !disconnect_queued => {
                    if self.on_shutdown_requested() == Flow::Stop {
                        break;
                    }
                    disconnect_queued = true;
                    continue;
                }
            };

            match polled {
                Ok(event) => {
                    if self.handle_event(event).await == Flow::Stop {
                        break;
                    }
                }
                Err(e) => {
                    if self.cancel_token.is_cancelled() {
                        debug!("Connection closed during shutdown: {}", e);
                        break;
                    }
                    match self.on_connection_error(e) {
                        Ok(delay) => {
                            if !self.wait_before_reconnect(delay).await {
                                break;
                            }
                        }
                        Err(fatal) => {
                            error!("Fatal MQTT error: {}", fatal);
                            if fatal_tx.send(fatal).await.is_err() {
                                warn!("Supervisor is gone, fatal MQTT error not reported");
                            }
                            break;
                        }
                    }
                }
            }
        }

        self.set_state(ConnectionState::Disconnected);
        info!("MQTT event loop stopped");
    }

    /// Connected: queue DISCONNECT and keep polling until it is written.
    /// Otherwise there is nothing to flush.
    fn on_shutdown_requested(&self) -> Flow {
        let state = self.state();
        if state != ConnectionState::Connected {
            debug!("Shutdown requested while {}, stopping event loop", state);
            return Flow::Stop;
        }

        match self.client.try_disconnect() {
            Ok(()) => {
                debug!("Shutdown requested, DISCONNECT queued");
                Flow::Continue
            }
            Err(e) => {
                warn!("Failed to queue DISCONNECT, closing without it: {}", e);
                Flow::Stop
            }
        }
    }

    async fn handle_event(&mut self, event: Event) -> Flow {
        if self.subscribe_pending {
            self.queue_subscription();
        }

        match event {
            Event::Incoming(Packet::ConnAck(ack)) => self.on_connack(ack),
            Event::Incoming(Packet::SubAck(ack)) => self.on_suback(ack),
            Event::Incoming(Packet::Publish(publish)) => self.on_publish(publish).await,
            Event::Incoming(Packet::PubAck(ack)) => {
                debug!(pkid = ack.pkid, "Broker acknowledged publish");
            }
            Event::Incoming(Packet::Disconnect) => {
                warn!("Broker sent DISCONNECT");
            }
            Event::Outgoing(Outgoing::Disconnect) => {
                info!("DISCONNECT sent to broker");
                return Flow::Stop;
            }
            Event::Incoming(packet) => debug!("Incoming packet: {:?}", packet),
            Event::Outgoing(outgoing) => debug!("Outgoing packet: {:?}", outgoing),
        }
        Flow::Continue
    }

    fn on_connack(&mut self, ack: ConnAck) {
        if ack.code != ConnectReturnCode::Success {
            warn!("Broker refused connection: {:?}", ack.code);
            return;
        }

        self.backoff.reset();
        self.set_state(ConnectionState::Connected);

        let reconnect = self.has_connected;
        self.has_connected = true;
        {
            let mut stats = lock_stats(&self.stats);
            if reconnect {
                stats.reconnects += 1;
            }
            stats.last_activity = Some(Utc::now());
        }

        if reconnect {
            info!(session_present = ack.session_present, "Reconnected to MQTT broker");
        } else {
            info!(session_present = ack.session_present, "Connected to MQTT broker");
        }

        self.queue_subscription();
    }

    fn queue_subscription(&mut self) {
        match self
            .client
            .try_subscribe(self.heater_topic.as_str(), QoS::AtLeastOnce)
        {
            Ok(()) => {
                self.subscribe_pending = false;
                debug!("Subscription to {} queued", self.heater_topic);
            }
            Err(e) => {
                self.subscribe_pending = true;
                warn!(
                    "Failed to queue subscription to {}, retrying on next event: {}",
                    self.heater_topic, e
                );
            }
        }
    }

    fn on_suback(&self, ack: SubAck) {
        let refused = refused_filters(&ack);
        if refused > 0 {
            warn!(
                topic = %self.heater_topic,
                pkid = ack.pkid,
                "Broker refused heater topic subscription, heater commands will not arrive (return codes: {:?})",
                ack.return_codes
            );
        } else {
            info!(
                topic = %self.heater_topic,
                pkid = ack.pkid,
                "Subscribed to heater topic (return codes: {:?})",
                ack.return_codes
            );
        }
    }

    /// Returns the reconnect delay, or the error itself when it is fatal
    fn on_connection_error(&mut self, error: ConnectionError) -> Result<Duration, SessionError> {
        let error = SessionError::from(error);
        if error.severity() == Severity::Fatal {
            return Err(error);
        }

        let previous = self.state();
        self.set_state(ConnectionState::Reconnecting);
        // The next CONNACK subscribes afresh
        self.subscribe_pending = false;
        let delay = self.backoff.next_delay();

        if previous == ConnectionState::Connected {
            warn!(error = %error, retry_in = ?delay, "Unexpected disconnection, attempting reconnect");
        } else {
            warn!(
                error = %error,
                attempt = self.backoff.failures(),
                retry_in = ?delay,
                "Connection attempt failed"
            );
        }
        Ok(delay)
    }

    /// Sleeps `delay` unless shutdown comes first. `false` means stop.
    async fn wait_before_reconnect(&self, delay: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {
                self.set_state(ConnectionState::Connecting);
                debug!("Reconnecting to MQTT broker");
                true
            }
            _ = self.cancel_token.cancelled() => {
                info!("Shutdown requested, no further reconnect attempts");
                false
            }
        }
    }

    async fn on_publish(&mut self, publish: Publish) {
        let message = InboundMessage::from_publish(&publish);
        if message.topic != self.heater_topic {
            debug!("Ignoring message on unrelated topic: {}", message);
            return;
        }

        match self.dispatch(&message).await {
            Ok(command) => {
                let mut stats = lock_stats(&self.stats);
                stats.heater_commands += 1;
                stats.last_activity = Some(Utc::now());
                debug!("Forwarded heater command {} from {}", command, message.topic);
            }
            Err(e) => {
                if let SessionError::Payload(_) = e {
                    lock_stats(&self.stats).malformed_messages += 1;
                }
                warn!("Dropping inbound message ({}): {}", message, e);
            }
        }
    }

    async fn dispatch(&self, message: &InboundMessage) -> Result<HeaterCommand, SessionError> {
        let command = message.heater_command()?;
        self.simulator.apply_heater_command(command).await?;
        Ok(command)
    }
}

#[state]
#[derive(Debug, Clone)]
pub enum SessionPhase {
    Configured,
    Running,
    Closed,
}

#[machine]
pub struct MqttSession<S: SessionPhase> {
    config: MqttConfig,
    client_id: String,
    client: AsyncClient,
    event_loop: Option<EventLoop>,
    simulator: SimulatorHandle,
    state_tx: Arc<watch::Sender<ConnectionState>>,
    stats: SharedStats,
    cancel_token: CancellationToken,
    event_task: Option<JoinHandle<()>>,
    driver_failure: Option<SessionError>,
}

impl<S: SessionPhase> MqttSession<S> {
    pub fn connection_state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    pub fn stats(&self) -> SessionStats {
        lock_stats(&self.stats).clone()
    }
}

impl MqttSession<Configured> {
    /// Builds client and event loop without touching the network
    pub fn configure(
        config: MqttConfig,
        simulator: SimulatorHandle,
        cancel_token: CancellationToken,
    ) -> Self {
        let client_id = config.client_id();
        let options = config.mqtt_options(&client_id);
        let (client, event_loop) = AsyncClient::new(options, config.request_channel_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);

        info!(
            client_id = %client_id,
            host = %config.host,
            port = config.port,
            tls = config.use_tls,
            "Configured MQTT session"
        );

        Self::new(
            config,
            client_id,
            client,
            Some(event_loop),
            simulator,
            Arc::new(state_tx),
            SharedStats::default(),
            cancel_token,
            None,
            None,
        )
    }

    /// Spawns the connection driver. Fatal transport errors are reported on
    /// `fatal_tx`.
    pub fn start(mut self, fatal_tx: mpsc::Sender<SessionError>) -> MqttSession<Running> {
        match self.event_loop.take() {
            Some(event_loop) => {
                let driver = ConnectionDriver::new(
                    self.client.clone(),
                    &self.config,
                    self.simulator.clone(),
                    self.state_tx.clone(),
                    self.stats.clone(),
                    self.cancel_token.clone(),
                );
                info!("Starting MQTT event loop for {}", self.client_id);
                self.event_task = Some(tokio::spawn(driver.run(event_loop, fatal_tx)));
            }
            None => error!("MQTT event loop already consumed, session will not connect"),
        }
        self.transition()
    }
}

impl MqttSession<Running> {
    /// Hands one reading to the transport. Never retried.
    pub async fn publish(&self, reading: &Reading) -> PublishOutcome {
        let result = match encode_reading(reading) {
            Ok(payload) => self.try_publish(&self.config.temperature_topic, payload).await,
            Err(e) => Err(e.into()),
        };

        let mut stats = lock_stats(&self.stats);
        match result {
            Ok(()) => {
                stats.readings_published += 1;
                stats.last_activity = Some(Utc::now());
                PublishOutcome::Delivered
            }
            Err(e) => {
                stats.publish_failures += 1;
                PublishOutcome::Failed(e.to_string())
            }
        }
    }

    /// Hands one status report to the transport on the status topic
    pub async fn publish_status(&self, status: &SystemStatus) -> PublishOutcome {
        let result = match encode_status(status) {
            Ok(payload) => self.try_publish(&self.config.status_topic, payload).await,
            Err(e) => Err(e.into()),
        };

        let mut stats = lock_stats(&self.stats);
        match result {
            Ok(()) => {
                stats.statuses_published += 1;
                stats.last_activity = Some(Utc::now());
                PublishOutcome::Delivered
            }
            Err(e) => {
                stats.status_failures += 1;
                PublishOutcome::Failed(e.to_string())
            }
        }
    }

    async fn try_publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), SessionError> {
        let state = self.connection_state();
        if state != ConnectionState::Connected {
            return Err(SessionError::NotConnected(state));
        }

        let timeout = self.config.publish_timeout();
        tokio::time::timeout(
            timeout,
            self.client.publish(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .map_err(|_| SessionError::PublishTimeout(timeout))??;
        Ok(())
    }

    /// Why the driver task exited, or `None` while it is still running
    pub async fn driver_exit(&mut self) -> Option<SessionError> {
        let finished = self
            .event_task
            .as_ref()
            .map_or(true, JoinHandle::is_finished);
        if !finished {
            return None;
        }

        let failure = match self.event_task.take() {
            Some(task) => match task.await {
                Ok(()) => SessionError::EventLoopStopped,
                Err(e) => driver_failure(e),
            },
            None => SessionError::EventLoopStopped,
        };
        Some(failure)
    }

    /// Stops reconnecting, lets the driver flush DISCONNECT and waits for it.
    ///
    /// A driver that does not finish within `timeout` is aborted. A driver
    /// that panicked is kept as [`MqttSession::take_driver_failure`].
    pub async fn shutdown(mut self, timeout: Duration) -> MqttSession<Closed> {
        info!("Shutting down MQTT session {}", self.client_id);
        self.cancel_token.cancel();

        if let Some(mut task) = self.event_task.take() {
            match tokio::time::timeout(timeout, &mut task).await {
                Ok(Ok(())) => debug!("MQTT event loop task finished"),
                Ok(Err(e)) if e.is_panic() => {
                    let failure = driver_failure(e);
                    error!("{}", failure);
                    self.driver_failure = Some(failure);
                }
                Ok(Err(e)) => warn!("MQTT event loop task cancelled: {}", e),
                Err(_) => {
                    warn!("MQTT event loop did not stop within {:?}, aborting", timeout);
                    task.abort();
                }
            }
        }

        self.state_tx.send_replace(ConnectionState::Disconnected);
        info!("Disconnected from MQTT broker");
        self.transition()
    }
}

impl MqttSession<Closed> {
    pub fn final_stats(&self) -> SessionStats {
        self.stats()
    }

    /// Panic of the driver task observed during shutdown
    pub fn take_driver_failure(&mut self) -> Option<SessionError> {
        self.driver_failure.take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SimulationConfig;
    use crate::simulator::{RandomDrift, Simulator};
    use rumqttc::Request;
    use std::io;

    const HEATER_TOPIC: &str = "thermostat/heaterStatus";

    struct DriverFixture {
        driver: ConnectionDriver,
        requests: flume::Receiver<Request>,
        simulator: SimulatorHandle,
        state_rx: watch::Receiver<ConnectionState>,
    }

    fn local_config() -> MqttConfig {
        MqttConfig {
            host: "127.0.0.1".to_string(),
            port: 1,
            use_tls: false,
            ..MqttConfig::default()
        }
    }

    fn fixture_with_capacity(capacity: usize) -> DriverFixture {
        let config = local_config();
        let (request_tx, requests) = flume::bounded(capacity);
        let client = AsyncClient::from_senders(request_tx);
        let (simulator, _task) = SimulatorHandle::spawn(Simulator::new(
            SimulationConfig::default(),
            RandomDrift::seeded(9),
        ));
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let driver = ConnectionDriver::new(
            client,
            &config,
            simulator.clone(),
            Arc::new(state_tx),
            SharedStats::default(),
            CancellationToken::new(),
        );
        DriverFixture {
            driver,
            requests,
            simulator,
            state_rx,
        }
    }

    fn fixture() -> DriverFixture {
        fixture_with_capacity(10)
    }

    fn subscriptions(requests: &flume::Receiver<Request>) -> Vec<(String, QoS)> {
        requests
            .try_iter()
            .filter_map(|request| match request {
                Request::Subscribe(subscribe) => Some(subscribe.filters),
                _ => None,
            })
            .flatten()
            .map(|filter| (filter.path, filter.qos))
            .collect()
    }

    fn connack() -> Event {
        Event::Incoming(Packet::ConnAck(ConnAck::new(
            ConnectReturnCode::Success,
            false,
        )))
    }

    fn heater_publish(topic: &str, payload: impl Into<Vec<u8>>) -> Event {
        Event::Incoming(Packet::Publish(Publish::new(
            topic,
            QoS::AtLeastOnce,
            payload.into(),
        )))
    }

    fn refused() -> ConnectionError {
        ConnectionError::Io(io::Error::new(io::ErrorKind::ConnectionRefused, "refused"))
    }

    fn running_session(simulator: SimulatorHandle) -> MqttSession<Running> {
        let (fatal_tx, _fatal_rx) = mpsc::channel(1);
        MqttSession::configure(local_config(), simulator, CancellationToken::new()).start(fatal_tx)
    }

    fn spawn_simulator() -> SimulatorHandle {
        let (simulator, _task) = SimulatorHandle::spawn(Simulator::new(
            SimulationConfig::default(),
            RandomDrift::seeded(2),
        ));
        simulator
    }

    /// Swaps the real driver for one that panics and waits for it to die
    async fn replace_with_panicking_driver(session: &mut MqttSession<Running>) {
        let panicking = tokio::spawn(async { panic!("driver exploded") });
        if let Some(driver) = session.event_task.replace(panicking) {
            driver.abort();
        }
        while !session
            .event_task
            .as_ref()
            .is_some_and(JoinHandle::is_finished)
        {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn connack_connects_and_resets_backoff() {
        let mut f = fixture();

        assert_eq!(f.driver.on_connection_error(refused()).unwrap(), Duration::from_secs(1));
        assert_eq!(
            f.driver.on_connection_error(ConnectionError::NetworkTimeout).unwrap(),
            Duration::from_secs(2)
        );
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Reconnecting);

        assert_eq!(f.driver.handle_event(connack()).await, Flow::Continue);
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(f.driver.backoff.failures(), 0);
        assert_eq!(lock_stats(&f.driver.stats).reconnects, 0);

        // Unexpected drop after a good connection starts over at the minimum
        assert_eq!(f.driver.on_connection_error(refused()).unwrap(), Duration::from_secs(1));
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Reconnecting);

        f.driver.handle_event(connack()).await;
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connected);
        assert_eq!(lock_stats(&f.driver.stats).reconnects, 1);
    }

    #[tokio::test]
    async fn every_connack_subscribes_heater_topic() {
        let mut f = fixture();
        let expected = vec![(HEATER_TOPIC.to_string(), QoS::AtLeastOnce)];

        f.driver.handle_event(connack()).await;
        assert_eq!(subscriptions(&f.requests), expected);

        f.driver.on_connection_error(refused()).unwrap();
        assert!(subscriptions(&f.requests).is_empty());

        f.driver.handle_event(connack()).await;
        assert_eq!(subscriptions(&f.requests), expected);
    }

    #[tokio::test]
    async fn subscription_is_retried_when_request_queue_is_full() {
        let mut f = fixture_with_capacity(1);
        f.driver
            .client
            .try_publish("thermostat/filler", QoS::AtMostOnce, false, "x")
            .unwrap();

        f.driver.handle_event(connack()).await;
        assert!(f.driver.subscribe_pending);
        // Reading the queue frees its only slot
        assert!(subscriptions(&f.requests).is_empty());

        f.driver
            .handle_event(Event::Incoming(Packet::PingResp))
            .await;
        assert!(!f.driver.subscribe_pending);
        assert_eq!(
            subscriptions(&f.requests),
            vec![(HEATER_TOPIC.to_string(), QoS::AtLeastOnce)]
        );
    }

    #[tokio::test]
    async fn connection_error_drops_pending_subscription() {
        let mut f = fixture_with_capacity(1);
        f.driver
            .client
            .try_publish("thermostat/filler", QoS::AtMostOnce, false, "x")
            .unwrap();
        f.driver.handle_event(connack()).await;
        assert!(f.driver.subscribe_pending);

        f.driver.on_connection_error(refused()).unwrap();
        assert!(!f.driver.subscribe_pending);
    }

    #[tokio::test]
    async fn shutdown_while_connected_queues_disconnect() {
        let mut f = fixture();
        f.driver.handle_event(connack()).await;
        let _ = f.requests.drain();

        assert_eq!(f.driver.on_shutdown_requested(), Flow::Continue);
        let queued: Vec<Request> = f.requests.try_iter().collect();
        assert_eq!(queued.len(), 1);
        assert!(matches!(queued[0], Request::Disconnect { .. }));
    }

    #[tokio::test]
    async fn shutdown_while_offline_stops_without_disconnect() {
        let f = fixture();
        assert_eq!(f.driver.on_shutdown_requested(), Flow::Stop);
        assert!(f.requests.is_empty());

        f.driver.set_state(ConnectionState::Reconnecting);
        assert_eq!(f.driver.on_shutdown_requested(), Flow::Stop);
        assert!(f.requests.is_empty());
    }

    #[tokio::test]
    async fn refused_suback_is_detected() {
        let granted = SubAck::new(1, vec![SubscribeReasonCode::Success(QoS::AtLeastOnce)]);
        let denied = SubAck::new(2, vec![SubscribeReasonCode::Failure]);
        assert_eq!(refused_filters(&granted), 0);
        assert_eq!(refused_filters(&denied), 1);

        let mut f = fixture();
        f.driver.handle_event(connack()).await;
        assert_eq!(
            f.driver
                .handle_event(Event::Incoming(Packet::SubAck(denied)))
                .await,
            Flow::Continue
        );
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connected);
    }

    #[tokio::test]
    async fn requests_done_is_fatal() {
        let mut f = fixture();
        let err = f
            .driver
            .on_connection_error(ConnectionError::RequestsDone)
            .unwrap_err();
        assert_eq!(err.severity(), Severity::Fatal);
        // Fatal errors do not enter the reconnect path
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connecting);
    }

    #[tokio::test]
    async fn heater_commands_reach_the_simulator() {
        let mut f = fixture();
        f.driver.handle_event(connack()).await;

        f.driver.handle_event(heater_publish(HEATER_TOPIC, "ON")).await;
        assert!(f.simulator.snapshot().await.unwrap().heater_on);

        f.driver.handle_event(heater_publish(HEATER_TOPIC, "OFF ")).await;
        assert!(!f.simulator.snapshot().await.unwrap().heater_on);

        assert_eq!(lock_stats(&f.driver.stats).heater_commands, 2);
    }

    #[tokio::test]
    async fn malformed_and_unrelated_messages_are_dropped() {
        let mut f = fixture();
        f.driver.handle_event(connack()).await;
        f.driver.handle_event(heater_publish(HEATER_TOPIC, "ON")).await;

        f.driver
            .handle_event(heater_publish(HEATER_TOPIC, vec![0xc3, 0x28]))
            .await;
        f.driver
            .handle_event(heater_publish("thermostat/temperature", "OFF"))
            .await;

        assert!(f.simulator.snapshot().await.unwrap().heater_on);
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connected);

        let stats = lock_stats(&f.driver.stats).clone();
        assert_eq!(stats.heater_commands, 1);
        assert_eq!(stats.malformed_messages, 1);
    }

    #[tokio::test]
    async fn outgoing_disconnect_stops_the_driver() {
        let mut f = fixture();
        assert_eq!(
            f.driver.handle_event(Event::Outgoing(Outgoing::Disconnect)).await,
            Flow::Stop
        );
        assert_eq!(
            f.driver.handle_event(Event::Outgoing(Outgoing::PingReq)).await,
            Flow::Continue
        );
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_wait_moves_to_connecting() {
        let mut f = fixture();
        let delay = f.driver.on_connection_error(refused()).unwrap();

        let started = tokio::time::Instant::now();
        assert!(f.driver.wait_before_reconnect(delay).await);
        assert!(started.elapsed() >= Duration::from_secs(1));
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Connecting);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_pending_reconnect() {
        let mut f = fixture();
        let delay = f.driver.on_connection_error(refused()).unwrap();
        f.driver.cancel_token.cancel();

        assert!(!f.driver.wait_before_reconnect(delay).await);
        assert_eq!(*f.state_rx.borrow(), ConnectionState::Reconnecting);
    }

    #[tokio::test]
    async fn publish_fails_fast_without_connection() {
        let simulator = spawn_simulator();
        let session = running_session(simulator.clone());
        assert_ne!(session.connection_state(), ConnectionState::Connected);

        let reading = simulator.next_reading().await.unwrap();
        let outcome = session.publish(&reading).await;
        assert!(matches!(outcome, PublishOutcome::Failed(ref reason) if reason.contains("Not connected")));

        let status = session
            .publish_status(&SystemStatus::new(&reading, false))
            .await;
        assert!(matches!(status, PublishOutcome::Failed(_)));

        let mut closed = session.shutdown(Duration::from_secs(2)).await;
        assert_eq!(closed.connection_state(), ConnectionState::Disconnected);
        assert!(closed.take_driver_failure().is_none());

        let stats = closed.final_stats();
        assert_eq!(stats.publish_failures, 1);
        assert_eq!(stats.readings_published, 0);
        assert_eq!(stats.status_failures, 1);
        assert_eq!(stats.statuses_published, 0);
    }

    #[tokio::test]
    async fn panicked_driver_is_reported_with_its_message() {
        let mut session = running_session(spawn_simulator());
        assert!(session.driver_exit().await.is_none());

        replace_with_panicking_driver(&mut session).await;

        let failure = session.driver_exit().await.unwrap();
        assert!(
            matches!(failure, SessionError::EventLoopPanicked(ref message) if message == "driver exploded")
        );
        assert_eq!(failure.severity(), Severity::Fatal);

        session.shutdown(Duration::from_secs(1)).await;
    }

    #[tokio::test]
    async fn shutdown_keeps_driver_panic() {
        let mut session = running_session(spawn_simulator());
        replace_with_panicking_driver(&mut session).await;

        let mut closed = session.shutdown(Duration::from_secs(1)).await;
        assert!(matches!(
            closed.take_driver_failure(),
            Some(SessionError::EventLoopPanicked(_))
        ));
        assert!(closed.take_driver_failure().is_none());
    }

    #[test]
    fn panic_payloads_become_messages() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(7_u8)), "unknown panic payload");
    }

    #[test]
    fn severity_classification() {
        assert_eq!(
            SessionError::from(ConnectionError::NetworkTimeout).severity(),
            Severity::Recoverable
        );
        assert_eq!(
            SessionError::PublishTimeout(Duration::from_secs(5)).severity(),
            Severity::Recoverable
        );
        assert_eq!(
            SessionError::EventLoopPanicked("boom".to_string()).severity(),
            Severity::Fatal
        );
    }
}
