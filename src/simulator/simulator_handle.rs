//! Simulator Handle - actor owning the temperature model
//!
//! The model is moved into a dedicated tokio task. Everything else talks to it
//! through a cloneable [`SimulatorHandle`], so the MQTT event loop and the tick
//! timer never touch [`SimulatorState`] concurrently.
//!
//! ```text
//! SimulatorHandle ─[SimulatorAction]→ actor task ─[oneshot]→ caller
//!                   (mpsc::channel(64))
//! ```

use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::model::{DriftSource, HeaterCommand, Reading, Simulator, SimulatorState};

const ACTION_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// The actor task has stopped and dropped its inbox
    #[error("Simulator task is no longer running")]
    ActorGone,
}

/// Result of one tick: the reading plus the state right after it
#[derive(Debug, Clone)]
pub struct SimulatorTick {
    pub reading: Reading,
    pub state: SimulatorState,
}

#[derive(Debug)]
pub enum SimulatorAction {
    ApplyHeaterCommand(HeaterCommand),
    NextReading {
        response_tx: oneshot::Sender<SimulatorTick>,
    },
    Snapshot {
        response_tx: oneshot::Sender<SimulatorState>,
    },
}

#[derive(Debug, Clone)]
pub struct SimulatorHandle {
    tx: mpsc::Sender<SimulatorAction>,
}

impl SimulatorHandle {
    /// Moves `simulator` into a new task and returns the handle to it.
    ///
    /// The task ends once every handle has been dropped.
    pub fn spawn<D>(mut simulator: Simulator<D>) -> (Self, JoinHandle<()>)
    where
        D: DriftSource + 'static,
    {
        let (tx, mut rx) = mpsc::channel::<SimulatorAction>(ACTION_CHANNEL_CAPACITY);

        let handle = tokio::spawn(async move {
            debug!("Simulator task started with state {:?}", simulator.state());
            while let Some(action) = rx.recv().await {
                match action {
                    SimulatorAction::ApplyHeaterCommand(command) => {
                        let was_on = simulator.state().heater_on;
                        simulator.apply_heater_command(command);
                        info!(
                            heater = %command,
                            changed = was_on != command.is_on(),
                            "Heater status updated: {}",
                            command
                        );
                    }
                    SimulatorAction::NextReading { response_tx } => {
                        let reading = simulator.next_reading();
                        let tick = SimulatorTick {
                            reading,
                            state: simulator.state(),
                        };
                        if response_tx.send(tick).is_err() {
                            debug!("Reading requester went away before the response");
                        }
                    }
                    SimulatorAction::Snapshot { response_tx } => {
                        let _ = response_tx.send(simulator.state());
                    }
                }
            }
            debug!("All simulator handles dropped, stopping simulator task");
        });

        (Self { tx }, handle)
    }

    pub async fn apply_heater_command(&self, command: HeaterCommand) -> Result<(), SimulatorError> {
        self.tx
            .send(SimulatorAction::ApplyHeaterCommand(command))
            .await
            .map_err(|_| SimulatorError::ActorGone)
    }

    /// Advances the model one tick
    pub async fn tick(&self) -> Result<SimulatorTick, SimulatorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SimulatorAction::NextReading { response_tx })
            .await
            .map_err(|_| SimulatorError::ActorGone)?;
        response_rx.await.map_err(|_| SimulatorError::ActorGone)
    }

    pub async fn next_reading(&self) -> Result<Reading, SimulatorError> {
        self.tick().await.map(|tick| tick.reading)
    }

    pub async fn snapshot(&self) -> Result<SimulatorState, SimulatorError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.tx
            .send(SimulatorAction::Snapshot { response_tx })
            .await
            .map_err(|_| SimulatorError::ActorGone)?;
        response_rx.await.map_err(|_| SimulatorError::ActorGone)
    }
}
