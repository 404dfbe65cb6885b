//! Temperature evolution model
//!
//! Each tick moves the temperature towards the heater direction by
//! `base_drift`, occasionally keeps the previous direction (thermal inertia),
//! adds uniform noise and clamps the result into the configured bounds.

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::config::SimulationConfig;

pub const UNIT_CELSIUS: &str = "Celsius";

const HEATER_ON_PAYLOAD: &str = "ON";

/// Direction of the last temperature change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    Rising,
    Falling,
}

impl Direction {
    fn sign(self) -> f64 {
        match self {
            Direction::Rising => 1.0,
            Direction::Falling => -1.0,
        }
    }
}

/// Heater command decoded from an inbound payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaterCommand {
    On,
    Off,
}

impl HeaterCommand {
    /// Only the exact text `ON` switches the heater on. Anything else,
    /// including `on` or `ON ` with trailing whitespace, means off.
    pub fn from_payload(payload: &str) -> Self {
        if payload == HEATER_ON_PAYLOAD {
            HeaterCommand::On
        } else {
            HeaterCommand::Off
        }
    }

    pub fn is_on(self) -> bool {
        matches!(self, HeaterCommand::On)
    }
}

impl fmt::Display for HeaterCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            HeaterCommand::On => write!(f, "ON"),
            HeaterCommand::Off => write!(f, "OFF"),
        }
    }
}

/// One published temperature sample
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    pub timestamp: DateTime<Utc>,
    pub temperature: f64,
    pub unit: String,
}

impl Reading {
    pub fn new(timestamp: DateTime<Utc>, temperature: f64) -> Self {
        Self {
            timestamp,
            temperature,
            unit: UNIT_CELSIUS.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SimulatorState {
    pub current_temperature: f64,
    pub heater_on: bool,
    pub last_direction: Direction,
}

/// Source of the two random draws made per tick
///
/// Every tick draws [`variation`](DriftSource::variation) first and
/// [`momentum`](DriftSource::momentum) second, so a seeded generator replays
/// the same sequence as the Python thermostat.
pub trait DriftSource: Send {
    /// Uniform sample from `[-variance, variance]`
    fn variation(&mut self, variance: f64) -> f64;

    /// Whether the previous direction carries into this tick
    fn momentum(&mut self, chance: f64) -> bool;
}

/// [`DriftSource`] backed by a `rand` generator
#[derive(Debug, Clone)]
pub struct RandomDrift<R> {
    rng: R,
}

impl<R: Rng> RandomDrift<R> {
    pub fn new(rng: R) -> Self {
        Self { rng }
    }
}

impl RandomDrift<StdRng> {
    pub fn from_os_rng() -> Self {
        Self::new(StdRng::from_os_rng())
    }

    /// Reproducible sequence for golden-output runs
    pub fn seeded(seed: u64) -> Self {
        Self::new(StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng + Send> DriftSource for RandomDrift<R> {
    fn variation(&mut self, variance: f64) -> f64 {
        if variance > 0.0 {
            self.rng.random_range(-variance..=variance)
        } else {
            0.0
        }
    }

    fn momentum(&mut self, chance: f64) -> bool {
        self.rng.random::<f64>() < chance
    }
}

pub struct Simulator<D> {
    state: SimulatorState,
    params: SimulationConfig,
    drift: D,
}

impl<D: DriftSource> Simulator<D> {
    /// Heater off, direction rising, temperature at `initial_temp` clamped
    /// into bounds.
    pub fn new(params: SimulationConfig, drift: D) -> Self {
        let state = SimulatorState {
            current_temperature: params.initial_temp,
            heater_on: false,
            last_direction: Direction::Rising,
        };
        Self::with_state(params, drift, state)
    }

    pub fn with_state(params: SimulationConfig, drift: D, mut state: SimulatorState) -> Self {
        state.current_temperature = clamp(state.current_temperature, &params);
        Self {
            state,
            params,
            drift,
        }
    }

    pub fn state(&self) -> SimulatorState {
        self.state
    }

    pub fn apply_heater_command(&mut self, command: HeaterCommand) {
        self.state.heater_on = command.is_on();
    }

    pub fn next_reading(&mut self) -> Reading {
        self.next_reading_at(Utc::now())
    }

    /// Advances one tick and stamps the reading with `timestamp`
    pub fn next_reading_at(&mut self, timestamp: DateTime<Utc>) -> Reading {
        let heater_sign = if self.state.heater_on { 1.0 } else { -1.0 };
        let mut change = self.params.base_drift * heater_sign;

        let variation = self.drift.variation(self.params.drift_variance);
        if self.drift.momentum(self.params.momentum_chance) {
            change += self.state.last_direction.sign() * self.params.momentum_step;
        }
        change += variation;

        let previous = self.state.current_temperature;
        let candidate = clamp(previous + change, &self.params);

        self.state.last_direction = if candidate > previous {
            Direction::Rising
        } else {
            Direction::Falling
        };
        // Bounds with more than two decimals could be crossed by rounding
        self.state.current_temperature = clamp(round_to_hundredths(candidate), &self.params);

        Reading::new(timestamp, self.state.current_temperature)
    }
}

fn clamp(value: f64, params: &SimulationConfig) -> f64 {
    value.max(params.min_temp).min(params.max_temp)
}

fn round_to_hundredths(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Replays the same draw on every tick
    struct FixedDrift {
        momentum: bool,
        variation: f64,
    }

    impl DriftSource for FixedDrift {
        fn momentum(&mut self, _chance: f64) -> bool {
            self.momentum
        }

        fn variation(&mut self, _variance: f64) -> f64 {
            self.variation
        }
    }

    fn zero_drift() -> FixedDrift {
        FixedDrift {
            momentum: false,
            variation: 0.0,
        }
    }

    #[test]
    fn initial_state_matches_defaults() {
        let simulator = Simulator::new(SimulationConfig::default(), zero_drift());
        let state = simulator.state();
        assert_eq!(state.current_temperature, 22.0);
        assert!(!state.heater_on);
        assert_eq!(state.last_direction, Direction::Rising);
    }

    #[test]
    fn initial_temperature_is_clamped() {
        let params = SimulationConfig {
            initial_temp: 31.0,
            ..SimulationConfig::default()
        };
        let simulator = Simulator::new(params, zero_drift());
        assert_eq!(simulator.state().current_temperature, 25.0);
    }

    #[test]
    fn cooling_then_heating_with_zeroed_randomness() {
        let mut simulator = Simulator::new(SimulationConfig::default(), zero_drift());

        let first = simulator.next_reading();
        assert_eq!(first.temperature, 21.7);
        assert_eq!(first.unit, "Celsius");
        assert_eq!(simulator.state().last_direction, Direction::Falling);

        simulator.apply_heater_command(HeaterCommand::from_payload("ON"));
        let second = simulator.next_reading();
        assert_eq!(second.temperature, 22.0);
        assert_eq!(simulator.state().last_direction, Direction::Rising);
    }

    #[test]
    fn momentum_carries_previous_direction() {
        let mut simulator = Simulator::new(
            SimulationConfig::default(),
            FixedDrift {
                momentum: true,
                variation: 0.0,
            },
        );

        // Heater off pulls down 0.3, rising momentum pushes back 0.2
        let reading = simulator.next_reading();
        assert_eq!(reading.temperature, 21.9);
        assert_eq!(simulator.state().last_direction, Direction::Falling);

        // Falling momentum now adds to the cooling
        let reading = simulator.next_reading();
        assert_eq!(reading.temperature, 21.4);
    }

    #[test]
    fn clamped_tick_at_upper_bound_counts_as_falling() {
        let params = SimulationConfig::default();
        let state = SimulatorState {
            current_temperature: 25.0,
            heater_on: true,
            last_direction: Direction::Rising,
        };
        let mut simulator = Simulator::with_state(params, zero_drift(), state);

        let reading = simulator.next_reading();
        assert_eq!(reading.temperature, 25.0);
        // Candidate clamps to 25.0, which is not strictly above 25.0
        assert_eq!(simulator.state().last_direction, Direction::Falling);
    }

    #[test]
    fn clamps_at_lower_bound() {
        let state = SimulatorState {
            current_temperature: 18.1,
            heater_on: false,
            last_direction: Direction::Falling,
        };
        let mut simulator = Simulator::with_state(
            SimulationConfig::default(),
            FixedDrift {
                momentum: true,
                variation: -0.2,
            },
            state,
        );

        assert_eq!(simulator.next_reading().temperature, 18.0);
        assert_eq!(simulator.next_reading().temperature, 18.0);
        assert_eq!(simulator.state().last_direction, Direction::Falling);
    }

    #[test]
    fn heater_payload_decoding() {
        assert_eq!(HeaterCommand::from_payload("ON"), HeaterCommand::On);
        assert_eq!(HeaterCommand::from_payload("OFF"), HeaterCommand::Off);
        assert_eq!(HeaterCommand::from_payload("OFF "), HeaterCommand::Off);
        assert_eq!(HeaterCommand::from_payload("ON "), HeaterCommand::Off);
        assert_eq!(HeaterCommand::from_payload("on"), HeaterCommand::Off);
        assert_eq!(HeaterCommand::from_payload(""), HeaterCommand::Off);
    }

    #[test]
    fn heater_commands_are_idempotent() {
        let mut simulator = Simulator::new(SimulationConfig::default(), zero_drift());

        simulator.apply_heater_command(HeaterCommand::On);
        simulator.apply_heater_command(HeaterCommand::On);
        assert!(simulator.state().heater_on);

        simulator.apply_heater_command(HeaterCommand::from_payload("OFF "));
        assert!(!simulator.state().heater_on);
        simulator.apply_heater_command(HeaterCommand::Off);
        assert!(!simulator.state().heater_on);
    }

    #[test]
    fn stays_within_bounds_for_long_random_runs() {
        let params = SimulationConfig::default();
        let mut simulator = Simulator::new(params.clone(), RandomDrift::seeded(7));

        for tick in 0..20_000 {
            // Long heating and cooling phases push into both clamps
            if tick % 500 == 0 {
                let command = if (tick / 500) % 2 == 0 {
                    HeaterCommand::On
                } else {
                    HeaterCommand::Off
                };
                simulator.apply_heater_command(command);
            }

            let previous = simulator.state().current_temperature;
            let reading = simulator.next_reading();
            assert!(
                (params.min_temp..=params.max_temp).contains(&reading.temperature),
                "tick {tick}: {} out of bounds",
                reading.temperature
            );
            assert_eq!(reading.temperature, simulator.state().current_temperature);

            let expected = if reading.temperature > previous {
                Direction::Rising
            } else if reading.temperature < previous {
                Direction::Falling
            } else {
                simulator.state().last_direction
            };
            assert_eq!(simulator.state().last_direction, expected);
        }
    }

    #[test]
    fn seeded_runs_are_reproducible() {
        let run = |seed| {
            let mut simulator = Simulator::new(SimulationConfig::default(), RandomDrift::seeded(seed));
            (0..50)
                .map(|i| {
                    if i == 20 {
                        simulator.apply_heater_command(HeaterCommand::On);
                    }
                    simulator.next_reading().temperature
                })
                .collect::<Vec<_>>()
        };

        assert_eq!(run(42), run(42));
        assert_ne!(run(42), run(43));
    }

    #[test]
    fn readings_are_rounded_to_hundredths() {
        let mut simulator = Simulator::new(
            SimulationConfig::default(),
            FixedDrift {
                momentum: false,
                variation: 0.123_456,
            },
        );
        let reading = simulator.next_reading();
        assert_eq!(reading.temperature, 21.82);
    }

    #[test]
    fn variation_is_drawn_before_momentum() {
        let params = SimulationConfig::default();
        let mut simulator = Simulator::new(params.clone(), RandomDrift::seeded(5));
        let reading = simulator.next_reading();

        let mut rng = StdRng::seed_from_u64(5);
        let variation = rng.random_range(-params.drift_variance..=params.drift_variance);
        let momentum = rng.random::<f64>() < params.momentum_chance;

        let mut change = -params.base_drift;
        if momentum {
            // Initial direction is rising
            change += params.momentum_step;
        }
        change += variation;
        let expected = round_to_hundredths(clamp(params.initial_temp + change, &params));
        assert_eq!(reading.temperature, expected);
    }
}
