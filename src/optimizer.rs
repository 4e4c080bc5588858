//! Greedy UV-power hill-climbing optimizer for the piezo actuators.
//!
//! Each iteration moves an actuator by a fixed step, waits for the
//! mechanical settle plus a configured dwell, samples the UV power, and
//! keeps the step direction while the power slope is positive. Two layers
//! sit on top of the plain greedy search:
//!
//! - **Checkpointing**: every `checkpoint_interval` iterations the current
//!   `(wavelength, position, power)` triple is stored as a drift reference.
//! - **Drift failsafe**: when the measured power collapses below
//!   `collapse_ratio` of the checkpoint power (while still positive), the
//!   greedy search has lost the peak, usually because the wavelength
//!   jumped further than one step per tick can follow. The actuator is
//!   then sent straight to the position predicted by a pre-measured linear
//!   wavelength→step relation and the checkpoint is re-anchored there.
//!   The steps-per-nm slopes are asymmetric (hand-calibrated per travel
//!   sign for this optical path) and live in the configuration.
//!
//! The dual-axis variant alternates one move+measure+update cycle per axis
//! against the single shared power sensor. Each axis only sees a power
//! sample taken right after its own move; the other axis's latest move is
//! stale context for that sample. That is a documented limitation of the
//! alternating scheme, not something the optimizer tries to correct.

use crate::control::StopToken;
use crate::error::{BenchError, BenchResult};
use crate::hardware::{LinearActuator, PowerSensor, WavelengthSource};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Step direction of the greedy search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

impl Direction {
    fn sign(self) -> i64 {
        match self {
            Direction::Forward => 1,
            Direction::Backward => -1,
        }
    }
}

/// Optimizer tuning parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct OptimizerConfig {
    /// Step size per iteration, in actuator steps.
    #[serde(default = "default_step")]
    pub step: i64,
    /// Actuator velocity in steps per second (sets the mechanical settle
    /// time `step / velocity`).
    #[serde(default = "default_velocity")]
    pub velocity_steps_per_s: f64,
    /// Extra dwell after the mechanical settle.
    #[serde(with = "humantime_serde", default = "default_dwell")]
    pub dwell: Duration,
    /// Iterations between checkpoint refreshes.
    #[serde(default = "default_checkpoint_interval")]
    pub checkpoint_interval: u32,
    /// Power collapse threshold relative to the checkpoint power.
    #[serde(default = "default_collapse_ratio")]
    pub collapse_ratio: f64,
    /// Correction slope in steps per nm for rising wavelength.
    #[serde(default = "default_steps_per_nm_rising")]
    pub steps_per_nm_rising: f64,
    /// Correction slope in steps per nm for falling wavelength.
    #[serde(default = "default_steps_per_nm_falling")]
    pub steps_per_nm_falling: f64,
}

fn default_step() -> i64 {
    50
}
fn default_velocity() -> f64 {
    1750.0
}
fn default_dwell() -> Duration {
    Duration::from_millis(20)
}
fn default_checkpoint_interval() -> u32 {
    20
}
fn default_collapse_ratio() -> f64 {
    0.8
}
fn default_steps_per_nm_rising() -> f64 {
    3233.0
}
fn default_steps_per_nm_falling() -> f64 {
    3500.0
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            step: default_step(),
            velocity_steps_per_s: default_velocity(),
            dwell: default_dwell(),
            checkpoint_interval: default_checkpoint_interval(),
            collapse_ratio: default_collapse_ratio(),
            steps_per_nm_rising: default_steps_per_nm_rising(),
            steps_per_nm_falling: default_steps_per_nm_falling(),
        }
    }
}

impl OptimizerConfig {
    /// Correction steps for a wavelength drift since the checkpoint.
    ///
    /// The slopes are asymmetric by drift sign; the negative sign encodes
    /// that the peak position moves opposite to the wavelength.
    pub fn correction_steps(&self, delta_wavelength_nm: f64) -> f64 {
        let slope = if delta_wavelength_nm > 0.0 {
            self.steps_per_nm_rising
        } else {
            self.steps_per_nm_falling
        };
        -delta_wavelength_nm * slope
    }

    fn settle_after(&self, steps: i64) -> Duration {
        Duration::from_secs_f64(steps.unsigned_abs() as f64 / self.velocity_steps_per_s)
            + self.dwell
    }
}

/// Per-axis state of the greedy search.
#[derive(Debug, Clone, Copy)]
pub struct HillClimbState {
    pub direction: Direction,
    pub last_power: f64,
    pub last_position: i64,
    pub checkpoint_wavelength: f64,
    pub checkpoint_position: i64,
    pub checkpoint_power: f64,
    pub ticks_since_checkpoint: u32,
}

/// Status events emitted by the optimizer loops.
#[derive(Debug, Clone)]
pub enum OptimizerEvent {
    Started,
    /// The drift failsafe repositioned an axis.
    FailsafeTriggered {
        axis: usize,
        delta_wavelength_nm: f64,
        correction_steps: i64,
    },
    Stopped { ok: bool },
}

/// One actuator axis plus its search state.
struct AxisClimber {
    axis: usize,
    actuator: Arc<dyn LinearActuator>,
    state: Option<HillClimbState>,
}

impl AxisClimber {
    fn new(axis: usize, actuator: Arc<dyn LinearActuator>) -> Self {
        Self {
            axis,
            actuator,
            state: None,
        }
    }

    /// Initialize the search state from the current hardware readings.
    async fn prime(
        &mut self,
        config: &OptimizerConfig,
        sensor: &Arc<dyn PowerSensor>,
        meter: &Arc<dyn WavelengthSource>,
    ) -> BenchResult<()> {
        self.actuator
            .set_velocity(config.velocity_steps_per_s)
            .await
            .map_err(BenchError::transport)?;
        let position = self.actuator.position().await.map_err(BenchError::transport)?;
        let power = sensor.read_power().await.map_err(BenchError::transport)?;
        let wavelength = meter.wavelength_nm().await.map_err(BenchError::transport)?;

        self.state = Some(HillClimbState {
            direction: Direction::Forward,
            last_power: power,
            last_position: position,
            checkpoint_wavelength: wavelength,
            checkpoint_position: position,
            checkpoint_power: power,
            ticks_since_checkpoint: 0,
        });
        Ok(())
    }

    /// One move+measure+update cycle.
    async fn advance(
        &mut self,
        config: &OptimizerConfig,
        sensor: &Arc<dyn PowerSensor>,
        meter: &Arc<dyn WavelengthSource>,
        events: &mpsc::UnboundedSender<OptimizerEvent>,
    ) -> BenchResult<()> {
        let Some(mut state) = self.state else {
            return Err(BenchError::InvalidInput("optimizer axis not primed".into()));
        };

        let step = config.step * state.direction.sign();
        self.actuator
            .move_by(step)
            .await
            .map_err(BenchError::transport)?;
        tokio::time::sleep(config.settle_after(step)).await;

        let power = sensor.read_power().await.map_err(BenchError::transport)?;
        let position = self.actuator.position().await.map_err(BenchError::transport)?;

        if position == state.last_position {
            // Degenerate move (actuator stalled or readback lagged): no
            // slope information, keep the previous direction.
            debug!(axis = self.axis, position, "zero position delta, holding direction");
        } else {
            let slope =
                (power - state.last_power) / (position - state.last_position) as f64;
            state.direction = if slope > 0.0 {
                Direction::Forward
            } else {
                Direction::Backward
            };
        }
        state.last_power = power;
        state.last_position = position;

        state.ticks_since_checkpoint += 1;
        if state.ticks_since_checkpoint >= config.checkpoint_interval {
            let wavelength = meter.wavelength_nm().await.map_err(BenchError::transport)?;
            state.checkpoint_wavelength = wavelength;
            state.checkpoint_position = position;
            state.checkpoint_power = power;
            state.ticks_since_checkpoint = 0;
            debug!(axis = self.axis, wavelength, position, power, "checkpoint");
        }

        if power > 0.0 && power < config.collapse_ratio * state.checkpoint_power {
            self.recover(config, &mut state, sensor, meter, events, power, position)
                .await?;
        }

        self.state = Some(state);
        Ok(())
    }

    /// Model-based reposition after a power collapse.
    #[allow(clippy::too_many_arguments)]
    async fn recover(
        &self,
        config: &OptimizerConfig,
        state: &mut HillClimbState,
        sensor: &Arc<dyn PowerSensor>,
        meter: &Arc<dyn WavelengthSource>,
        events: &mpsc::UnboundedSender<OptimizerEvent>,
        power: f64,
        position: i64,
    ) -> BenchResult<()> {
        let wavelength = meter.wavelength_nm().await.map_err(BenchError::transport)?;
        let delta_wavelength = wavelength - state.checkpoint_wavelength;
        let calculated_steps = config.correction_steps(delta_wavelength).round() as i64;
        let delta_position = calculated_steps - (position - state.checkpoint_position);

        warn!(
            axis = self.axis,
            power,
            checkpoint_power = state.checkpoint_power,
            delta_wavelength,
            delta_position,
            "power collapse, failsafe reposition"
        );

        self.actuator
            .move_by(delta_position)
            .await
            .map_err(BenchError::transport)?;
        tokio::time::sleep(config.settle_after(delta_position)).await;

        let corrected_position = state.checkpoint_position + calculated_steps;
        let corrected_power = sensor.read_power().await.map_err(BenchError::transport)?;

        // Re-anchor on post-correction reality so a second collapse is
        // judged against the corrected state.
        state.checkpoint_wavelength = wavelength;
        state.checkpoint_position = corrected_position;
        state.checkpoint_power = corrected_power;
        state.ticks_since_checkpoint = 0;
        state.last_position = corrected_position;
        state.last_power = corrected_power;

        let _ = events.send(OptimizerEvent::FailsafeTriggered {
            axis: self.axis,
            delta_wavelength_nm: delta_wavelength,
            correction_steps: calculated_steps,
        });
        Ok(())
    }
}

/// Single-axis hill-climbing loop.
pub struct HillClimber {
    config: OptimizerConfig,
    axis: AxisClimber,
    sensor: Arc<dyn PowerSensor>,
    meter: Arc<dyn WavelengthSource>,
    events: mpsc::UnboundedSender<OptimizerEvent>,
}

impl HillClimber {
    pub fn new(
        config: OptimizerConfig,
        actuator: Arc<dyn LinearActuator>,
        sensor: Arc<dyn PowerSensor>,
        meter: Arc<dyn WavelengthSource>,
    ) -> (Self, mpsc::UnboundedReceiver<OptimizerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                axis: AxisClimber::new(0, actuator),
                sensor,
                meter,
                events,
            },
            rx,
        )
    }

    /// Current search state, once primed.
    pub fn state(&self) -> Option<HillClimbState> {
        self.axis.state
    }

    /// Prime and run one iteration; exposed for deterministic stepping.
    pub async fn step_once(&mut self) -> BenchResult<()> {
        if self.axis.state.is_none() {
            self.axis.prime(&self.config, &self.sensor, &self.meter).await?;
        }
        self.axis
            .advance(&self.config, &self.sensor, &self.meter, &self.events)
            .await
    }

    /// Run until the stop flag is observed at an iteration boundary.
    pub async fn run(&mut self, stop: StopToken) -> BenchResult<()> {
        let _ = self.events.send(OptimizerEvent::Started);
        self.axis.prime(&self.config, &self.sensor, &self.meter).await?;

        loop {
            if stop.is_stopped() {
                let _ = self.events.send(OptimizerEvent::Stopped { ok: true });
                return Ok(());
            }
            if let Err(err) = self
                .axis
                .advance(&self.config, &self.sensor, &self.meter, &self.events)
                .await
            {
                let _ = self.events.send(OptimizerEvent::Stopped { ok: false });
                return Err(err);
            }
        }
    }
}

/// Dual-axis hill-climbing loop: two independent searches sharing one
/// power sensor, alternating one cycle per axis.
pub struct DualHillClimber {
    config: OptimizerConfig,
    axes: [AxisClimber; 2],
    sensor: Arc<dyn PowerSensor>,
    meter: Arc<dyn WavelengthSource>,
    events: mpsc::UnboundedSender<OptimizerEvent>,
}

impl DualHillClimber {
    pub fn new(
        config: OptimizerConfig,
        first: Arc<dyn LinearActuator>,
        second: Arc<dyn LinearActuator>,
        sensor: Arc<dyn PowerSensor>,
        meter: Arc<dyn WavelengthSource>,
    ) -> (Self, mpsc::UnboundedReceiver<OptimizerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                axes: [AxisClimber::new(0, first), AxisClimber::new(1, second)],
                sensor,
                meter,
                events,
            },
            rx,
        )
    }

    /// Run one alternating iteration (one cycle per axis); exposed for
    /// deterministic stepping.
    pub async fn step_once(&mut self) -> BenchResult<()> {
        for axis in &mut self.axes {
            if axis.state.is_none() {
                axis.prime(&self.config, &self.sensor, &self.meter).await?;
            }
            axis.advance(&self.config, &self.sensor, &self.meter, &self.events)
                .await?;
        }
        Ok(())
    }

    /// Run until the stop flag is observed at an iteration boundary.
    pub async fn run(&mut self, stop: StopToken) -> BenchResult<()> {
        let _ = self.events.send(OptimizerEvent::Started);
        for axis in &mut self.axes {
            axis.prime(&self.config, &self.sensor, &self.meter).await?;
        }

        loop {
            if stop.is_stopped() {
                let _ = self.events.send(OptimizerEvent::Stopped { ok: true });
                return Ok(());
            }
            for axis in &mut self.axes {
                if let Err(err) = axis
                    .advance(&self.config, &self.sensor, &self.meter, &self.events)
                    .await
                {
                    let _ = self.events.send(OptimizerEvent::Stopped { ok: false });
                    return Err(err);
                }
            }
        }
    }
}
