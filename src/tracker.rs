//! Hysteresis-aware wavelength→angle tracker for the bandpass filter stage.
//!
//! Once per tick the tracker reads the wavelength meter, computes the target
//! filter angle from the active calibration curve, and commands the stage,
//! unless the deadband or validity gate says otherwise. The gate suppresses
//! motor chatter: no command when the wavelength is outside the filter's
//! valid range, or when the candidate angle matches the current angle to
//! two decimals.
//!
//! Backlash is handled by curve selection, not by motor compensation: when
//! the stage has to travel downward the high-to-low curve is used, upward
//! the low-to-high curve, so the commanded angle always comes from the
//! calibration measured in the actual direction of travel.
//!
//! A transport error on either device stops the loop and reports a stage
//! fault; the loop does not resume on its own, and collaborators such as an
//! active temperature sweep must treat the fault as "abort and disable
//! tracking".

use crate::calibration::table::{round_to, CalibrationTable, ScanDirection, SharedTable};
use crate::control::StopToken;
use crate::error::{BenchError, BenchResult};
use crate::hardware::{RotationStage, WavelengthSource};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Tracker tuning parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct TrackerConfig {
    /// Wavelength validity window in nm (exclusive bounds).
    #[serde(default = "default_valid_range")]
    pub valid_range_nm: (f64, f64),
    /// Control tick period.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
}

fn default_valid_range() -> (f64, f64) {
    (1027.0, 1032.0)
}
fn default_tick() -> Duration {
    Duration::from_millis(10)
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            valid_range_nm: default_valid_range(),
            tick: default_tick(),
        }
    }
}

/// A stage command produced by one tracking decision.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AngleCommand {
    pub angle_deg: f64,
    /// Curve the angle was computed from (matches the travel direction).
    pub curve: ScanDirection,
}

/// Mutable tracker state, advanced once per tick.
#[derive(Debug, Clone, Copy)]
pub struct TrackerState {
    active_curve: ScanDirection,
    last_commanded_angle: f64,
}

impl Default for TrackerState {
    fn default() -> Self {
        Self {
            active_curve: ScanDirection::LowToHigh,
            last_commanded_angle: f64::NAN,
        }
    }
}

impl TrackerState {
    pub fn active_curve(&self) -> ScanDirection {
        self.active_curve
    }

    pub fn last_commanded_angle(&self) -> f64 {
        self.last_commanded_angle
    }

    /// One tracking decision: wavelength sample + current stage angle in,
    /// optional stage command out.
    pub fn decide(
        &mut self,
        wavelength_nm: f64,
        current_angle: f64,
        table: &CalibrationTable,
        config: &TrackerConfig,
    ) -> Option<AngleCommand> {
        let (lo, hi) = config.valid_range_nm;
        if !(wavelength_nm > lo && wavelength_nm < hi) {
            return None;
        }

        let mut candidate = table.angle_for(wavelength_nm, self.active_curve);
        if round_to(current_angle, 2) == round_to(candidate, 2) {
            return None;
        }

        // Pick the curve matching the actual direction of travel, then
        // recompute the target from it.
        if current_angle > candidate {
            self.active_curve = ScanDirection::HighToLow;
            candidate = table.angle_for(wavelength_nm, self.active_curve);
        } else if current_angle < candidate {
            self.active_curve = ScanDirection::LowToHigh;
            candidate = table.angle_for(wavelength_nm, self.active_curve);
        }

        self.last_commanded_angle = candidate;
        Some(AngleCommand {
            angle_deg: candidate,
            curve: self.active_curve,
        })
    }
}

/// Status events emitted by the tracking loop.
#[derive(Debug, Clone)]
pub enum TrackerEvent {
    Started,
    /// A new angle was commanded for the given wavelength.
    Moved {
        wavelength_nm: f64,
        angle_deg: f64,
        curve: ScanDirection,
    },
    /// Transport fault on the stage or meter; the loop has stopped.
    StageFault { message: String },
    Stopped { ok: bool },
}

/// The tracking loop. Owns the stage axis for as long as it runs.
pub struct AngleTracker {
    config: TrackerConfig,
    table: SharedTable,
    meter: Arc<dyn WavelengthSource>,
    stage: Arc<dyn RotationStage>,
    state: TrackerState,
    events: mpsc::UnboundedSender<TrackerEvent>,
}

impl AngleTracker {
    pub fn new(
        config: TrackerConfig,
        table: SharedTable,
        meter: Arc<dyn WavelengthSource>,
        stage: Arc<dyn RotationStage>,
    ) -> (Self, mpsc::UnboundedReceiver<TrackerEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                table,
                meter,
                stage,
                state: TrackerState::default(),
                events,
            },
            rx,
        )
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    /// Run until stopped or a transport fault ends the loop.
    pub async fn run(&mut self, stop: StopToken) -> BenchResult<()> {
        let _ = self.events.send(TrackerEvent::Started);

        loop {
            if stop.is_stopped() {
                let _ = self.events.send(TrackerEvent::Stopped { ok: true });
                return Ok(());
            }

            if let Err(err) = self.tick().await {
                warn!(%err, "tracker stopping on fault");
                let _ = self.events.send(TrackerEvent::StageFault {
                    message: err.to_string(),
                });
                let _ = self.events.send(TrackerEvent::Stopped { ok: false });
                return Err(err);
            }

            tokio::time::sleep(self.config.tick).await;
        }
    }

    async fn tick(&mut self) -> BenchResult<()> {
        let wavelength = self
            .meter
            .wavelength_nm()
            .await
            .map_err(BenchError::transport)?;
        let current = self
            .stage
            .position()
            .await
            .map_err(BenchError::transport)?;

        let table = self.table.snapshot().await;
        if let Some(command) = self
            .state
            .decide(wavelength, current, &table, &self.config)
        {
            self.stage
                .move_to(command.angle_deg)
                .await
                .map_err(BenchError::transport)?;
            debug!(
                wavelength,
                angle = command.angle_deg,
                curve = %command.curve,
                "tracking move"
            );
            let _ = self.events.send(TrackerEvent::Moved {
                wavelength_nm: wavelength,
                angle_deg: command.angle_deg,
                curve: command.curve,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::calibration::table::CalibrationCurve;

    fn table() -> CalibrationTable {
        CalibrationTable::new(
            CalibrationCurve::new(0.5, -400.0),
            CalibrationCurve::new(0.52, -420.6),
        )
    }

    #[test]
    fn out_of_range_wavelength_is_ignored() {
        let mut state = TrackerState::default();
        let config = TrackerConfig::default();
        assert!(state.decide(1026.9, 100.0, &table(), &config).is_none());
        assert!(state.decide(1032.0, 100.0, &table(), &config).is_none());
    }

    #[test]
    fn deadband_suppresses_chatter() {
        let mut state = TrackerState::default();
        let config = TrackerConfig::default();
        // low-to-high candidate for 1029.0 is 0.5*1029 - 400 = 114.5.
        assert!(state.decide(1029.0, 114.504, &table(), &config).is_none());
        assert!(state.decide(1029.0, 114.496, &table(), &config).is_none());
    }

    #[test]
    fn upward_travel_uses_low_to_high_curve() {
        let mut state = TrackerState::default();
        let config = TrackerConfig::default();
        let cmd = state.decide(1029.0, 113.0, &table(), &config).unwrap();
        assert_eq!(cmd.curve, ScanDirection::LowToHigh);
        assert_eq!(cmd.angle_deg, 114.5);
    }

    #[test]
    fn downward_travel_switches_to_high_to_low_curve() {
        let mut state = TrackerState::default();
        let config = TrackerConfig::default();
        let cmd = state.decide(1029.0, 120.0, &table(), &config).unwrap();
        assert_eq!(cmd.curve, ScanDirection::HighToLow);
        // high-to-low candidate: 0.52*1029 - 420.6 = 114.48.
        assert_eq!(cmd.angle_deg, 114.48);
        assert_eq!(state.active_curve(), ScanDirection::HighToLow);
    }

    #[test]
    fn curve_switch_sticks_until_direction_reverses() {
        let mut state = TrackerState::default();
        let config = TrackerConfig::default();

        // Falling wavelength: stage above candidate, high-to-low active.
        let cmd = state.decide(1029.0, 120.0, &table(), &config).unwrap();
        let mut angle = cmd.angle_deg;
        assert_eq!(state.active_curve(), ScanDirection::HighToLow);

        // Still falling: candidate computed from high-to-low directly.
        let cmd = state.decide(1028.0, angle, &table(), &config).unwrap();
        assert_eq!(cmd.curve, ScanDirection::HighToLow);
        angle = cmd.angle_deg;

        // Rising again: switches back to low-to-high.
        let cmd = state.decide(1030.0, angle, &table(), &config).unwrap();
        assert_eq!(cmd.curve, ScanDirection::LowToHigh);
    }
}
