//! Feed-forward oven temperature control.
//!
//! The crystal's phase-matching temperature is a linear function of the
//! pump wavelength, so no feedback loop is needed: each tick reads the
//! wavelength and, when it sits inside the valid window, commands the
//! pre-measured linear setpoint to the oven. Writes are throttled on the
//! wavelength, not the temperature: a new setpoint goes out only when the
//! wavelength has moved by at least `min_wavelength_delta_nm` since the
//! last commanded one, which keeps the serial link quiet while the laser
//! holds still. The actual oven temperature is read and reported every
//! tick regardless, so an operator always sees the real crystal state.

use crate::control::StopToken;
use crate::error::{BenchError, BenchResult};
use crate::hardware::{OvenController, WavelengthSource};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Feed-forward tuning parameters.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedForwardConfig {
    /// Wavelength window (exclusive bounds) in which setpoints are issued.
    #[serde(default = "default_window")]
    pub valid_range_nm: (f64, f64),
    /// Setpoint model offset: `setpoint = offset - slope * wavelength`.
    #[serde(default = "default_offset")]
    pub offset_c: f64,
    /// Setpoint model slope in degC per nm.
    #[serde(default = "default_slope")]
    pub slope_c_per_nm: f64,
    /// Ramp rate commanded with every setpoint, in degC per minute.
    #[serde(default = "default_ramp")]
    pub ramp_c_per_min: f64,
    /// Minimum wavelength change before a new setpoint is commanded.
    #[serde(default = "default_min_delta")]
    pub min_wavelength_delta_nm: f64,
    /// Loop period.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
}

fn default_window() -> (f64, f64) {
    (1028.0, 1032.0)
}
fn default_offset() -> f64 {
    1357.13
}
fn default_slope() -> f64 {
    1.1369
}
fn default_ramp() -> f64 {
    2.0
}
fn default_min_delta() -> f64 {
    0.001
}
fn default_tick() -> Duration {
    Duration::from_millis(500)
}

impl Default for FeedForwardConfig {
    fn default() -> Self {
        Self {
            valid_range_nm: default_window(),
            offset_c: default_offset(),
            slope_c_per_nm: default_slope(),
            ramp_c_per_min: default_ramp(),
            min_wavelength_delta_nm: default_min_delta(),
            tick: default_tick(),
        }
    }
}

impl FeedForwardConfig {
    /// Model temperature for a wavelength, rounded to 0.01 degC (the
    /// oven's command resolution).
    pub fn setpoint_for(&self, wavelength_nm: f64) -> f64 {
        let setpoint = self.offset_c - self.slope_c_per_nm * wavelength_nm;
        (setpoint * 100.0).round() / 100.0
    }

    fn in_window(&self, wavelength_nm: f64) -> bool {
        wavelength_nm > self.valid_range_nm.0 && wavelength_nm < self.valid_range_nm.1
    }
}

/// Status events emitted by the feed-forward loop.
#[derive(Debug, Clone)]
pub enum FeedForwardEvent {
    Started,
    /// A new setpoint was commanded.
    SetpointCommanded {
        wavelength_nm: f64,
        setpoint_c: f64,
    },
    /// Actual oven temperature, reported every tick.
    ActualTemperature { temperature_c: f64 },
    Stopped { ok: bool },
}

/// Wavelength-driven oven setpoint loop.
pub struct FeedForward {
    config: FeedForwardConfig,
    meter: Arc<dyn WavelengthSource>,
    oven: Arc<dyn OvenController>,
    last_commanded_nm: Option<f64>,
    events: mpsc::UnboundedSender<FeedForwardEvent>,
}

impl FeedForward {
    pub fn new(
        config: FeedForwardConfig,
        meter: Arc<dyn WavelengthSource>,
        oven: Arc<dyn OvenController>,
    ) -> (Self, mpsc::UnboundedReceiver<FeedForwardEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                config,
                meter,
                oven,
                last_commanded_nm: None,
                events,
            },
            rx,
        )
    }

    /// Decide whether a wavelength reading warrants a new setpoint.
    ///
    /// Returns the setpoint to command, or `None` when the reading is out
    /// of window or inside the throttle deadband.
    fn decide(&self, wavelength_nm: f64) -> Option<f64> {
        if !self.config.in_window(wavelength_nm) {
            return None;
        }
        if let Some(last) = self.last_commanded_nm {
            if (wavelength_nm - last).abs() <= self.config.min_wavelength_delta_nm {
                return None;
            }
        }
        Some(self.config.setpoint_for(wavelength_nm))
    }

    /// One tick: read the wavelength, possibly command a setpoint, always
    /// read back the actual temperature. Exposed for deterministic tests.
    pub async fn tick_once(&mut self) -> BenchResult<()> {
        let wavelength = self
            .meter
            .wavelength_nm()
            .await
            .map_err(BenchError::transport)?;

        if let Some(setpoint) = self.decide(wavelength) {
            match self
                .oven
                .set_setpoint(setpoint, self.config.ramp_c_per_min)
                .await
            {
                Ok(()) => {
                    self.last_commanded_nm = Some(wavelength);
                    debug!(wavelength, setpoint, "oven setpoint commanded");
                    let _ = self.events.send(FeedForwardEvent::SetpointCommanded {
                        wavelength_nm: wavelength,
                        setpoint_c: setpoint,
                    });
                }
                Err(err) => {
                    // A rejected setpoint (out of the oven's hard limits)
                    // is an operator problem, not a link fault; keep the
                    // loop alive and keep reporting the actual value.
                    let bench = match err.downcast::<BenchError>() {
                        Ok(bench) => bench,
                        Err(err) => BenchError::transport(err),
                    };
                    if bench.is_fatal() {
                        return Err(bench);
                    }
                    warn!(wavelength, setpoint, error = %bench, "oven rejected setpoint");
                }
            }
        }

        let actual = self
            .oven
            .read_actual()
            .await
            .map_err(BenchError::transport)?;
        let _ = self
            .events
            .send(FeedForwardEvent::ActualTemperature { temperature_c: actual });
        Ok(())
    }

    /// Run until stopped; transport faults terminate the loop.
    pub async fn run(&mut self, stop: StopToken) -> BenchResult<()> {
        info!(
            window = ?self.config.valid_range_nm,
            offset = self.config.offset_c,
            slope = self.config.slope_c_per_nm,
            "feed-forward loop started"
        );
        let _ = self.events.send(FeedForwardEvent::Started);

        loop {
            if stop.is_stopped() {
                let _ = self.events.send(FeedForwardEvent::Stopped { ok: true });
                return Ok(());
            }
            if let Err(err) = self.tick_once().await {
                warn!(error = %err, "feed-forward loop fault");
                let _ = self.events.send(FeedForwardEvent::Stopped { ok: false });
                return Err(err);
            }
            tokio::time::sleep(self.config.tick).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockOven, MockWavelengthMeter};

    fn loop_with(wavelength: f64) -> (FeedForward, Arc<MockOven>) {
        let meter = Arc::new(MockWavelengthMeter::fixed(wavelength));
        let oven = Arc::new(MockOven::new(22.0));
        let (ff, _rx) = FeedForward::new(
            FeedForwardConfig::default(),
            meter,
            oven.clone() as Arc<dyn OvenController>,
        );
        (ff, oven)
    }

    #[test]
    fn setpoint_model_matches_hand_calibration() {
        let config = FeedForwardConfig::default();
        // 1357.13 - 1.1369 * 1030 = 186.12 (rounded to 0.01).
        assert_eq!(config.setpoint_for(1030.0), 186.12);
    }

    #[test]
    fn window_bounds_are_exclusive() {
        let config = FeedForwardConfig::default();
        assert!(!config.in_window(1028.0));
        assert!(!config.in_window(1032.0));
        assert!(config.in_window(1028.001));
        assert!(config.in_window(1031.999));
    }

    #[tokio::test]
    async fn out_of_window_reading_commands_nothing() {
        let (mut ff, oven) = loop_with(1027.5);
        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 0);
    }

    #[tokio::test]
    async fn throttle_suppresses_sub_threshold_moves() {
        let meter = Arc::new(MockWavelengthMeter::fixed(1030.0));
        let oven = Arc::new(MockOven::new(22.0));
        let (mut ff, _rx) = FeedForward::new(
            FeedForwardConfig::default(),
            meter.clone(),
            oven.clone() as Arc<dyn OvenController>,
        );

        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 1);

        meter.set_wavelength(1030.0005);
        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 1);

        meter.set_wavelength(1030.002);
        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 2);
    }

    #[tokio::test]
    async fn delta_equal_to_threshold_is_still_suppressed() {
        let meter = Arc::new(MockWavelengthMeter::fixed(1030.0));
        let oven = Arc::new(MockOven::new(22.0));
        // Threshold is a power of two so the delta below computes exactly.
        let config = FeedForwardConfig {
            min_wavelength_delta_nm: 0.000244140625,
            ..FeedForwardConfig::default()
        };
        let (mut ff, _rx) =
            FeedForward::new(config, meter.clone(), oven.clone() as Arc<dyn OvenController>);

        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 1);

        meter.set_wavelength(1030.000244140625);
        ff.tick_once().await.unwrap();
        assert_eq!(oven.write_count(), 1);
    }

    #[tokio::test]
    async fn actual_temperature_reported_every_tick() {
        let (mut ff, _oven) = loop_with(1027.0);
        let (events, mut rx) = mpsc::unbounded_channel();
        ff.events = events;
        ff.tick_once().await.unwrap();
        match rx.try_recv().unwrap() {
            FeedForwardEvent::ActualTemperature { temperature_c } => {
                assert!((temperature_c - 22.0).abs() < 1e-9);
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
