//! Two-pass calibration pipeline.
//!
//! Drives the tunable source through a list of temperature setpoints; at
//! each setpoint the filter stage is swept across a fixed angular range in
//! both directions at low speed while `(time, wavelength, power, angle)` is
//! logged every control tick. Each leg's power-vs-angle trace is fitted to
//! the flat-top Gaussian; the per-leg peak angles `x0` are then regressed
//! against wavelength independently per scan direction, yielding the two
//! linear calibration curves.
//!
//! Phases: `Begin → ScanningLeg(direction) → Fitting → next setpoint | Done`.
//! `Begin` approaches the start angle with backlash compensation enabled,
//! then disables it and records the reference time, so all leg timing is
//! free of backlash settling artifacts.
//!
//! Publication is all-or-nothing: a single non-converging leg aborts the
//! run with a typed error naming the wavelength and direction, and no table
//! is produced. Every wait (motor settle, sweep completion, thermal settle)
//! is bounded and observes the stop token.

use crate::calibration::fit::{fit_flat_top, linear_fit, FitBounds, FlatTopParams};
use crate::calibration::table::{
    CalibrationCurve, CalibrationTable, ScanDirection, SharedTable, LASTUSED_CALPAR,
};
use crate::control::{poll_until, StopToken};
use crate::error::{BenchError, BenchResult};
use crate::hardware::{OvenController, PowerSensor, RotationStage, WavelengthSource};
use crate::storage::{LegSample, LegSampleWriter};
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info};

/// Configuration for a calibration run.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Oven temperature setpoints to visit, in °C.
    pub setpoints_c: Vec<f64>,
    /// Oven ramp rate in °C/min.
    #[serde(default = "default_ramp_rate")]
    pub ramp_rate_c_per_min: f64,
    /// Angular range swept at each setpoint, in degrees.
    pub start_angle_deg: f64,
    pub end_angle_deg: f64,
    /// Velocity for the initial approach to the start angle.
    #[serde(default = "default_approach_velocity")]
    pub approach_velocity_deg_s: f64,
    /// Velocity during measurement sweeps (about half the approach speed).
    #[serde(default = "default_scan_velocity")]
    pub scan_velocity_deg_s: f64,
    /// Backlash compensation distance (motor steps) during the approach.
    #[serde(default = "default_approach_backlash")]
    pub approach_backlash_steps: i64,
    /// Position tolerance for "arrived at start angle".
    #[serde(default = "default_angle_tolerance")]
    pub angle_tolerance_deg: f64,
    /// Oven temperature tolerance for "thermally settled".
    #[serde(default = "default_thermal_tolerance")]
    pub thermal_tolerance_c: f64,
    /// Sampling/control tick during sweeps.
    #[serde(with = "humantime_serde", default = "default_tick")]
    pub tick: Duration,
    /// Extra dwell after the oven reaches tolerance.
    #[serde(with = "humantime_serde", default = "default_thermal_dwell")]
    pub thermal_dwell: Duration,
    /// Deadline for the motor to settle at the start angle.
    #[serde(with = "humantime_serde", default = "default_settle_timeout")]
    pub settle_timeout: Duration,
    /// Deadline for one sweep leg to report motor idle.
    #[serde(with = "humantime_serde", default = "default_leg_timeout")]
    pub leg_timeout: Duration,
    /// Deadline for the oven to reach a setpoint.
    #[serde(with = "humantime_serde", default = "default_thermal_timeout")]
    pub thermal_timeout: Duration,
    /// Lower/upper box bounds for the flat-top fit, `[B, x0, a, n, y0]`.
    pub fit_lower: [f64; 5],
    pub fit_upper: [f64; 5],
    /// Directory for raw sample files and the parameter file.
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
}

fn default_ramp_rate() -> f64 {
    2.0
}
fn default_approach_velocity() -> f64 {
    10.0
}
fn default_scan_velocity() -> f64 {
    5.0
}
fn default_approach_backlash() -> i64 {
    136_533
}
fn default_angle_tolerance() -> f64 {
    0.1
}
fn default_thermal_tolerance() -> f64 {
    0.1
}
fn default_tick() -> Duration {
    Duration::from_millis(10)
}
fn default_thermal_dwell() -> Duration {
    Duration::from_secs(30)
}
fn default_settle_timeout() -> Duration {
    Duration::from_secs(120)
}
fn default_leg_timeout() -> Duration {
    Duration::from_secs(300)
}
fn default_thermal_timeout() -> Duration {
    Duration::from_secs(600)
}
fn default_output_dir() -> PathBuf {
    PathBuf::from("calibration")
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            setpoints_c: vec![30.0, 40.0, 50.0, 60.0],
            ramp_rate_c_per_min: default_ramp_rate(),
            start_angle_deg: 110.0,
            end_angle_deg: 120.0,
            approach_velocity_deg_s: default_approach_velocity(),
            scan_velocity_deg_s: default_scan_velocity(),
            approach_backlash_steps: default_approach_backlash(),
            angle_tolerance_deg: default_angle_tolerance(),
            thermal_tolerance_c: default_thermal_tolerance(),
            tick: default_tick(),
            thermal_dwell: default_thermal_dwell(),
            settle_timeout: default_settle_timeout(),
            leg_timeout: default_leg_timeout(),
            thermal_timeout: default_thermal_timeout(),
            fit_lower: [0.0, 110.0, 0.05, 1.0, -0.01],
            fit_upper: [1.0, 120.0, 5.0, 10.0, 0.1],
            output_dir: default_output_dir(),
        }
    }
}

/// Current phase of the pipeline, for external observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelinePhase {
    Begin,
    ScanningLeg(ScanDirection),
    Fitting(ScanDirection),
    Done,
}

/// Fit result for one completed leg.
#[derive(Debug, Clone, Copy)]
pub struct LegFit {
    pub setpoint_c: f64,
    pub wavelength_nm: f64,
    pub direction: ScanDirection,
    pub params: FlatTopParams,
}

/// Everything a successful run produced.
#[derive(Debug)]
pub struct CalibrationOutcome {
    pub table: CalibrationTable,
    pub legs: Vec<LegFit>,
    /// Path of the written parameter file.
    pub calpar_path: PathBuf,
}

/// The calibration pipeline. One instance per run; hardware handles are
/// owned exclusively for the duration (single writer per axis).
pub struct CalibrationPipeline {
    config: PipelineConfig,
    stage: Arc<dyn RotationStage>,
    meter: Arc<dyn WavelengthSource>,
    sensor: Arc<dyn PowerSensor>,
    oven: Arc<dyn OvenController>,
    progress_tx: watch::Sender<u8>,
    phase: PipelinePhase,
}

impl CalibrationPipeline {
    pub fn new(
        config: PipelineConfig,
        stage: Arc<dyn RotationStage>,
        meter: Arc<dyn WavelengthSource>,
        sensor: Arc<dyn PowerSensor>,
        oven: Arc<dyn OvenController>,
    ) -> (Self, watch::Receiver<u8>) {
        let (progress_tx, progress_rx) = watch::channel(0);
        (
            Self {
                config,
                stage,
                meter,
                sensor,
                oven,
                progress_tx,
                phase: PipelinePhase::Begin,
            },
            progress_rx,
        )
    }

    pub fn phase(&self) -> PipelinePhase {
        self.phase
    }

    /// Run the full calibration and return the fitted table without
    /// publishing it anywhere.
    pub async fn run(&mut self, stop: &StopToken) -> BenchResult<CalibrationOutcome> {
        if self.config.setpoints_c.is_empty() {
            return Err(BenchError::InvalidInput(
                "calibration needs at least one temperature setpoint".into(),
            ));
        }

        let reference = self.begin(stop).await?;
        let total = self.config.setpoints_c.len();
        let mut legs = Vec::with_capacity(total * 2);

        let setpoints = self.config.setpoints_c.clone();
        for (iteration, &setpoint) in setpoints.iter().enumerate() {
            self.report_progress(iteration, 0.0, total);

            // One oven move per setpoint, issued when entering the
            // low-to-high leg.
            self.set_temperature(setpoint, stop).await?;

            let mut direction = ScanDirection::LowToHigh;
            for half in 0..2 {
                self.phase = PipelinePhase::ScanningLeg(direction);
                let samples = self.scan_leg(setpoint, direction, reference, stop).await?;

                self.phase = PipelinePhase::Fitting(direction);
                legs.push(self.fit_leg(setpoint, direction, &samples)?);

                self.report_progress(iteration, 0.5 * (half as f64 + 1.0), total);
                direction = direction.toggled();
            }
        }

        let table = self.regress(&legs)?;
        let calpar_path = self.config.output_dir.join(LASTUSED_CALPAR);
        table.save(&calpar_path).map_err(BenchError::transport)?;

        self.phase = PipelinePhase::Done;
        info!(
            legs = legs.len(),
            calpar = %calpar_path.display(),
            "calibration complete"
        );
        Ok(CalibrationOutcome {
            table,
            legs,
            calpar_path,
        })
    }

    /// Run and, on success, atomically replace the active table.
    pub async fn run_into(
        &mut self,
        shared: &SharedTable,
        stop: &StopToken,
    ) -> BenchResult<CalibrationOutcome> {
        let outcome = self.run(stop).await?;
        shared.replace(outcome.table).await;
        Ok(outcome)
    }

    /// Approach the start angle with backlash compensation, then disable it
    /// and record the leg timing reference.
    async fn begin(&mut self, stop: &StopToken) -> BenchResult<Instant> {
        self.phase = PipelinePhase::Begin;
        let cfg = &self.config;

        self.stage
            .set_backlash(cfg.approach_backlash_steps)
            .await
            .map_err(BenchError::transport)?;
        self.stage
            .set_velocity(cfg.approach_velocity_deg_s)
            .await
            .map_err(BenchError::transport)?;
        self.stage
            .move_to(cfg.start_angle_deg)
            .await
            .map_err(BenchError::transport)?;

        let stage = Arc::clone(&self.stage);
        let target = cfg.start_angle_deg;
        let tolerance = cfg.angle_tolerance_deg;
        poll_until(
            "stage settled at start angle",
            cfg.settle_timeout,
            cfg.tick,
            stop,
            || {
                let stage = Arc::clone(&stage);
                async move {
                    let moving = stage.is_moving().await.map_err(BenchError::transport)?;
                    if moving {
                        return Ok(false);
                    }
                    let pos = stage.position().await.map_err(BenchError::transport)?;
                    Ok((pos - target).abs() <= tolerance)
                }
            },
        )
        .await?;

        self.stage
            .set_backlash(0)
            .await
            .map_err(BenchError::transport)?;
        debug!(angle = cfg.start_angle_deg, "begin phase complete");
        Ok(Instant::now())
    }

    /// Command the oven and wait for thermal settle plus the dwell.
    async fn set_temperature(&self, setpoint: f64, stop: &StopToken) -> BenchResult<()> {
        // A rejected setpoint surfaces as InvalidInput; anything else on
        // the oven link is a transport fault.
        self.oven
            .set_setpoint(setpoint, self.config.ramp_rate_c_per_min)
            .await
            .map_err(|err| match err.downcast::<BenchError>() {
                Ok(bench) => bench,
                Err(err) => BenchError::transport(err),
            })?;

        let oven = Arc::clone(&self.oven);
        let tolerance = self.config.thermal_tolerance_c;
        poll_until(
            "oven at setpoint",
            self.config.thermal_timeout,
            self.config.tick.max(Duration::from_millis(100)),
            stop,
            || {
                let oven = Arc::clone(&oven);
                async move {
                    let actual = oven.read_actual().await.map_err(BenchError::transport)?;
                    Ok((actual - setpoint).abs() <= tolerance)
                }
            },
        )
        .await?;

        tokio::time::sleep(self.config.thermal_dwell).await;
        debug!(setpoint, "thermal settle complete");
        Ok(())
    }

    /// Sweep one leg, logging a sample every tick until the motor is idle.
    async fn scan_leg(
        &self,
        setpoint: f64,
        direction: ScanDirection,
        reference: Instant,
        stop: &StopToken,
    ) -> BenchResult<Vec<LegSample>> {
        let cfg = &self.config;
        let target = match direction {
            ScanDirection::LowToHigh => cfg.end_angle_deg,
            ScanDirection::HighToLow => cfg.start_angle_deg,
        };

        let mut writer = LegSampleWriter::create(&cfg.output_dir, setpoint, direction)
            .map_err(BenchError::transport)?;

        self.stage
            .set_velocity(cfg.scan_velocity_deg_s)
            .await
            .map_err(BenchError::transport)?;
        self.stage
            .move_to(target)
            .await
            .map_err(BenchError::transport)?;

        let leg_started = Instant::now();
        let mut samples = Vec::new();
        loop {
            stop.check()?;
            if leg_started.elapsed() >= cfg.leg_timeout {
                return Err(BenchError::Timeout {
                    what: "sweep leg motor idle",
                    waited_ms: leg_started.elapsed().as_millis() as u64,
                });
            }
            if !self
                .stage
                .is_moving()
                .await
                .map_err(BenchError::transport)?
            {
                break;
            }

            let sample = LegSample {
                time_s: reference.elapsed().as_secs_f64(),
                wavelength_nm: self
                    .meter
                    .wavelength_nm()
                    .await
                    .map_err(BenchError::transport)?,
                power_w: self
                    .sensor
                    .read_power()
                    .await
                    .map_err(BenchError::transport)?,
                angle_deg: self
                    .stage
                    .position()
                    .await
                    .map_err(BenchError::transport)?,
            };
            writer.write(&sample).map_err(BenchError::transport)?;
            samples.push(sample);

            tokio::time::sleep(cfg.tick).await;
        }

        let path = writer.finish().map_err(BenchError::transport)?;
        debug!(
            setpoint,
            %direction,
            samples = samples.len(),
            file = %path.display(),
            "leg complete"
        );
        Ok(samples)
    }

    /// Fit one leg's power-vs-angle trace to the flat-top model.
    fn fit_leg(
        &self,
        setpoint: f64,
        direction: ScanDirection,
        samples: &[LegSample],
    ) -> BenchResult<LegFit> {
        let wavelength_nm = mean(samples.iter().map(|s| s.wavelength_nm));
        let angles: Vec<f64> = samples.iter().map(|s| s.angle_deg).collect();
        let powers: Vec<f64> = samples.iter().map(|s| s.power_w).collect();

        let bounds = FitBounds {
            lower: self.config.fit_lower,
            upper: self.config.fit_upper,
        };
        let params = fit_flat_top(&angles, &powers, &bounds).map_err(|err| {
            debug!(%err, wavelength_nm, %direction, "leg fit failed");
            BenchError::FitConvergence {
                wavelength_nm,
                direction,
            }
        })?;

        info!(
            setpoint,
            wavelength_nm,
            %direction,
            peak_angle = params.center,
            "leg fitted"
        );
        Ok(LegFit {
            setpoint_c: setpoint,
            wavelength_nm,
            direction,
            params,
        })
    }

    /// Regress peak angle vs wavelength independently per direction.
    fn regress(&self, legs: &[LegFit]) -> BenchResult<CalibrationTable> {
        let mut curves = [CalibrationCurve::new(0.0, 0.0); 2];
        for (slot, direction) in [ScanDirection::LowToHigh, ScanDirection::HighToLow]
            .into_iter()
            .enumerate()
        {
            let wavelengths: Vec<f64> = legs
                .iter()
                .filter(|leg| leg.direction == direction)
                .map(|leg| leg.wavelength_nm)
                .collect();
            let centers: Vec<f64> = legs
                .iter()
                .filter(|leg| leg.direction == direction)
                .map(|leg| leg.params.center)
                .collect();

            let (slope, intercept) = linear_fit(&wavelengths, &centers).map_err(|_| {
                BenchError::FitConvergence {
                    wavelength_nm: wavelengths.first().copied().unwrap_or(f64::NAN),
                    direction,
                }
            })?;
            curves[slot] = CalibrationCurve::new(slope, intercept);
        }
        Ok(CalibrationTable::new(curves[0], curves[1]))
    }

    fn report_progress(&self, iteration: usize, phase_weight: f64, total: usize) {
        let percent = ((iteration as f64 + phase_weight) / total as f64 * 100.0)
            .clamp(0.0, 100.0) as u8;
        let _ = self.progress_tx.send(percent);
    }
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let mut sum = 0.0;
    let mut count = 0usize;
    for value in values {
        sum += value;
        count += 1;
    }
    if count == 0 {
        f64::NAN
    } else {
        sum / count as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn progress_formula_matches_phase_weights() {
        // 5 setpoints: mid-leg of the third iteration is (2 + 0.5)/5 = 50 %.
        let (tx, rx) = watch::channel(0u8);
        let percent = ((2.0_f64 + 0.5) / 5.0 * 100.0).clamp(0.0, 100.0) as u8;
        tx.send(percent).unwrap();
        assert_eq!(*rx.borrow(), 50);

        let done = ((4.0_f64 + 1.0) / 5.0 * 100.0).clamp(0.0, 100.0) as u8;
        assert_eq!(done, 100);
    }
}
