//! Mock bench hardware.
//!
//! Simulated devices for tests and `--mock` runs, covering every capability
//! trait. The mocks are deterministic unless noise is explicitly enabled,
//! and they use tokio time throughout so tests can run under paused time.
//!
//! Two synthetic optics models tie the devices together the way the real
//! bench does:
//!
//! - [`MockFilterPower`]: power seen behind the bandpass filter as a
//!   flat-top Gaussian of the stage angle, with the transmission peak angle
//!   a linear function of the current wavelength. Drives calibration
//!   pipeline tests.
//! - [`MockUvPower`]: UV power as a Gaussian of the picomotor step
//!   position, with the peak position a linear function of wavelength.
//!   Drives hill-climb and failsafe tests.

use anyhow::{bail, Result};
use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::time::Instant;

use crate::hardware::capabilities::{
    LinearActuator, OvenController, PowerSensor, RotationStage, WavelengthSource,
};

fn lock_poisoned() -> anyhow::Error {
    anyhow::anyhow!("mock state lock poisoned")
}

// =============================================================================
// MockWavelengthMeter
// =============================================================================

enum MeterMode {
    Fixed(f64),
    /// Wavelength follows the oven's actual temperature linearly, the way
    /// the tunable source follows its diode temperature.
    OvenLinked {
        oven: Arc<MockOven>,
        wl_at_ref_nm: f64,
        ref_temp_c: f64,
        nm_per_c: f64,
    },
}

/// Simulated wavelength meter.
pub struct MockWavelengthMeter {
    mode: Mutex<MeterMode>,
    fail: AtomicBool,
}

impl MockWavelengthMeter {
    pub fn fixed(wavelength_nm: f64) -> Self {
        Self {
            mode: Mutex::new(MeterMode::Fixed(wavelength_nm)),
            fail: AtomicBool::new(false),
        }
    }

    /// Wavelength tracks `oven`'s actual temperature:
    /// `wl = wl_at_ref + nm_per_c * (temp - ref_temp)`.
    pub fn oven_linked(oven: Arc<MockOven>, wl_at_ref_nm: f64, ref_temp_c: f64, nm_per_c: f64) -> Self {
        Self {
            mode: Mutex::new(MeterMode::OvenLinked {
                oven,
                wl_at_ref_nm,
                ref_temp_c,
                nm_per_c,
            }),
            fail: AtomicBool::new(false),
        }
    }

    /// Override the reported wavelength (switches to fixed mode).
    pub fn set_wavelength(&self, wavelength_nm: f64) {
        if let Ok(mut mode) = self.mode.lock() {
            *mode = MeterMode::Fixed(wavelength_nm);
        }
    }

    /// Make every subsequent read fail, simulating a dropped meter link.
    pub fn fail_reads(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl WavelengthSource for MockWavelengthMeter {
    async fn wavelength_nm(&self) -> Result<f64> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("wavelength meter link lost");
        }
        let mode = self.mode.lock().map_err(|_| lock_poisoned())?;
        match &*mode {
            MeterMode::Fixed(wl) => Ok(*wl),
            MeterMode::OvenLinked {
                oven,
                wl_at_ref_nm,
                ref_temp_c,
                nm_per_c,
            } => {
                let temp = oven.actual_temp();
                Ok(wl_at_ref_nm + nm_per_c * (temp - ref_temp_c))
            }
        }
    }
}

// =============================================================================
// MockRotationStage
// =============================================================================

struct StageState {
    origin: f64,
    target: f64,
    started: Instant,
    velocity_deg_s: f64,
    backlash_steps: i64,
}

/// Simulated filter rotation stage.
///
/// Moves at the commanded velocity using tokio time, so `is_moving` and
/// `position` behave like the real stage during a sweep. A velocity of
/// `f64::INFINITY` makes moves snap.
pub struct MockRotationStage {
    state: Mutex<StageState>,
    fail: AtomicBool,
}

impl MockRotationStage {
    pub fn new(initial_deg: f64) -> Self {
        Self {
            state: Mutex::new(StageState {
                origin: initial_deg,
                target: initial_deg,
                started: Instant::now(),
                velocity_deg_s: f64::INFINITY,
                backlash_steps: 0,
            }),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail, simulating a dropped serial link.
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Currently configured backlash compensation distance.
    pub fn backlash_steps(&self) -> i64 {
        self.state.lock().map(|s| s.backlash_steps).unwrap_or(0)
    }

    fn check_fault(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("rotation stage serial link lost");
        }
        Ok(())
    }

    fn position_now(state: &StageState) -> f64 {
        let span = state.target - state.origin;
        if span == 0.0 || state.velocity_deg_s.is_infinite() {
            return state.target;
        }
        let travelled = state.started.elapsed().as_secs_f64() * state.velocity_deg_s;
        if travelled >= span.abs() {
            state.target
        } else {
            state.origin + span.signum() * travelled
        }
    }
}

#[async_trait]
impl RotationStage for MockRotationStage {
    async fn move_to(&self, angle_deg: f64) -> Result<()> {
        self.check_fault()?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        state.origin = Self::position_now(&state);
        state.target = angle_deg;
        state.started = Instant::now();
        Ok(())
    }

    async fn position(&self) -> Result<f64> {
        self.check_fault()?;
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        Ok(Self::position_now(&state))
    }

    async fn is_moving(&self) -> Result<bool> {
        self.check_fault()?;
        let state = self.state.lock().map_err(|_| lock_poisoned())?;
        Ok(Self::position_now(&state) != state.target)
    }

    async fn set_velocity(&self, deg_per_sec: f64) -> Result<()> {
        self.check_fault()?;
        let mut state = self.state.lock().map_err(|_| lock_poisoned())?;
        state.origin = Self::position_now(&state);
        state.started = Instant::now();
        state.velocity_deg_s = deg_per_sec;
        Ok(())
    }

    async fn set_backlash(&self, steps: i64) -> Result<()> {
        self.check_fault()?;
        self.state.lock().map_err(|_| lock_poisoned())?.backlash_steps = steps;
        Ok(())
    }
}

// =============================================================================
// MockPicomotor
// =============================================================================

/// Simulated piezo actuator axis. Moves are instantaneous; the step counter
/// is the only state.
pub struct MockPicomotor {
    position: Mutex<i64>,
    fail: AtomicBool,
}

impl MockPicomotor {
    pub fn new(initial_steps: i64) -> Self {
        Self {
            position: Mutex::new(initial_steps),
            fail: AtomicBool::new(false),
        }
    }

    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    fn check_fault(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("picomotor link lost");
        }
        Ok(())
    }

    /// Step counter without going through the trait (for model coupling).
    pub fn steps(&self) -> i64 {
        self.position.lock().map(|p| *p).unwrap_or(0)
    }
}

#[async_trait]
impl LinearActuator for MockPicomotor {
    async fn move_by(&self, steps: i64) -> Result<()> {
        self.check_fault()?;
        *self.position.lock().map_err(|_| lock_poisoned())? += steps;
        Ok(())
    }

    async fn position(&self) -> Result<i64> {
        self.check_fault()?;
        Ok(*self.position.lock().map_err(|_| lock_poisoned())?)
    }

    async fn set_velocity(&self, _steps_per_sec: f64) -> Result<()> {
        self.check_fault()?;
        Ok(())
    }
}

// =============================================================================
// MockOven
// =============================================================================

/// Simulated crystal oven. Setpoints are reached instantly; the write
/// counter lets tests assert command throttling.
pub struct MockOven {
    setpoint: Mutex<f64>,
    writes: AtomicU64,
    fail: AtomicBool,
}

impl MockOven {
    pub fn new(initial_temp_c: f64) -> Self {
        Self {
            setpoint: Mutex::new(initial_temp_c),
            writes: AtomicU64::new(0),
            fail: AtomicBool::new(false),
        }
    }

    /// Make every subsequent call fail, simulating a dropped serial link.
    pub fn fail_calls(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    /// Number of setpoint writes issued so far.
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    fn check_fault(&self) -> Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            bail!("oven serial link lost");
        }
        Ok(())
    }

    fn actual_temp(&self) -> f64 {
        self.setpoint.lock().map(|s| *s).unwrap_or(0.0)
    }
}

#[async_trait]
impl OvenController for MockOven {
    async fn set_setpoint(&self, temp_c: f64, rate_c_per_min: f64) -> Result<()> {
        self.check_fault()?;
        // Mirrors the Covesion controller's accepted ranges.
        if !(15.0..=200.0).contains(&temp_c)
            || rate_c_per_min <= 0.0
            || rate_c_per_min > 2.0
        {
            return Err(crate::error::BenchError::InvalidInput(format!(
                "oven setpoint {temp_c} °C at {rate_c_per_min} °C/min outside accepted range"
            ))
            .into());
        }
        *self.setpoint.lock().map_err(|_| lock_poisoned())? = temp_c;
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn read_actual(&self) -> Result<f64> {
        self.check_fault()?;
        Ok(self.actual_temp())
    }
}

// =============================================================================
// Synthetic power models
// =============================================================================

/// Optional Gaussian noise source for the power models.
struct Noise {
    sigma: f64,
    rng: Mutex<StdRng>,
}

impl Noise {
    fn new(sigma: f64, seed: u64) -> Self {
        Self {
            sigma,
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    fn sample(&self) -> f64 {
        if self.sigma == 0.0 {
            return 0.0;
        }
        let Ok(mut rng) = self.rng.lock() else {
            return 0.0;
        };
        // Box-Muller from two uniform draws.
        let u1: f64 = rng.gen_range(f64::EPSILON..1.0);
        let u2: f64 = rng.gen_range(0.0..1.0);
        self.sigma * (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
    }
}

/// Power behind the bandpass filter: flat-top Gaussian of the stage angle,
/// peak angle linear in wavelength (`x0 = slope * wl + intercept`).
pub struct MockFilterPower {
    stage: Arc<MockRotationStage>,
    meter: Arc<MockWavelengthMeter>,
    pub amplitude_w: f64,
    pub width_deg: f64,
    pub exponent: f64,
    pub floor_w: f64,
    pub peak_slope: f64,
    pub peak_intercept: f64,
    noise: Noise,
}

impl MockFilterPower {
    pub fn new(
        stage: Arc<MockRotationStage>,
        meter: Arc<MockWavelengthMeter>,
        peak_slope: f64,
        peak_intercept: f64,
    ) -> Self {
        Self {
            stage,
            meter,
            amplitude_w: 0.02,
            width_deg: 1.0,
            exponent: 2.0,
            floor_w: 0.01,
            peak_slope,
            peak_intercept,
            noise: Noise::new(0.0, 7),
        }
    }

    pub fn with_noise(mut self, sigma_w: f64, seed: u64) -> Self {
        self.noise = Noise::new(sigma_w, seed);
        self
    }
}

#[async_trait]
impl PowerSensor for MockFilterPower {
    async fn read_power(&self) -> Result<f64> {
        let angle = self.stage.position().await?;
        let wl = self.meter.wavelength_nm().await?;
        let x0 = self.peak_slope * wl + self.peak_intercept;
        let u = ((angle - x0) / self.width_deg).powi(2);
        let power = self.amplitude_w * (-u.powf(self.exponent)).exp() + self.floor_w;
        Ok(power + self.noise.sample())
    }
}

/// UV power after frequency doubling: Gaussian of the picomotor position,
/// peak position linear in wavelength (`peak = ref_steps - steps_per_nm *
/// (wl - ref_wl)`), matching the sign convention of the drift failsafe.
pub struct MockUvPower {
    actuator: Arc<MockPicomotor>,
    meter: Arc<MockWavelengthMeter>,
    pub peak_power_w: f64,
    pub width_steps: f64,
    pub ref_steps: f64,
    pub ref_wavelength_nm: f64,
    pub steps_per_nm: f64,
    noise: Noise,
}

impl MockUvPower {
    pub fn new(actuator: Arc<MockPicomotor>, meter: Arc<MockWavelengthMeter>) -> Self {
        Self {
            actuator,
            meter,
            peak_power_w: 0.05,
            width_steps: 400.0,
            ref_steps: 0.0,
            ref_wavelength_nm: 1029.0,
            steps_per_nm: 3300.0,
            noise: Noise::new(0.0, 11),
        }
    }

    pub fn with_noise(mut self, sigma_w: f64, seed: u64) -> Self {
        self.noise = Noise::new(sigma_w, seed);
        self
    }

    /// Step position of the current power maximum.
    pub async fn peak_steps(&self) -> Result<f64> {
        let wl = self.meter.wavelength_nm().await?;
        Ok(self.ref_steps - self.steps_per_nm * (wl - self.ref_wavelength_nm))
    }
}

#[async_trait]
impl PowerSensor for MockUvPower {
    async fn read_power(&self) -> Result<f64> {
        let pos = self.actuator.steps() as f64;
        let peak = self.peak_steps().await?;
        let power = self.peak_power_w * (-((pos - peak) / self.width_steps).powi(2)).exp();
        Ok(power + self.noise.sample())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn meter_follows_oven() {
        let oven = Arc::new(MockOven::new(180.0));
        let meter = MockWavelengthMeter::oven_linked(Arc::clone(&oven), 1029.0, 180.0, 0.1);
        assert_eq!(meter.wavelength_nm().await.unwrap(), 1029.0);
        oven.set_setpoint(185.0, 2.0).await.unwrap();
        assert!((meter.wavelength_nm().await.unwrap() - 1029.5).abs() < 1e-9);
    }

    #[tokio::test(start_paused = true)]
    async fn stage_moves_at_velocity() {
        let stage = MockRotationStage::new(0.0);
        stage.set_velocity(10.0).await.unwrap();
        stage.move_to(5.0).await.unwrap();
        assert!(stage.is_moving().await.unwrap());
        tokio::time::sleep(std::time::Duration::from_millis(250)).await;
        let mid = stage.position().await.unwrap();
        assert!(mid > 2.0 && mid < 3.0, "position {mid}");
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        assert!(!stage.is_moving().await.unwrap());
        assert_eq!(stage.position().await.unwrap(), 5.0);
    }

    #[tokio::test]
    async fn oven_rejects_out_of_range() {
        let oven = MockOven::new(20.0);
        assert!(oven.set_setpoint(300.0, 1.0).await.is_err());
        assert!(oven.set_setpoint(100.0, 5.0).await.is_err());
        assert!(oven.set_setpoint(100.0, 0.0).await.is_err());
        assert!(oven.set_setpoint(100.0, -1.0).await.is_err());
        assert_eq!(oven.write_count(), 0);
        oven.set_setpoint(100.0, 1.0).await.unwrap();
        assert_eq!(oven.write_count(), 1);
    }

    #[tokio::test]
    async fn oven_fault_fails_both_directions() {
        let oven = MockOven::new(20.0);
        oven.fail_calls(true);
        assert!(oven.set_setpoint(100.0, 1.0).await.is_err());
        assert!(oven.read_actual().await.is_err());
    }

    #[tokio::test]
    async fn uv_power_peaks_at_model_maximum() {
        let actuator = Arc::new(MockPicomotor::new(0));
        let meter = Arc::new(MockWavelengthMeter::fixed(1029.0));
        let sensor = MockUvPower::new(Arc::clone(&actuator), meter);
        let at_peak = sensor.read_power().await.unwrap();
        actuator.move_by(600).await.unwrap();
        let off_peak = sensor.read_power().await.unwrap();
        assert!(at_peak > off_peak);
    }
}
