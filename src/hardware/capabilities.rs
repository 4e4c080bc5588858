//! Bench hardware capability traits.
//!
//! Fine-grained async traits for the devices the controllers drive. Each
//! trait covers one capability, is `Send + Sync`, and uses `anyhow::Result`
//! so drivers can attach whatever context they have; the controllers fold
//! any failure into a transport fault and stop.
//!
//! All calls are synchronous from the controller's point of view: a move or
//! read may take as long as the physical operation does, and a worker's loop
//! body is a blocking unit of work built from these awaits. Concrete devices
//! live in sibling modules (`kinesis`, `covesion`, `picomotor`, `pm16`) and
//! in `mock` for tests; which driver backs which trait is wiring, not part
//! of the control design.
//!
//! Shared handles are not safe for concurrent use by two workers. The
//! caller wiring up controllers is responsible for the single-writer-per-
//! axis discipline; the traits do not defend against violations.

use anyhow::Result;
use async_trait::async_trait;

/// Capability: wavelength readout from the wavelength meter.
#[async_trait]
pub trait WavelengthSource: Send + Sync {
    /// Current wavelength in nanometers.
    async fn wavelength_nm(&self) -> Result<f64>;
}

/// Capability: motorized rotation stage (the bandpass filter mount).
///
/// Angles are in degrees, velocities in degrees per second. `move_to`
/// initiates motion and may return before the stage settles; poll
/// `is_moving` to detect completion.
#[async_trait]
pub trait RotationStage: Send + Sync {
    /// Start an absolute move to `angle_deg`.
    async fn move_to(&self, angle_deg: f64) -> Result<()>;

    /// Current angle in degrees (approximate while moving).
    async fn position(&self) -> Result<f64>;

    /// Whether the motor reports motion in progress.
    async fn is_moving(&self) -> Result<bool>;

    /// Set the maximum move velocity in degrees per second.
    async fn set_velocity(&self, deg_per_sec: f64) -> Result<()>;

    /// Set the backlash compensation distance in motor steps (0 disables).
    async fn set_backlash(&self, steps: i64) -> Result<()>;
}

/// Capability: open-loop piezo actuator (picomotor axis).
///
/// Positions are in motor steps; there is no absolute reference, only the
/// step counter since power-up.
#[async_trait]
pub trait LinearActuator: Send + Sync {
    /// Move by a relative number of steps (sign gives the direction).
    async fn move_by(&self, steps: i64) -> Result<()>;

    /// Current step counter.
    async fn position(&self) -> Result<i64>;

    /// Set the actuator velocity in steps per second.
    async fn set_velocity(&self, steps_per_sec: f64) -> Result<()>;
}

/// Capability: optical power readout.
#[async_trait]
pub trait PowerSensor: Send + Sync {
    /// Measured power in watts, averaged over the sensor's sample buffer.
    async fn read_power(&self) -> Result<f64>;
}

/// Capability: crystal oven temperature controller.
#[async_trait]
pub trait OvenController: Send + Sync {
    /// Command a setpoint in °C with a ramp rate in °C/min.
    ///
    /// Implementations validate the request synchronously and reject
    /// out-of-range values without touching the hardware.
    async fn set_setpoint(&self, temp_c: f64, rate_c_per_min: f64) -> Result<()>;

    /// Actual oven temperature in °C.
    async fn read_actual(&self) -> Result<f64>;
}
