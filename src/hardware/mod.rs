//! Hardware abstraction: capability traits, bench device drivers, mocks.

pub mod capabilities;
pub mod mock;
pub mod picomotor;
pub mod wavemeter;

#[cfg(feature = "instrument_serial")]
pub mod covesion;
#[cfg(feature = "instrument_serial")]
pub mod kinesis;
#[cfg(feature = "instrument_serial")]
pub mod pm16;

pub use capabilities::{
    LinearActuator, OvenController, PowerSensor, RotationStage, WavelengthSource,
};
