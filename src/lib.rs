//! # uvlab
//!
//! Automation for a tunable UV generation bench: a narrowband filter on a
//! rotation stage tracks the pump wavelength, piezo actuators keep the
//! doubling crystal aligned for maximum UV power, and a crystal oven
//! follows the wavelength with a feed-forward temperature model. A
//! calibration pipeline measures the filter's wavelength-to-angle relation
//! per travel direction so the tracker can compensate mechanical
//! hysteresis.
//!
//! ## Module overview
//!
//! - **`calibration`**: the curve table (per-direction linear fits), the
//!   flat-top Gaussian peak fit, and the two-pass scan pipeline.
//! - **`tracker`**: hysteresis-aware wavelength→angle tracking loop.
//! - **`optimizer`**: greedy hill-climbing UV-power optimizer with a
//!   model-based drift failsafe; single- and dual-axis variants.
//! - **`feedforward`**: wavelength-driven oven setpoint loop.
//! - **`hardware`**: capability traits, instrument drivers, and mock
//!   implementations for hardware-free testing.
//! - **`control`**: stop tokens and bounded, cancellable polling waits.
//! - **`config`** / **`telemetry`** / **`error`** / **`storage`**:
//!   settings loading, tracing setup, the typed error enum, and CSV
//!   sample logging.

pub mod calibration;
pub mod config;
pub mod control;
pub mod error;
pub mod feedforward;
pub mod hardware;
pub mod optimizer;
pub mod storage;
pub mod telemetry;
pub mod tracker;

pub use error::{BenchError, BenchResult};
