//! Custom error types for the bench automation crate.
//!
//! `BenchError` is the crate-wide error enum, built with `thiserror`. The
//! variants mirror the fault taxonomy of the control design:
//!
//! - **`Transport`**: I/O failure on a device proxy (serial, USB, network).
//!   Always fatal to the loop that owns the device; the loop stops and
//!   reports an idle status rather than retrying.
//! - **`FitConvergence`**: a calibration curve fit did not converge. Carries
//!   the wavelength and scan direction of the offending leg so the operator
//!   knows which part of the sweep is bad. No calibration table is published
//!   when any leg fails.
//! - **`InvalidInput`**: an out-of-range request (e.g. oven setpoint or
//!   ramp rate) rejected synchronously at the call site. The owning loop
//!   continues.
//! - **`Timeout`**: a bounded wait (motor settle, leg completion, thermal
//!   settle) expired. The original bench code blocked unconditionally here;
//!   every such wait in this crate has an explicit deadline.
//! - **`Cancelled`**: cooperative stop observed mid-procedure.
//!
//! Hardware capability traits use `anyhow::Result` at the seam (any device
//! failure is a transport fault from the controller's point of view);
//! [`BenchError::transport`] folds those into the typed taxonomy.

use crate::calibration::table::ScanDirection;
use thiserror::Error;

/// Convenience alias for results using the crate error type.
pub type BenchResult<T> = std::result::Result<T, BenchError>;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("transport fault: {0}")]
    Transport(String),

    #[error("curve fit did not converge at {wavelength_nm:.4} nm ({direction} leg)")]
    FitConvergence {
        wavelength_nm: f64,
        direction: ScanDirection,
    },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("timed out after {waited_ms} ms waiting for {what}")]
    Timeout { what: &'static str, waited_ms: u64 },

    #[error("cancelled")]
    Cancelled,

    #[error("calibration table unavailable: {0}")]
    NoCalibration(String),

    #[error("configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl BenchError {
    /// Fold a device-proxy failure into the transport fault category.
    pub fn transport(err: anyhow::Error) -> Self {
        BenchError::Transport(format!("{err:#}"))
    }

    /// True for faults that must stop the owning control loop.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, BenchError::InvalidInput(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fit_convergence_names_the_leg() {
        let err = BenchError::FitConvergence {
            wavelength_nm: 1029.5,
            direction: ScanDirection::HighToLow,
        };
        let msg = err.to_string();
        assert!(msg.contains("1029.5"));
        assert!(msg.contains("high-to-low"));
    }

    #[test]
    fn invalid_input_is_not_fatal() {
        assert!(!BenchError::InvalidInput("rate too high".into()).is_fatal());
        assert!(BenchError::Transport("port gone".into()).is_fatal());
    }

    #[test]
    fn transport_preserves_context_chain() {
        let inner = anyhow::anyhow!("read failed").context("oven status query");
        let err = BenchError::transport(inner);
        assert!(err.to_string().contains("oven status query"));
    }
}
