//! Wavelength-to-angle calibration: curve table, flat-top Gaussian
//! fitting, and the two-pass scan pipeline that produces the table.

pub mod fit;
pub mod pipeline;
pub mod table;

pub use fit::{fit_flat_top, linear_fit, FitBounds, FitError, FlatTopParams};
pub use pipeline::{
    CalibrationOutcome, CalibrationPipeline, LegFit, PipelineConfig, PipelinePhase,
};
pub use table::{
    CalibrationCurve, CalibrationTable, ScanDirection, SharedTable, LASTUSED_CALPAR,
};
