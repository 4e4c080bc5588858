//! Calibration curves mapping laser wavelength to filter angle.
//!
//! The bandpass filter sits on a rotation stage with measurable backlash, so
//! one linear model is not enough: the angle commanded for a given wavelength
//! depends on which way the stage is travelling. A [`CalibrationTable`] holds
//! one [`CalibrationCurve`] per [`ScanDirection`]; the tracker picks the
//! curve that matches the actual direction of motion.
//!
//! Tables are produced by the calibration pipeline (or loaded from the
//! last-used parameter file) and are read-only afterwards; a new calibration
//! replaces the whole table at once through [`SharedTable::replace`].

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Conventional name of the calibration parameter file loaded at startup
/// and rewritten after a successful calibration run.
pub const LASTUSED_CALPAR: &str = "lastused_calpar.csv";

/// Direction of an angle scan across the filter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanDirection {
    /// Sweeping from a lower to a higher angle.
    LowToHigh,
    /// Sweeping from a higher to a lower angle.
    HighToLow,
}

impl ScanDirection {
    /// The opposite scan direction.
    pub fn toggled(self) -> Self {
        match self {
            ScanDirection::LowToHigh => ScanDirection::HighToLow,
            ScanDirection::HighToLow => ScanDirection::LowToHigh,
        }
    }
}

impl fmt::Display for ScanDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanDirection::LowToHigh => write!(f, "low-to-high"),
            ScanDirection::HighToLow => write!(f, "high-to-low"),
        }
    }
}

/// Linear model `angle = slope * wavelength + intercept`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationCurve {
    pub slope: f64,
    pub intercept: f64,
}

impl CalibrationCurve {
    pub fn new(slope: f64, intercept: f64) -> Self {
        Self { slope, intercept }
    }

    /// Angle for a wavelength, rounded to 3 decimal places (the stage's
    /// useful resolution; finer commands just churn the motor).
    pub fn angle_for(&self, wavelength_nm: f64) -> f64 {
        round_to(self.slope * wavelength_nm + self.intercept, 3)
    }
}

/// Round to `decimals` decimal places.
pub fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

/// Pair of calibration curves, one per scan direction.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CalibrationTable {
    pub low_to_high: CalibrationCurve,
    pub high_to_low: CalibrationCurve,
}

/// One row of the semicolon-delimited parameter file.
#[derive(Debug, Serialize, Deserialize)]
struct CalparRecord {
    direction: ScanDirection,
    slope: f64,
    intercept: f64,
}

impl CalibrationTable {
    pub fn new(low_to_high: CalibrationCurve, high_to_low: CalibrationCurve) -> Self {
        Self {
            low_to_high,
            high_to_low,
        }
    }

    /// Curve for the given scan direction.
    pub fn curve(&self, direction: ScanDirection) -> &CalibrationCurve {
        match direction {
            ScanDirection::LowToHigh => &self.low_to_high,
            ScanDirection::HighToLow => &self.high_to_low,
        }
    }

    /// Angle for a wavelength using the curve of `direction`.
    pub fn angle_for(&self, wavelength_nm: f64, direction: ScanDirection) -> f64 {
        self.curve(direction).angle_for(wavelength_nm)
    }

    /// Load a table from a semicolon-delimited parameter file with rows
    /// `direction;slope;intercept`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(b';')
            .from_path(path)
            .with_context(|| format!("opening calibration file {}", path.display()))?;

        let mut low_to_high = None;
        let mut high_to_low = None;
        for record in reader.deserialize() {
            let record: CalparRecord = record.context("parsing calibration record")?;
            match record.direction {
                ScanDirection::LowToHigh => {
                    low_to_high = Some(CalibrationCurve::new(record.slope, record.intercept))
                }
                ScanDirection::HighToLow => {
                    high_to_low = Some(CalibrationCurve::new(record.slope, record.intercept))
                }
            }
        }

        Ok(Self {
            low_to_high: low_to_high
                .ok_or_else(|| anyhow!("{}: missing low_to_high row", path.display()))?,
            high_to_low: high_to_low
                .ok_or_else(|| anyhow!("{}: missing high_to_low row", path.display()))?,
        })
    }

    /// Write the table as a semicolon-delimited parameter file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let mut writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(path)
            .with_context(|| format!("creating calibration file {}", path.display()))?;

        for direction in [ScanDirection::LowToHigh, ScanDirection::HighToLow] {
            let curve = self.curve(direction);
            writer.serialize(CalparRecord {
                direction,
                slope: curve.slope,
                intercept: curve.intercept,
            })?;
        }
        writer.flush()?;
        Ok(())
    }
}

/// Handle giving controllers read access to the active calibration table.
///
/// Readers take a value snapshot per tick; writers replace the table
/// wholesale, so a reader never observes a half-written pair of curves.
#[derive(Clone)]
pub struct SharedTable {
    inner: Arc<RwLock<CalibrationTable>>,
}

impl SharedTable {
    pub fn new(table: CalibrationTable) -> Self {
        Self {
            inner: Arc::new(RwLock::new(table)),
        }
    }

    /// Current table by value.
    pub async fn snapshot(&self) -> CalibrationTable {
        *self.inner.read().await
    }

    /// Replace the active table atomically.
    pub async fn replace(&self, table: CalibrationTable) {
        *self.inner.write().await = table;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> CalibrationTable {
        CalibrationTable::new(
            CalibrationCurve::new(0.5, 10.0),
            CalibrationCurve::new(0.51, 9.7),
        )
    }

    #[test]
    fn angle_is_rounded_to_three_decimals() {
        let curve = CalibrationCurve::new(0.333_333, 0.0);
        assert_eq!(curve.angle_for(1000.0), 333.333);
    }

    #[test]
    fn direction_selects_curve() {
        let t = table();
        assert_eq!(t.angle_for(1030.0, ScanDirection::LowToHigh), 525.0);
        assert_eq!(t.angle_for(1030.0, ScanDirection::HighToLow), 535.0);
    }

    #[test]
    fn toggled_flips_direction() {
        assert_eq!(
            ScanDirection::LowToHigh.toggled(),
            ScanDirection::HighToLow
        );
        assert_eq!(
            ScanDirection::HighToLow.toggled(),
            ScanDirection::LowToHigh
        );
    }

    #[test]
    fn roundtrips_through_parameter_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calpar.csv");
        let t = table();
        t.save(&path).unwrap();
        let loaded = CalibrationTable::load(&path).unwrap();
        assert_eq!(loaded, t);
    }

    #[test]
    fn load_rejects_missing_direction() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calpar.csv");
        std::fs::write(&path, "direction;slope;intercept\nlow_to_high;0.5;10.0\n").unwrap();
        assert!(CalibrationTable::load(&path).is_err());
    }

    #[tokio::test]
    async fn shared_table_replaces_wholesale() {
        let shared = SharedTable::new(table());
        let replacement = CalibrationTable::new(
            CalibrationCurve::new(0.4, 12.0),
            CalibrationCurve::new(0.4, 12.1),
        );
        shared.replace(replacement).await;
        assert_eq!(shared.snapshot().await, replacement);
    }
}
