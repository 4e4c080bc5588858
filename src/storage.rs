//! File output for calibration runs.
//!
//! Two semicolon-delimited CSV products, matching the formats the rest of
//! the lab tooling already reads:
//!
//! - per-leg raw samples: `time_s;wavelength_nm;power_w;angle_deg`
//! - calibration parameters: `direction;slope;intercept` (written through
//!   [`crate::calibration::table::CalibrationTable::save`])
//!
//! Sample files are timestamped so repeated runs never clobber each other.

use crate::calibration::table::ScanDirection;
use anyhow::{Context, Result};
use serde::Serialize;
use std::fs::File;
use std::path::{Path, PathBuf};

/// One logged control tick during a calibration sweep.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct LegSample {
    pub time_s: f64,
    pub wavelength_nm: f64,
    pub power_w: f64,
    pub angle_deg: f64,
}

/// Writer for one leg's raw sample file.
pub struct LegSampleWriter {
    path: PathBuf,
    writer: csv::Writer<File>,
}

impl LegSampleWriter {
    /// Create `calscan_<timestamp>_T<setpoint>_<direction>.csv` under `dir`.
    pub fn create(dir: &Path, setpoint_c: f64, direction: ScanDirection) -> Result<Self> {
        if !dir.exists() {
            std::fs::create_dir_all(dir)
                .with_context(|| format!("creating output directory {}", dir.display()))?;
        }
        let direction_tag = match direction {
            ScanDirection::LowToHigh => "lowtohigh",
            ScanDirection::HighToLow => "hightolow",
        };
        let file_name = format!(
            "calscan_{}_T{:.1}_{}.csv",
            chrono::Utc::now().format("%Y%m%d_%H%M%S"),
            setpoint_c,
            direction_tag
        );
        let path = dir.join(file_name);
        let writer = csv::WriterBuilder::new()
            .delimiter(b';')
            .from_path(&path)
            .with_context(|| format!("creating sample file {}", path.display()))?;
        Ok(Self { path, writer })
    }

    pub fn write(&mut self, sample: &LegSample) -> Result<()> {
        self.writer.serialize(sample).context("writing leg sample")
    }

    pub fn finish(mut self) -> Result<PathBuf> {
        self.writer.flush().context("flushing sample file")?;
        Ok(self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_file_is_semicolon_delimited() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer =
            LegSampleWriter::create(dir.path(), 182.5, ScanDirection::LowToHigh).unwrap();
        writer
            .write(&LegSample {
                time_s: 0.01,
                wavelength_nm: 1029.123456,
                power_w: 0.0213,
                angle_deg: 114.002,
            })
            .unwrap();
        let path = writer.finish().unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "time_s;wavelength_nm;power_w;angle_deg"
        );
        assert!(lines.next().unwrap().starts_with("0.01;1029.123456;"));
        assert!(path.file_name().unwrap().to_string_lossy().contains("T182.5"));
    }
}
