//! Configuration management.
//!
//! Settings are loaded from `config/<name>.toml` (default `config/default`)
//! and deserialized into typed sections. Every tuning parameter has a
//! serde default matching the bench's hand-calibrated values, so a minimal
//! file only needs the device wiring.

use crate::calibration::PipelineConfig;
use crate::error::BenchError;
use crate::feedforward::FeedForwardConfig;
use crate::optimizer::OptimizerConfig;
use crate::tracker::TrackerConfig;
use config::Config;
use serde::Deserialize;

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub devices: DeviceSettings,
    #[serde(default)]
    pub tracker: TrackerConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub feedforward: FeedForwardConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_log_level() -> String {
    "info".to_owned()
}

/// Physical device wiring.
#[derive(Debug, Deserialize, Clone)]
pub struct DeviceSettings {
    /// Serial port of the Thorlabs K10CR1 rotation stage.
    #[serde(default = "default_stage_port")]
    pub stage_port: String,
    /// Serial port of the Covesion oven controller.
    #[serde(default = "default_oven_port")]
    pub oven_port: String,
    /// Serial port of the Thorlabs PM16 power meter.
    #[serde(default = "default_power_meter_port")]
    pub power_meter_port: String,
    /// TCP address of the Newport 8742 picomotor controller.
    #[serde(default = "default_picomotor_addr")]
    pub picomotor_addr: String,
    /// TCP address of the wavemeter bridge service.
    #[serde(default = "default_wavemeter_addr")]
    pub wavemeter_addr: String,
    /// Picomotor axis driving the UV alignment.
    #[serde(default = "default_uv_axis")]
    pub uv_axis: u8,
    /// Second picomotor axis for the dual-axis optimizer, if fitted.
    #[serde(default)]
    pub second_axis: Option<u8>,
}

fn default_stage_port() -> String {
    "/dev/ttyUSB0".to_owned()
}
fn default_oven_port() -> String {
    "/dev/ttyUSB1".to_owned()
}
fn default_power_meter_port() -> String {
    "/dev/ttyUSB2".to_owned()
}
fn default_picomotor_addr() -> String {
    "192.168.1.100:23".to_owned()
}
fn default_wavemeter_addr() -> String {
    "192.168.1.50:5025".to_owned()
}
fn default_uv_axis() -> u8 {
    1
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            stage_port: default_stage_port(),
            oven_port: default_oven_port(),
            power_meter_port: default_power_meter_port(),
            picomotor_addr: default_picomotor_addr(),
            wavemeter_addr: default_wavemeter_addr(),
            uv_axis: default_uv_axis(),
            second_axis: None,
        }
    }
}

impl Settings {
    pub fn new(config_name: Option<&str>) -> Result<Self, BenchError> {
        let config_path = format!("config/{}", config_name.unwrap_or("default"));
        let s = Config::builder()
            .add_source(config::File::with_name(&config_path))
            .build()?;

        Ok(s.try_deserialize()?)
    }

    /// Settings built purely from the serde defaults, without a file.
    pub fn defaults() -> Self {
        Self {
            log_level: default_log_level(),
            devices: DeviceSettings::default(),
            tracker: TrackerConfig::default(),
            optimizer: OptimizerConfig::default(),
            feedforward: FeedForwardConfig::default(),
            pipeline: PipelineConfig::default(),
        }
    }
}
