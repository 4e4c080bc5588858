//! Thorlabs PM16/PM160 power meter driver.
//!
//! Protocol overview:
//! - SCPI over serial (USBTMC-class devices enumerate as a CDC serial port
//!   on the bench host), 115200 baud, LF-terminated
//! - `MEAS:POW?` triggers and reads one measurement in watts
//! - `SENS:CORR:WAV <nm>` sets the correction wavelength
//!
//! `read_power` averages a fixed number of consecutive measurements; the
//! controllers treat that buffer-averaged value as one sample.

use crate::hardware::capabilities::PowerSensor;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Driver for Thorlabs PM16-series power meters.
pub struct Pm16 {
    port: Mutex<BufReader<SerialStream>>,
    timeout: Duration,
    /// Number of measurements averaged per `read_power` call.
    buffer_len: usize,
}

impl Pm16 {
    /// Open the meter on a serial port with the default 10-sample buffer.
    pub fn new(port_path: &str) -> Result<Self> {
        let port = tokio_serial::new(port_path, 115_200)
            .open_native_async()
            .with_context(|| format!("opening PM16 power meter on {port_path}"))?;

        Ok(Self {
            port: Mutex::new(BufReader::new(port)),
            timeout: Duration::from_millis(500),
            buffer_len: 10,
        })
    }

    pub fn with_buffer_len(mut self, buffer_len: usize) -> Self {
        self.buffer_len = buffer_len.max(1);
        self
    }

    /// Set the correction wavelength in nanometers.
    pub async fn set_wavelength(&self, wavelength_nm: f64) -> Result<()> {
        let mut port = self.port.lock().await;
        port.get_mut()
            .write_all(format!("SENS:CORR:WAV {wavelength_nm}\n").as_bytes())
            .await
            .context("setting PM16 wavelength")?;
        Ok(())
    }

    async fn measure_once(&self) -> Result<f64> {
        let mut port = self.port.lock().await;
        port.get_mut()
            .write_all(b"MEAS:POW?\n")
            .await
            .context("sending PM16 measurement query")?;

        let line = tokio::time::timeout(self.timeout, async {
            let mut line = String::new();
            port.read_line(&mut line).await.context("reading PM16 reply")?;
            Ok::<_, anyhow::Error>(line)
        })
        .await
        .map_err(|_| anyhow!("PM16 reply timed out after {:?}", self.timeout))??;

        line.trim()
            .parse::<f64>()
            .with_context(|| format!("parsing PM16 power reading {line:?}"))
    }
}

#[async_trait]
impl PowerSensor for Pm16 {
    async fn read_power(&self) -> Result<f64> {
        let mut sum = 0.0;
        for _ in 0..self.buffer_len {
            sum += self.measure_once().await?;
        }
        Ok(sum / self.buffer_len as f64)
    }
}
