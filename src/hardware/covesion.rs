//! Covesion OC2 crystal oven controller driver.
//!
//! Protocol overview (Covesion OC1/OC2 serial command set):
//! - Baud 19200, 8N1, no flow control
//! - Set command: `!i191;<setpoint>;0;0;<rate °C/s>;0;0;BF`
//! - Status query: `!j00CB`, reply is a semicolon-separated field list with
//!   the actual temperature in field 1
//!
//! The controller accepts 15–200 °C and ramp rates up to 2 °C/min; requests
//! outside that range are rejected here without touching the wire. The
//! public API takes °C/min, the wire takes °C/s rounded to 3 decimals.

use crate::error::BenchError;
use crate::hardware::capabilities::OvenController;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Driver for the Covesion OC2 oven controller.
pub struct CovesionOven {
    port: Mutex<SerialStream>,
    timeout: Duration,
}

impl CovesionOven {
    /// Open the oven controller on a serial port.
    pub fn new(port_path: &str) -> Result<Self> {
        let port = tokio_serial::new(port_path, 19_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("opening Covesion oven on {port_path}"))?;

        Ok(Self {
            port: Mutex::new(port),
            timeout: Duration::from_millis(1000),
        })
    }

    async fn write_command(&self, command: &str) -> Result<()> {
        let mut port = self.port.lock().await;
        port.write_all(command.as_bytes())
            .await
            .context("writing oven command")?;
        port.flush().await.context("flushing oven command")?;
        Ok(())
    }

    /// Send a query and collect the semicolon-separated reply fields.
    async fn query(&self, command: &str) -> Result<Vec<String>> {
        let mut port = self.port.lock().await;
        port.write_all(command.as_bytes())
            .await
            .context("writing oven query")?;
        port.flush().await.context("flushing oven query")?;

        let raw = tokio::time::timeout(self.timeout, async {
            let mut buf = Vec::new();
            let mut byte = [0u8; 1];
            loop {
                port.read_exact(&mut byte).await.context("reading oven reply")?;
                if byte[0] == b'\r' || byte[0] == b'\n' {
                    if !buf.is_empty() {
                        break;
                    }
                } else {
                    buf.push(byte[0]);
                }
            }
            Ok::<_, anyhow::Error>(buf)
        })
        .await
        .map_err(|_| anyhow!("oven reply timed out after {:?}", self.timeout))??;

        let reply = String::from_utf8_lossy(&raw);
        Ok(reply.split(';').map(str::to_owned).collect())
    }
}

#[async_trait]
impl OvenController for CovesionOven {
    async fn set_setpoint(&self, temp_c: f64, rate_c_per_min: f64) -> Result<()> {
        if !(15.0..=200.0).contains(&temp_c) {
            return Err(BenchError::InvalidInput(format!(
                "oven setpoint {temp_c} °C outside accepted range 15–200 °C"
            ))
            .into());
        }
        if rate_c_per_min <= 0.0 || rate_c_per_min > 2.0 {
            return Err(BenchError::InvalidInput(format!(
                "oven ramp rate {rate_c_per_min} °C/min outside accepted range (0, 2]"
            ))
            .into());
        }
        let rate_c_per_sec = (rate_c_per_min / 60.0 * 1000.0).round() / 1000.0;
        self.write_command(&format!("!i191;{temp_c};0;0;{rate_c_per_sec};0;0;BF"))
            .await
    }

    async fn read_actual(&self) -> Result<f64> {
        let fields = self.query("!j00CB").await?;
        let raw = fields
            .get(1)
            .ok_or_else(|| anyhow!("oven status reply too short: {fields:?}"))?;
        raw.trim()
            .parse::<f64>()
            .with_context(|| format!("parsing oven temperature {raw:?}"))
    }
}
