//! Thorlabs K10CR1 rotation stage driver (Kinesis/APT protocol).
//!
//! Reference: Thorlabs APT Communications Protocol, Issue 37.
//!
//! Protocol overview:
//! - Binary frames: 6-byte header `[msg_id u16 LE][param1][param2][dest][src]`
//! - Long frames set bit 7 of `dest` and carry the payload length in the
//!   param bytes, followed by the payload
//! - Baud: 115200, 8N1, no flow control
//! - Device unit scaling for the K10CR1: 136533.33 microsteps per degree,
//!   7329109 velocity counts per degree/second
//!
//! Only the subset the bench needs is implemented: absolute moves, position
//! counter, velocity parameters, backlash distance, and status bits.

use crate::hardware::capabilities::RotationStage;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_serial::{SerialPortBuilderExt, SerialStream};

/// Microsteps per degree of rotation (Thorlabs K10CR1).
pub const STEPS_PER_DEGREE: f64 = 136_533.33;
/// Velocity device units per degree/second (Thorlabs K10CR1).
const VELOCITY_SCALING: f64 = 7_329_109.0;

const MGMSG_MOT_MOVE_ABSOLUTE: u16 = 0x0453;
const MGMSG_MOT_REQ_POSCOUNTER: u16 = 0x0411;
const MGMSG_MOT_GET_POSCOUNTER: u16 = 0x0412;
const MGMSG_MOT_SET_VELPARAMS: u16 = 0x0413;
const MGMSG_MOT_SET_GENMOVEPARAMS: u16 = 0x043A;
const MGMSG_MOT_REQ_STATUSBITS: u16 = 0x0429;
const MGMSG_MOT_GET_STATUSBITS: u16 = 0x042A;

/// Moving CW/CCW and jogging CW/CCW status bits.
const STATUS_MOVING_MASK: u32 = 0x0000_00F0;

const DEST_GENERIC_USB: u8 = 0x50;
const SRC_HOST: u8 = 0x01;
const CHANNEL: u16 = 1;

/// Convert degrees to integer microsteps.
pub fn to_steps(angle_deg: f64) -> i32 {
    (angle_deg * STEPS_PER_DEGREE).round() as i32
}

/// Convert microsteps to degrees, rounded to 3 decimal places.
pub fn to_degree(steps: i32) -> f64 {
    (steps as f64 / STEPS_PER_DEGREE * 1000.0).round() / 1000.0
}

/// Driver for the Thorlabs K10CR1 rotation stage.
pub struct KinesisStage {
    port: Mutex<SerialStream>,
    timeout: Duration,
}

impl KinesisStage {
    /// Open the stage on a serial port (e.g. `/dev/ttyUSB0`).
    pub fn new(port_path: &str) -> Result<Self> {
        let port = tokio_serial::new(port_path, 115_200)
            .data_bits(tokio_serial::DataBits::Eight)
            .parity(tokio_serial::Parity::None)
            .stop_bits(tokio_serial::StopBits::One)
            .flow_control(tokio_serial::FlowControl::None)
            .open_native_async()
            .with_context(|| format!("opening Kinesis stage on {port_path}"))?;

        Ok(Self {
            port: Mutex::new(port),
            timeout: Duration::from_millis(1000),
        })
    }

    /// Short frame: header only.
    fn short_frame(msg_id: u16, param1: u8, param2: u8) -> BytesMut {
        let mut frame = BytesMut::with_capacity(6);
        frame.put_u16_le(msg_id);
        frame.put_u8(param1);
        frame.put_u8(param2);
        frame.put_u8(DEST_GENERIC_USB);
        frame.put_u8(SRC_HOST);
        frame
    }

    /// Long frame: header with payload length, then payload.
    fn long_frame(msg_id: u16, payload: &[u8]) -> BytesMut {
        let mut frame = BytesMut::with_capacity(6 + payload.len());
        frame.put_u16_le(msg_id);
        frame.put_u16_le(payload.len() as u16);
        frame.put_u8(DEST_GENERIC_USB | 0x80);
        frame.put_u8(SRC_HOST);
        frame.put_slice(payload);
        frame
    }

    async fn send(&self, frame: &[u8]) -> Result<()> {
        let mut port = self.port.lock().await;
        port.write_all(frame).await.context("writing APT frame")?;
        port.flush().await.context("flushing APT frame")?;
        Ok(())
    }

    /// Send a request frame and read the expected response, returning its
    /// payload (empty for short responses).
    async fn transact(&self, request: &[u8], expect_id: u16) -> Result<Vec<u8>> {
        let mut port = self.port.lock().await;
        port.write_all(request).await.context("writing APT request")?;
        port.flush().await.context("flushing APT request")?;

        let response = tokio::time::timeout(self.timeout, async {
            let mut header = [0u8; 6];
            port.read_exact(&mut header).await.context("reading APT header")?;
            let mut buf = &header[..];
            let msg_id = buf.get_u16_le();
            if msg_id != expect_id {
                return Err(anyhow!(
                    "unexpected APT response 0x{msg_id:04X}, expected 0x{expect_id:04X}"
                ));
            }
            if header[4] & 0x80 != 0 {
                let len = u16::from_le_bytes([header[2], header[3]]) as usize;
                let mut payload = vec![0u8; len];
                port.read_exact(&mut payload)
                    .await
                    .context("reading APT payload")?;
                Ok(payload)
            } else {
                Ok(Vec::new())
            }
        })
        .await
        .map_err(|_| anyhow!("APT response timed out after {:?}", self.timeout))??;

        Ok(response)
    }

    async fn status_bits(&self) -> Result<u32> {
        let request = Self::short_frame(MGMSG_MOT_REQ_STATUSBITS, CHANNEL as u8, 0);
        let payload = self.transact(&request, MGMSG_MOT_GET_STATUSBITS).await?;
        if payload.len() < 6 {
            return Err(anyhow!("short STATUSBITS payload: {} bytes", payload.len()));
        }
        let mut buf = &payload[2..6];
        Ok(buf.get_u32_le())
    }
}

#[async_trait]
impl RotationStage for KinesisStage {
    async fn move_to(&self, angle_deg: f64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u16_le(CHANNEL);
        payload.put_i32_le(to_steps(angle_deg));
        self.send(&Self::long_frame(MGMSG_MOT_MOVE_ABSOLUTE, &payload))
            .await
    }

    async fn position(&self) -> Result<f64> {
        let request = Self::short_frame(MGMSG_MOT_REQ_POSCOUNTER, CHANNEL as u8, 0);
        let payload = self.transact(&request, MGMSG_MOT_GET_POSCOUNTER).await?;
        if payload.len() < 6 {
            return Err(anyhow!("short POSCOUNTER payload: {} bytes", payload.len()));
        }
        let mut buf = &payload[2..6];
        Ok(to_degree(buf.get_i32_le()))
    }

    async fn is_moving(&self) -> Result<bool> {
        Ok(self.status_bits().await? & STATUS_MOVING_MASK != 0)
    }

    async fn set_velocity(&self, deg_per_sec: f64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(14);
        payload.put_u16_le(CHANNEL);
        payload.put_i32_le(0); // min velocity
        payload.put_i32_le((deg_per_sec * VELOCITY_SCALING / 10.0).round() as i32); // accel
        payload.put_i32_le((deg_per_sec * VELOCITY_SCALING).round() as i32);
        self.send(&Self::long_frame(MGMSG_MOT_SET_VELPARAMS, &payload))
            .await
    }

    async fn set_backlash(&self, steps: i64) -> Result<()> {
        let mut payload = BytesMut::with_capacity(6);
        payload.put_u16_le(CHANNEL);
        payload.put_i32_le(steps as i32);
        self.send(&Self::long_frame(MGMSG_MOT_SET_GENMOVEPARAMS, &payload))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_conversion_matches_thorlabs_scaling() {
        assert_eq!(to_steps(1.0), 136_533);
        assert_eq!(to_degree(136_533), 1.0);
        // Round-trips within the 3-decimal resolution of the stage.
        assert_eq!(to_degree(to_steps(114.253)), 114.253);
    }

    #[test]
    fn frames_are_well_formed() {
        let short = KinesisStage::short_frame(MGMSG_MOT_REQ_POSCOUNTER, 1, 0);
        assert_eq!(short.len(), 6);
        assert_eq!(&short[..2], &[0x11, 0x04]);
        assert_eq!(short[4], DEST_GENERIC_USB);

        let long = KinesisStage::long_frame(MGMSG_MOT_MOVE_ABSOLUTE, &[0, 0, 0, 0, 0, 0]);
        assert_eq!(long.len(), 12);
        assert_eq!(u16::from_le_bytes([long[2], long[3]]), 6);
        assert_eq!(long[4], DEST_GENERIC_USB | 0x80);
    }
}
