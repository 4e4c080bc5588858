//! Newport 8742 Picomotor controller driver (Ethernet).
//!
//! Protocol overview:
//! - Telnet-style ASCII over TCP port 23
//! - Commands are `<axis><mnemonic><value>`, terminated with CR
//! - Relative move: `1PR100`; position query: `1TP?`; velocity: `1VA1750`
//!
//! One controller drives up to four piezo axes. [`Picomotor8742::axis`]
//! hands out per-axis [`LinearActuator`] handles that share the underlying
//! connection; the axes themselves must still be driven by at most one
//! controller loop each.

use crate::hardware::capabilities::LinearActuator;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Connection to a Newport 8742 Picomotor controller.
pub struct Picomotor8742 {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl Picomotor8742 {
    /// Connect to the controller, e.g. `"192.168.1.100:23"`.
    pub async fn connect(addr: &str) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to Picomotor controller at {addr}"))?;
        Ok(Arc::new(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: Duration::from_millis(1000),
        }))
    }

    /// Per-axis actuator handle (axes are numbered from 1).
    pub fn axis(self: &Arc<Self>, axis: u8) -> PicomotorAxis {
        PicomotorAxis {
            controller: Arc::clone(self),
            axis,
        }
    }

    async fn send(&self, command: &str) -> Result<()> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .write_all(format!("{command}\r").as_bytes())
            .await
            .with_context(|| format!("sending picomotor command {command:?}"))?;
        Ok(())
    }

    async fn query(&self, command: &str) -> Result<String> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .write_all(format!("{command}\r").as_bytes())
            .await
            .with_context(|| format!("sending picomotor query {command:?}"))?;

        let line = tokio::time::timeout(self.timeout, async {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .context("reading picomotor reply")?;
            Ok::<_, anyhow::Error>(line)
        })
        .await
        .map_err(|_| anyhow!("picomotor reply timed out after {:?}", self.timeout))??;

        Ok(line.trim().to_owned())
    }
}

/// One axis of a Picomotor controller, usable as a [`LinearActuator`].
pub struct PicomotorAxis {
    controller: Arc<Picomotor8742>,
    axis: u8,
}

#[async_trait]
impl LinearActuator for PicomotorAxis {
    async fn move_by(&self, steps: i64) -> Result<()> {
        self.controller
            .send(&format!("{}PR{}", self.axis, steps))
            .await
    }

    async fn position(&self) -> Result<i64> {
        let reply = self.controller.query(&format!("{}TP?", self.axis)).await?;
        reply
            .parse::<i64>()
            .with_context(|| format!("parsing picomotor position {reply:?}"))
    }

    async fn set_velocity(&self, steps_per_sec: f64) -> Result<()> {
        self.controller
            .send(&format!("{}VA{}", self.axis, steps_per_sec.round() as i64))
            .await
    }
}
