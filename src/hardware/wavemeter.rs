//! Network wavemeter bridge client.
//!
//! The wavemeter itself is only reachable through its vendor software, so
//! the bench runs a small bridge service next to it that serves the latest
//! reading over TCP: one `wl?` query line in, one ASCII wavelength in nm
//! out. This client is the [`WavelengthSource`] for real-hardware runs.

use crate::hardware::capabilities::WavelengthSource;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// Client for the wavemeter bridge service.
pub struct NetworkWavemeter {
    stream: Mutex<BufReader<TcpStream>>,
    timeout: Duration,
}

impl NetworkWavemeter {
    /// Connect to the bridge, e.g. `"192.168.1.50:5025"`.
    pub async fn connect(addr: &str) -> Result<Self> {
        let stream = TcpStream::connect(addr)
            .await
            .with_context(|| format!("connecting to wavemeter bridge at {addr}"))?;
        Ok(Self {
            stream: Mutex::new(BufReader::new(stream)),
            timeout: Duration::from_millis(1000),
        })
    }
}

#[async_trait]
impl WavelengthSource for NetworkWavemeter {
    async fn wavelength_nm(&self) -> Result<f64> {
        let mut stream = self.stream.lock().await;
        stream
            .get_mut()
            .write_all(b"wl?\n")
            .await
            .context("sending wavemeter query")?;

        let line = tokio::time::timeout(self.timeout, async {
            let mut line = String::new();
            stream
                .read_line(&mut line)
                .await
                .context("reading wavemeter reply")?;
            Ok::<_, anyhow::Error>(line)
        })
        .await
        .map_err(|_| anyhow!("wavemeter reply timed out after {:?}", self.timeout))??;

        line.trim()
            .parse::<f64>()
            .with_context(|| format!("parsing wavemeter reading {:?}", line.trim()))
    }
}
