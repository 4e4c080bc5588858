//! Cooperative loop control primitives.
//!
//! Every controller (tracker, optimizer, pipeline, feed-forward) runs as an
//! independent worker that owns its hardware axis. The pieces here are what
//! the workers share in shape, not in state:
//!
//! - [`StopHandle`]/[`StopToken`]: cooperative cancellation over a tokio
//!   `watch` channel. Workers poll the token once per loop iteration;
//!   in-flight hardware moves are never interrupted mid-motion.
//! - [`poll_until`]: a bounded, cancellable polling wait. The original bench
//!   code blocked unconditionally on motor-idle and thermal-settle
//!   conditions; here every such wait carries an explicit deadline and
//!   observes the stop token between polls.

use crate::error::{BenchError, BenchResult};
use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Request side of the cooperative stop signal.
#[derive(Debug, Clone)]
pub struct StopHandle {
    tx: watch::Sender<bool>,
}

impl StopHandle {
    /// Request the owning loop to stop at the next iteration boundary.
    pub fn stop(&self) {
        let _ = self.tx.send(true);
    }
}

/// Observer side of the cooperative stop signal, polled by the loop body.
#[derive(Debug, Clone)]
pub struct StopToken {
    rx: watch::Receiver<bool>,
}

impl StopToken {
    pub fn is_stopped(&self) -> bool {
        *self.rx.borrow()
    }

    /// Error out with [`BenchError::Cancelled`] if a stop was requested.
    pub fn check(&self) -> BenchResult<()> {
        if self.is_stopped() {
            Err(BenchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// Create a connected stop handle/token pair.
pub fn stop_channel() -> (StopHandle, StopToken) {
    let (tx, rx) = watch::channel(false);
    (StopHandle { tx }, StopToken { rx })
}

/// Poll `condition` every `period` until it returns true, the deadline
/// passes, or a stop is requested.
///
/// `what` names the awaited condition in the timeout error.
pub async fn poll_until<F, Fut>(
    what: &'static str,
    timeout: Duration,
    period: Duration,
    stop: &StopToken,
    mut condition: F,
) -> BenchResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = BenchResult<bool>>,
{
    let started = Instant::now();
    loop {
        stop.check()?;
        if condition().await? {
            return Ok(());
        }
        if started.elapsed() >= timeout {
            return Err(BenchError::Timeout {
                what,
                waited_ms: started.elapsed().as_millis() as u64,
            });
        }
        tokio::time::sleep(period).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stop_is_observed() {
        let (handle, token) = stop_channel();
        assert!(!token.is_stopped());
        handle.stop();
        assert!(token.is_stopped());
        assert!(matches!(token.check(), Err(BenchError::Cancelled)));
    }

    #[tokio::test]
    async fn poll_until_times_out() {
        let (_handle, token) = stop_channel();
        let result = poll_until(
            "motor idle",
            Duration::from_millis(20),
            Duration::from_millis(5),
            &token,
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(BenchError::Timeout { what, .. }) if what == "motor idle"));
    }

    #[tokio::test]
    async fn poll_until_returns_on_condition() {
        let (_handle, token) = stop_channel();
        let mut polls = 0;
        let result = poll_until(
            "settle",
            Duration::from_secs(1),
            Duration::from_millis(1),
            &token,
            || {
                polls += 1;
                let done = polls >= 3;
                async move { Ok(done) }
            },
        )
        .await;
        assert!(result.is_ok());
        assert_eq!(polls, 3);
    }

    #[tokio::test]
    async fn poll_until_honors_stop() {
        let (handle, token) = stop_channel();
        handle.stop();
        let result = poll_until(
            "settle",
            Duration::from_secs(1),
            Duration::from_millis(1),
            &token,
            || async { Ok(false) },
        )
        .await;
        assert!(matches!(result, Err(BenchError::Cancelled)));
    }
}
