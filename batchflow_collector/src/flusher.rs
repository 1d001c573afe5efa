//! A background task bounding the latency of partially filled batches.
//!
//! A buffer only ships when it fills or when its collector is flushed, so a
//! quiet stream can hold records indefinitely. [`PeriodicFlusher`] flushes a
//! shared collector on a fixed period until shut down, then flushes one last
//! time.

use std::sync::Arc;
use std::time::Duration;

use observability_deps::tracing::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::{BatchSink, BatchingCollector, EmitError};

/// Something holding buffers that can be drained on demand.
pub trait Flush: Send + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Ship every buffered record, returning the number of buffers shipped.
    fn flush(&mut self) -> Result<usize, Self::Error>;
}

impl<S> Flush for BatchingCollector<S>
where
    S: BatchSink + 'static,
{
    type Error = EmitError<S::Error>;

    fn flush(&mut self) -> Result<usize, Self::Error> {
        Self::flush(self)
    }
}

/// Flushes a shared [`Flush`] implementation on a fixed period.
///
/// Dropping the flusher without calling [`Self::shutdown`] still stops the
/// loop after its final flush, but does not wait for it.
#[derive(Debug)]
pub struct PeriodicFlusher {
    shutdown: CancellationToken,
    /// Taken by [`Self::shutdown`].
    handle: Option<JoinHandle<()>>,
}

impl PeriodicFlusher {
    /// Spawn the flush loop onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if `period` is zero.
    pub fn spawn<F>(target: Arc<Mutex<F>>, period: Duration) -> Self
    where
        F: Flush,
    {
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();

        let handle = tokio::spawn(async move {
            info!(?period, "starting periodic flusher");

            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = interval.tick() => flush_once(&target),
                }
            }

            flush_once(&target);
            info!("stopped periodic flusher");
        });

        Self {
            shutdown,
            handle: Some(handle),
        }
    }

    /// A token cancelling the flush loop when triggered.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Stop the flush loop and wait for its final flush.
    pub async fn shutdown(mut self) {
        self.shutdown.cancel();
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "periodic flusher task failed");
            }
        }
    }
}

impl Drop for PeriodicFlusher {
    fn drop(&mut self) {
        if !self.shutdown.is_cancelled() {
            warn!("PeriodicFlusher dropped without calling shutdown()");
            self.shutdown.cancel();
        }
    }
}

fn flush_once<F>(target: &Mutex<F>)
where
    F: Flush,
{
    match target.lock().flush() {
        Ok(0) => {}
        Ok(shipped) => debug!(shipped, "periodic flush"),
        Err(e) => error!(error = %e, "periodic flush failed"),
    }
}
