//! Background Expiry Sweeper
//!
//! Lazy expiry only reclaims an entry when some request happens to touch
//! it. An entry that expires and is never read again would hold its
//! off-heap block forever. The sweeper is an optional background task that
//! periodically walks every segment and evicts what has expired.
//!
//! Evictions made by the sweeper go through the same path as lazy ones, so
//! listeners see exactly one event per expired entry no matter who found it.
//!
//! ## Adaptive Frequency
//!
//! If a sweep evicts a large share of the entries, the next one runs sooner.
//! If a sweep finds nothing, the sweeper backs off to save CPU.

use super::SegmentedSet;
use crate::codec::EntityCodec;
use crate::config::SweeperConfig;
use crate::error::Result;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

/// A handle to the running expiry sweeper.
///
/// When this handle is dropped, the sweeper task will be stopped.
#[derive(Debug)]
pub struct ExpirySweeper {
    /// Sender to signal shutdown
    shutdown_tx: watch::Sender<bool>,
}

impl ExpirySweeper {
    /// Starts the sweeper as a background task. Must be called from within
    /// a Tokio runtime.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let set = Arc::new(SegmentedSet::new(codec, StoreConfig::default())?);
    /// let sweeper = ExpirySweeper::start(Arc::clone(&set), SweeperConfig::default())?;
    ///
    /// // Sweeper runs in the background...
    ///
    /// // Dropping the sweeper will stop it
    /// drop(sweeper);
    /// ```
    pub fn start<C: EntityCodec>(set: Arc<SegmentedSet<C>>, config: SweeperConfig) -> Result<Self> {
        config.validate()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        tokio::spawn(sweeper_loop(set, config, shutdown_rx));

        info!("Background expiry sweeper started");

        Ok(Self { shutdown_tx })
    }

    /// Stops the sweeper.
    ///
    /// This is called automatically when the handle is dropped.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(true);
        info!("Background expiry sweeper stopped");
    }
}

impl Drop for ExpirySweeper {
    fn drop(&mut self) {
        self.stop();
    }
}

/// The main sweeper loop.
async fn sweeper_loop<C: EntityCodec>(
    set: Arc<SegmentedSet<C>>,
    config: SweeperConfig,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    let mut current_interval = config.base_interval;

    loop {
        tokio::select! {
            _ = tokio::time::sleep(current_interval) => {}
            result = shutdown_rx.changed() => {
                if result.is_err() || *shutdown_rx.borrow() {
                    debug!("Expiry sweeper received shutdown signal");
                    return;
                }
            }
        }

        let before = set.len();

        // Segment scans take blocking locks; keep them off the async workers.
        let sweep_set = Arc::clone(&set);
        let expired = match tokio::task::spawn_blocking(move || sweep_set.evict_expired()).await {
            Ok(Ok(expired)) => expired,
            Ok(Err(e)) => {
                warn!(error = %e, "Expiry sweep failed");
                continue;
            }
            Err(e) => {
                warn!(error = %e, "Expiry sweep task failed");
                continue;
            }
        };

        current_interval = next_interval(&config, current_interval, before, expired);

        if expired > 0 {
            debug!(
                expired = expired,
                remaining = set.len(),
                next_interval_ms = current_interval.as_millis(),
                "Expired entries swept"
            );
        }
    }
}

/// Computes the interval before the next sweep.
fn next_interval(
    config: &SweeperConfig,
    current: Duration,
    entries_before: usize,
    expired: usize,
) -> Duration {
    if entries_before == 0 {
        return current;
    }

    let expiry_rate = expired as f64 / entries_before as f64;
    if expiry_rate > config.speedup_threshold {
        (current / 2).max(config.min_interval)
    } else if expiry_rate < config.slowdown_threshold && expired == 0 {
        let slower = (current * 2).min(config.max_interval);
        trace!(new_interval_ms = slower.as_millis(), "Low expiry rate, slowing down sweeper");
        slower
    } else {
        current
    }
}
