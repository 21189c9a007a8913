//! Background loops: periodic broadcast, the two sweeps, and the optional process scan.
//!
//! Each loop waits one full period before its first run and stops when the shutdown token
//! is cancelled.

use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::process_monitor::ProcessMonitor;
use crate::tracker::SessionTracker;

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    shutdown: CancellationToken,
    mut tick: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send,
{
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        debug!(name, period_ms = period.as_millis() as u64, "Background loop started");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => tick().await,
            }
        }
        debug!(name, "Background loop stopped");
    })
}

/// Periodic resync of the published list. The sink skips the write when only `updated_at`
/// differs, so this only lands on disk after an earlier write was missed or failed.
pub fn spawn_broadcast_loop(
    tracker: Arc<SessionTracker>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("broadcast", period, shutdown, move || {
        let tracker = Arc::clone(&tracker);
        async move { tracker.broadcast() }
    })
}

pub fn spawn_orphan_sweep(
    tracker: Arc<SessionTracker>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("orphan_sweep", period, shutdown, move || {
        let tracker = Arc::clone(&tracker);
        async move {
            let removed = tracker.sweep_orphans().await;
            if removed > 0 {
                info!(removed, "Orphaned sessions removed");
            }
        }
    })
}

pub fn spawn_expiry_sweep(
    tracker: Arc<SessionTracker>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("expiry_sweep", period, shutdown, move || {
        let tracker = Arc::clone(&tracker);
        async move {
            let removed = tracker.expire_stale(Utc::now());
            if removed > 0 {
                info!(removed, "Stale sessions expired");
            }
        }
    })
}

pub fn spawn_process_scan(
    monitor: Arc<ProcessMonitor>,
    period: Duration,
    shutdown: CancellationToken,
) -> JoinHandle<()> {
    spawn_periodic("process_scan", period, shutdown, move || {
        let monitor = Arc::clone(&monitor);
        async move {
            monitor.scan().await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test(start_paused = true)]
    async fn first_run_waits_a_full_period() {
        let runs = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();
        let counter = Arc::clone(&runs);
        let handle = spawn_periodic("test", Duration::from_secs(5), shutdown.clone(), move || {
            let counter = Arc::clone(&counter);
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        shutdown.cancel();
        handle.await.expect("loop task");
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);
    }
}
