// ── Zenfeed Engine: Scheduler ──────────────────────────────────────────────
// Periodic job dispatcher for feed polling, rule evaluation and
// maintenance. Each job owns a driver task that sleeps one jittered
// period, then fires the handler as a separate task.
//
// Coalescing: a tick that arrives while the previous run of the same job
// is still in flight is skipped and counted — slow handlers never stack.
// Shutdown cancels the shared token and waits for drivers and in-flight
// handlers to unwind.

use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct SchedulerStats {
    pub ticks_run: AtomicU64,
    pub ticks_coalesced: AtomicU64,
}

pub struct Scheduler {
    cancel: CancellationToken,
    drivers: Mutex<Vec<JoinHandle<()>>>,
    stats: Arc<SchedulerStats>,
}

impl Scheduler {
    /// Jobs observe cancellation through children of `cancel`.
    pub fn new(cancel: CancellationToken) -> Scheduler {
        Scheduler {
            cancel,
            drivers: Mutex::new(Vec::new()),
            stats: Arc::new(SchedulerStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<SchedulerStats> {
        self.stats.clone()
    }

    /// Register a periodic job. `jitter` is the fraction of the period by
    /// which each tick is randomly shifted (0.0 disables it). The handler
    /// receives a child token and must return promptly once it fires.
    pub fn register<F, Fut>(&self, name: &str, period: Duration, jitter: f64, handler: F)
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let name = name.to_string();
        let cancel = self.cancel.clone();
        let stats = self.stats.clone();

        let driver = tokio::spawn(async move {
            let mut running: Option<JoinHandle<()>> = None;
            loop {
                let delay = jittered(period, jitter);
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(delay) => {}
                }

                if let Some(handle) = &running {
                    if !handle.is_finished() {
                        stats.ticks_coalesced.fetch_add(1, Ordering::Relaxed);
                        log::debug!("[sched] {}: previous run still in flight, tick skipped", name);
                        continue;
                    }
                }

                stats.ticks_run.fetch_add(1, Ordering::Relaxed);
                let fut = handler(cancel.child_token());
                running = Some(tokio::spawn(fut));
            }
            // Wait for a still-running handler to observe cancellation.
            if let Some(handle) = running.take() {
                let _ = handle.await;
            }
        });
        self.drivers.lock().push(driver);
    }

    /// Cancel every job and wait for drivers and handlers to finish.
    pub async fn shutdown(&self) {
        self.cancel.cancel();
        let drivers: Vec<JoinHandle<()>> = self.drivers.lock().drain(..).collect();
        for d in drivers {
            let _ = d.await;
        }
        log::info!(
            "[sched] stopped ({} ticks run, {} coalesced)",
            self.stats.ticks_run.load(Ordering::Relaxed),
            self.stats.ticks_coalesced.load(Ordering::Relaxed)
        );
    }
}

/// Shift a period by up to ±jitter/2 of its length, sourced from the
/// system clock nanos (no RNG dependency).
fn jittered(period: Duration, jitter: f64) -> Duration {
    if jitter <= 0.0 {
        return period;
    }
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos();
    let unit = (nanos % 1000) as f64 / 999.0; // [0, 1]
    let factor = 1.0 + jitter * (unit - 0.5);
    period.mul_f64(factor.max(0.05))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[test]
    fn jitter_zero_is_exact() {
        assert_eq!(jittered(Duration::from_secs(10), 0.0), Duration::from_secs(10));
    }

    #[test]
    fn jitter_stays_within_half_fraction() {
        for _ in 0..32 {
            let d = jittered(Duration::from_secs(100), 0.2);
            assert!(d >= Duration::from_secs(90) && d <= Duration::from_secs(110), "{:?}", d);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn ticks_fire_periodically() {
        let sched = Scheduler::new(CancellationToken::new());
        let count = Arc::new(AtomicU64::new(0));
        let c = count.clone();
        sched.register("t", Duration::from_millis(100), 0.0, move |_| {
            let c = c.clone();
            async move {
                c.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(550)).await;
        sched.shutdown().await;
        assert!(count.load(Ordering::SeqCst) >= 4);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_handler_coalesces_ticks() {
        let sched = Scheduler::new(CancellationToken::new());
        let runs = Arc::new(AtomicU64::new(0));
        let r = runs.clone();
        sched.register("slow", Duration::from_millis(100), 0.0, move |_| {
            let r = r.clone();
            async move {
                r.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(250)).await;
            }
        });

        tokio::time::sleep(Duration::from_millis(1050)).await;
        sched.shutdown().await;

        let stats = sched.stats();
        let run = stats.ticks_run.load(Ordering::SeqCst);
        let skipped = stats.ticks_coalesced.load(Ordering::SeqCst);
        assert!(run >= 2, "expected some runs, got {}", run);
        assert!(skipped >= 2, "expected coalesced ticks, got {}", skipped);
        // A 250ms handler on a 100ms period can never run every tick.
        assert!(run < 10);
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_in_flight_handler() {
        let sched = Scheduler::new(CancellationToken::new());
        let observed = Arc::new(AtomicBool::new(false));
        let o = observed.clone();
        sched.register("hang", Duration::from_millis(10), 0.0, move |cancel| {
            let o = o.clone();
            async move {
                cancel.cancelled().await;
                o.store(true, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        sched.shutdown().await;
        assert!(observed.load(Ordering::SeqCst));
    }
}
