// ── Zenfeed Engine: Upstream Retry Pacing & Circuit Breaker ────────────────
// Shared policy pieces for talking to flaky upstreams (the LLM endpoint,
// webhook sinks). Both read time exclusively through the crate's
// injectable Clock, so retry pacing and breaker cooldowns are exact in
// tests driven by a manual clock.
//
//   Backoff        — exponential delay with a Retry-After floor and a
//                    deterministic ±25% spread seeded from the clock
//   CircuitBreaker — closed/open state machine; trips after N straight
//                    failures, lets one probe through per cooldown

use crate::atoms::traits::Clock;
use log::warn;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

/// Default maximum number of retry attempts per request.
pub const MAX_RETRIES: u32 = 3;

/// Floor for any computed delay; a zero sleep stampedes the upstream.
const MIN_DELAY_MS: u64 = 100;

// ── Retryable status detection ─────────────────────────────────────────────

/// Check if an HTTP status code represents a transient/retryable error.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500 | 502 | 503 | 504)
}

/// Parse a Retry-After header value (integer seconds only).
/// HTTP-date format is not implemented — falls back to computed backoff.
pub fn parse_retry_after(header_value: &str) -> Option<u64> {
    header_value.trim().parse::<u64>().ok()
}

// ── Backoff ────────────────────────────────────────────────────────────────

/// Retry schedule for one upstream: doubling delays from `base` up to
/// `cap`, a server-sent Retry-After honored when it is longer, and the
/// final delay spread over ±25% to keep callers from synchronizing.
pub struct Backoff {
    clock: Arc<dyn Clock>,
    base: Duration,
    cap: Duration,
}

impl Backoff {
    /// Standard schedule for API calls: 1s doubling to 30s.
    pub fn new(clock: Arc<dyn Clock>) -> Backoff {
        Backoff { clock, base: Duration::from_secs(1), cap: Duration::from_secs(30) }
    }

    /// Delay before retry `attempt` (0-based), without sleeping.
    pub fn delay(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let base_ms = self.base.as_millis() as u64;
        let exp_ms = base_ms
            .saturating_mul(1u64 << attempt.min(15))
            .min(self.cap.as_millis() as u64);
        // Retry-After wins only when longer than our own schedule, and a
        // server cannot stall us for more than a minute.
        let wanted_ms = match retry_after_secs {
            Some(secs) => (secs.min(60) * 1000).max(exp_ms),
            None => exp_ms,
        };
        Duration::from_millis(self.spread(wanted_ms))
    }

    /// Sleep out the delay; returns it for logging.
    pub async fn wait(&self, attempt: u32, retry_after_secs: Option<u64>) -> Duration {
        let delay = self.delay(attempt, retry_after_secs);
        tokio::time::sleep(delay).await;
        delay
    }

    /// Map a delay into [0.75×, 1.25×], seeded from the clock millis.
    /// Deterministic under a manual clock, well-spread under the real one.
    fn spread(&self, base_ms: u64) -> u64 {
        let band = base_ms / 2;
        if band == 0 {
            return base_ms.max(MIN_DELAY_MS);
        }
        let seed = self.clock.now_ms() % 1000;
        let offset = band * seed / 999;
        (base_ms - band / 2 + offset).max(MIN_DELAY_MS)
    }
}

// ── Circuit Breaker ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy)]
enum BreakerState {
    /// Normal operation, counting consecutive failures.
    Closed { failures: u32 },
    /// Rejecting requests since `since_ms`; one probe allowed per elapsed
    /// cooldown. A failed probe re-opens from the probe's own time.
    Open { since_ms: u64 },
}

/// Fail-fast guard in front of one upstream.
pub struct CircuitBreaker {
    state: Mutex<BreakerState>,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    pub fn new(threshold: u32, cooldown: Duration, clock: Arc<dyn Clock>) -> CircuitBreaker {
        CircuitBreaker {
            state: Mutex::new(BreakerState::Closed { failures: 0 }),
            threshold: threshold.max(1),
            cooldown,
            clock,
        }
    }

    /// `Ok(())` if a request may proceed, `Err(message)` while open.
    pub fn check(&self) -> Result<(), String> {
        let state = *self.state.lock();
        match state {
            BreakerState::Closed { .. } => Ok(()),
            BreakerState::Open { since_ms } => {
                let elapsed = Duration::from_millis(self.clock.now_ms().saturating_sub(since_ms));
                if elapsed < self.cooldown {
                    Err(format!(
                        "circuit open, {}s of cooldown remaining",
                        (self.cooldown - elapsed).as_secs()
                    ))
                } else {
                    // Half-open: this caller is the probe.
                    Ok(())
                }
            }
        }
    }

    pub fn record_success(&self) {
        *self.state.lock() = BreakerState::Closed { failures: 0 };
    }

    pub fn record_failure(&self) {
        let mut state = self.state.lock();
        *state = match *state {
            BreakerState::Closed { failures } if failures + 1 >= self.threshold => {
                warn!(
                    "[http] circuit tripped after {} consecutive failures, cooling down {:?}",
                    failures + 1,
                    self.cooldown
                );
                BreakerState::Open { since_ms: self.clock.now_ms() }
            }
            BreakerState::Closed { failures } => BreakerState::Closed { failures: failures + 1 },
            // A failed probe restarts the cooldown.
            BreakerState::Open { .. } => BreakerState::Open { since_ms: self.clock.now_ms() },
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    struct ManualClock(AtomicU64);

    impl ManualClock {
        fn at(ms: u64) -> Arc<Self> {
            Arc::new(ManualClock(AtomicU64::new(ms)))
        }
        fn advance(&self, ms: u64) {
            self.0.fetch_add(ms, Ordering::SeqCst);
        }
    }

    impl Clock for ManualClock {
        fn now_ms(&self) -> u64 {
            self.0.load(Ordering::SeqCst)
        }
    }

    #[test]
    fn retryable_statuses() {
        assert!(is_retryable_status(408));
        assert!(is_retryable_status(429));
        assert!(is_retryable_status(500));
        assert!(is_retryable_status(503));
        assert!(!is_retryable_status(200));
        assert!(!is_retryable_status(400));
        assert!(!is_retryable_status(401));
        assert!(!is_retryable_status(404));
    }

    #[test]
    fn parse_retry_after_values() {
        assert_eq!(parse_retry_after("5"), Some(5));
        assert_eq!(parse_retry_after(" 30 "), Some(30));
        assert_eq!(parse_retry_after("Wed, 21 Oct 2026 07:28:00 GMT"), None);
    }

    #[test]
    fn backoff_doubles_and_caps() {
        // Clock at a multiple of 1000 → seed 0 → exactly 0.75× the base.
        let b = Backoff::new(ManualClock::at(1_000_000));
        assert_eq!(b.delay(0, None), Duration::from_millis(750));
        assert_eq!(b.delay(1, None), Duration::from_millis(1_500));
        assert_eq!(b.delay(3, None), Duration::from_millis(6_000));
        // Past the cap every attempt lands on 0.75 × 30s.
        assert_eq!(b.delay(9, None), Duration::from_millis(22_500));
        assert_eq!(b.delay(40, None), Duration::from_millis(22_500));
    }

    #[test]
    fn backoff_spread_covers_both_sides() {
        // Seed 999 → full offset → 1.25× the base.
        let high = Backoff::new(ManualClock::at(999));
        assert_eq!(high.delay(0, None), Duration::from_millis(1_250));
        // Mid seed lands inside the band.
        let mid = Backoff::new(ManualClock::at(500));
        let d = mid.delay(0, None).as_millis() as u64;
        assert!((750..=1_250).contains(&d), "delay {}", d);
    }

    #[test]
    fn retry_after_floors_at_computed_backoff() {
        let b = Backoff::new(ManualClock::at(1_000_000));
        // Retry-After of 1s is below the attempt-4 delay (16s) — ignored.
        assert_eq!(b.delay(4, Some(1)), Duration::from_millis(12_000));
        // A longer Retry-After wins (45s, spread to 0.75×).
        assert_eq!(b.delay(0, Some(45)), Duration::from_millis(33_750));
        // And is capped at one minute before the spread.
        assert_eq!(b.delay(0, Some(3_600)), Duration::from_millis(45_000));
    }

    #[test]
    fn circuit_trips_and_cools_down() {
        let clock = ManualClock::at(1_000);
        let cb = CircuitBreaker::new(3, Duration::from_secs(60), clock.clone());

        assert!(cb.check().is_ok());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_ok()); // 2 failures, threshold is 3
        cb.record_failure();
        assert!(cb.check().is_err()); // open

        // Cooldown elapsed → one probe allowed.
        clock.advance(61_000);
        assert!(cb.check().is_ok());
    }

    #[test]
    fn failed_probe_restarts_cooldown() {
        let clock = ManualClock::at(0);
        let cb = CircuitBreaker::new(1, Duration::from_secs(60), clock.clone());

        cb.record_failure();
        assert!(cb.check().is_err());

        clock.advance(61_000);
        assert!(cb.check().is_ok()); // probe
        cb.record_failure(); // probe failed
        clock.advance(30_000);
        assert!(cb.check().is_err()); // cooldown counts from the probe
    }

    #[test]
    fn success_closes_the_circuit() {
        let clock = ManualClock::at(0);
        let cb = CircuitBreaker::new(2, Duration::from_secs(60), clock.clone());
        cb.record_failure();
        cb.record_failure();
        assert!(cb.check().is_err());

        clock.advance(61_000);
        assert!(cb.check().is_ok());
        cb.record_success(); // probe succeeded
        cb.record_failure(); // a lone failure does not re-trip
        assert!(cb.check().is_ok());
    }
}
