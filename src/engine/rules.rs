// ── Zenfeed Engine: Rule Evaluator ─────────────────────────────────────────
// Runs stored queries on a period and dispatches fresh matches to their
// channel, at most once per (rule version, item) within the rule's dedup
// window.
//
// Dispatch bookkeeping: a per-rule log of dispatch keys with timestamps.
// A key is recorded only after the channel acked (or permanently rejected)
// the delivery — a retryable failure leaves the key unrecorded so the next
// tick retries. Keys older than the dedup window are purged; a hard cap
// bounds memory if a rule matches far more than expected.

use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::fingerprint::dispatch_key;
use crate::atoms::traits::{Clock, NotificationChannel};
use crate::atoms::types::{Query, QueryHit, Rule, SendOutcome, TimeRange};
use crate::engine::channels::render_message;
use crate::engine::query::QueryPlanner;
use crate::engine::store::Store;
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct RuleStats {
    pub dispatched: AtomicU64,
    pub deduped: AtomicU64,
    pub send_failures: AtomicU64,
}

// ── Dispatch log ───────────────────────────────────────────────────────────

/// Recent dispatch keys of one rule.
pub struct DispatchLog {
    entries: HashMap<u64, u64>,
    window_ms: u64,
    cap: usize,
}

impl DispatchLog {
    pub fn new(window_ms: u64, cap: usize) -> DispatchLog {
        DispatchLog { entries: HashMap::new(), window_ms, cap: cap.max(1) }
    }

    pub fn contains(&self, key: u64) -> bool {
        self.entries.contains_key(&key)
    }

    pub fn record(&mut self, key: u64, now_ms: u64) {
        self.entries.insert(key, now_ms);
    }

    /// Drop expired keys; past the cap, drop oldest first.
    pub fn purge(&mut self, now_ms: u64) {
        self.entries
            .retain(|_, recorded| now_ms.saturating_sub(*recorded) < self.window_ms);
        while self.entries.len() > self.cap {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, recorded)| **recorded)
                .map(|(k, _)| *k);
            match oldest {
                Some(k) => {
                    self.entries.remove(&k);
                }
                None => break,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

struct ActiveRule {
    rule: Rule,
    dispatch_log: DispatchLog,
}

// ── Evaluator ──────────────────────────────────────────────────────────────

pub struct RuleEvaluator {
    store: Arc<Store>,
    planner: Arc<QueryPlanner>,
    channels: HashMap<String, Arc<dyn NotificationChannel>>,
    clock: Arc<dyn Clock>,
    rules: Mutex<HashMap<String, ActiveRule>>,
    stats: Arc<RuleStats>,
}

impl RuleEvaluator {
    pub fn new(
        store: Arc<Store>,
        planner: Arc<QueryPlanner>,
        channels: HashMap<String, Arc<dyn NotificationChannel>>,
        clock: Arc<dyn Clock>,
    ) -> RuleEvaluator {
        RuleEvaluator {
            store,
            planner,
            channels,
            clock,
            rules: Mutex::new(HashMap::new()),
            stats: Arc::new(RuleStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<RuleStats> {
        self.stats.clone()
    }

    /// Register (or replace) a rule. Replacing resets its dispatch log;
    /// the version inside the dispatch key keeps old items deduplicated
    /// only if the version did not change.
    pub fn register(&self, rule: Rule) -> EngineResult<()> {
        if !self.channels.contains_key(&rule.channel) {
            return Err(EngineError::Config(format!(
                "rule {}: unknown channel {}",
                rule.id, rule.channel
            )));
        }
        let window_ms = rule.dedup_window.as_millis() as u64;
        // Expected live keys: matches per tick × ticks per window.
        let ticks = (rule.dedup_window.as_secs_f64() / rule.period.as_secs_f64()).ceil() as usize;
        let cap = (rule.k.saturating_mul(ticks.max(1))).clamp(64, 65_536);

        info!("[rules] registered {} v{} (cap {})", rule.id, rule.version, cap);
        self.rules.lock().insert(
            rule.id.clone(),
            ActiveRule { rule, dispatch_log: DispatchLog::new(window_ms, cap) },
        );
        Ok(())
    }

    pub fn unregister(&self, rule_id: &str) -> EngineResult<()> {
        match self.rules.lock().remove(rule_id) {
            Some(_) => {
                info!("[rules] unregistered {}", rule_id);
                Ok(())
            }
            None => Err(EngineError::NotFound),
        }
    }

    pub fn rule_ids(&self) -> Vec<String> {
        self.rules.lock().keys().cloned().collect()
    }

    /// One tick of one rule, bounded by the rule's own period.
    pub async fn evaluate(&self, rule_id: &str, cancel: &CancellationToken) -> EngineResult<()> {
        let rule = {
            let rules = self.rules.lock();
            let active = rules.get(rule_id).ok_or(EngineError::NotFound)?;
            active.rule.clone()
        };
        match tokio::time::timeout(rule.period, self.evaluate_rule(&rule, cancel)).await {
            Ok(result) => result,
            Err(_) => Err(EngineError::Timeout(format!(
                "rule {} tick exceeded its period ({:?})",
                rule.id, rule.period
            ))),
        }
    }

    async fn evaluate_rule(&self, rule: &Rule, cancel: &CancellationToken) -> EngineResult<()> {
        let vector = match &rule.query_text {
            Some(text) => Some(self.planner.embed_text(text).await?),
            None => None,
        };

        let now_ms = self.clock.now_ms();
        let lookback_ms = rule.lookback.as_millis() as u64;
        let hits = self.store.query(&Query {
            time_range: TimeRange::new(now_ms.saturating_sub(lookback_ms), now_ms),
            filter: rule.filter.clone(),
            vector,
            k: rule.k,
            threshold: rule.threshold,
        })?;

        let channel = self
            .channels
            .get(&rule.channel)
            .cloned()
            .ok_or_else(|| EngineError::Config(format!("unknown channel {}", rule.channel)))?;

        // Filter already-dispatched hits under the lock, send without it.
        let pending: Vec<QueryHit> = {
            let mut rules = self.rules.lock();
            let active = rules.get_mut(&rule.id).ok_or(EngineError::NotFound)?;
            active.dispatch_log.purge(now_ms);
            hits.into_iter()
                .filter(|hit| {
                    let key = dispatch_key(&rule.id, &rule.version, hit.record.fingerprint);
                    if active.dispatch_log.contains(key) {
                        self.stats.deduped.fetch_add(1, Ordering::Relaxed);
                        false
                    } else {
                        true
                    }
                })
                .collect()
        };

        if pending.is_empty() {
            debug!("[rules] {}: no new matches", rule.id);
            return Ok(());
        }

        for hit in pending {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            let key = dispatch_key(&rule.id, &rule.version, hit.record.fingerprint);
            let message = render_message(&rule.message_template, &hit.record);

            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                outcome = channel.send(&rule.id, &hit.record, &message) => outcome,
            };

            match outcome {
                SendOutcome::Ok => {
                    self.stats.dispatched.fetch_add(1, Ordering::Relaxed);
                    self.record_dispatch(&rule.id, key);
                }
                SendOutcome::Permanent => {
                    // Rejected for good — record so the rule stops retrying.
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[rules] {}: channel permanently rejected {:#x}", rule.id, key);
                    self.record_dispatch(&rule.id, key);
                }
                SendOutcome::Retryable => {
                    self.stats.send_failures.fetch_add(1, Ordering::Relaxed);
                    warn!("[rules] {}: delivery failed, will retry next tick", rule.id);
                }
            }
        }
        Ok(())
    }

    fn record_dispatch(&self, rule_id: &str, key: u64) {
        let now_ms = self.clock.now_ms();
        let mut rules = self.rules.lock();
        // The rule may have been unregistered mid-tick; nothing to record.
        if let Some(active) = rules.get_mut(rule_id) {
            active.dispatch_log.record(key, now_ms);
        }
    }
}
