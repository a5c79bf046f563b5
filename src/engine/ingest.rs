// ── Zenfeed Engine: Ingester ───────────────────────────────────────────────
// One ingester per feed source, fired by the scheduler. A run is:
// fetch → parse → (crawl) → dedup by fingerprint → enrich → append,
// strictly in published order, advancing the persisted watermark only past
// items that actually reached the store. An upstream failure ends the run
// with partial progress; the next tick resumes from the watermark.

use crate::atoms::config::{EnrichConfig, SourceConfig};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::Clock;
use crate::atoms::types::{FeedItem, Record};
use crate::engine::cache::CacheDb;
use crate::engine::enrich::Enricher;
use crate::engine::feed::{parse_feed, FeedEntry};
use crate::engine::store::Store;
use crate::engine::web::HttpContext;
use chrono::{TimeZone, Utc};
use log::{debug, info, warn};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

#[derive(Default)]
pub struct IngestStats {
    pub items_seen: AtomicU64,
    pub items_ingested: AtomicU64,
    pub duplicates: AtomicU64,
    pub crawl_skipped: AtomicU64,
    pub items_dropped: AtomicU64,
}

/// Exponential backoff schedule for embedding retries.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base: Duration,
    pub factor: f64,
    pub cap: Duration,
}

impl RetryPolicy {
    pub fn from_config(cfg: &EnrichConfig) -> RetryPolicy {
        RetryPolicy {
            max_attempts: cfg.max_attempts.max(1),
            base: cfg.backoff_base,
            factor: cfg.backoff_factor,
            cap: cfg.backoff_cap,
        }
    }

    /// Delay before retry `attempt` (0-based): base × factor^attempt, capped.
    pub fn delay(&self, attempt: u32) -> Duration {
        let scaled = self.base.mul_f64(self.factor.powi(attempt as i32));
        scaled.min(self.cap)
    }
}

pub struct Ingester {
    source: SourceConfig,
    http: Arc<HttpContext>,
    store: Arc<Store>,
    enricher: Arc<Enricher>,
    cache: Arc<CacheDb>,
    clock: Arc<dyn Clock>,
    retry: RetryPolicy,
    stats: Arc<IngestStats>,
}

impl Ingester {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        source: SourceConfig,
        http: Arc<HttpContext>,
        store: Arc<Store>,
        enricher: Arc<Enricher>,
        cache: Arc<CacheDb>,
        clock: Arc<dyn Clock>,
        retry: RetryPolicy,
    ) -> Ingester {
        Ingester {
            source,
            http,
            store,
            enricher,
            cache,
            clock,
            retry,
            stats: Arc::new(IngestStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<IngestStats> {
        self.stats.clone()
    }

    /// One poll of the source. Items are processed sequentially in
    /// published order; cross-source parallelism comes from the scheduler.
    pub async fn run_once(&self, cancel: &CancellationToken) -> EngineResult<()> {
        let xml = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.http.fetch_text(&self.source.url) => result?,
        };
        let doc = parse_feed(&xml)?;

        let watermark = self.cache.watermark(&self.source.id)?.unwrap_or(0);
        let now_ms = self.clock.now_ms();
        let candidates = candidate_entries(doc.entries, watermark, now_ms);
        if candidates.is_empty() {
            debug!("[ingest] {}: nothing new", self.source.id);
            return Ok(());
        }
        info!("[ingest] {}: {} candidate item(s)", self.source.id, candidates.len());

        for (entry, published_ms) in candidates {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            self.stats.items_seen.fetch_add(1, Ordering::Relaxed);

            let content_markdown = if self.source.crawl {
                match self.crawl_entry(&entry.link, cancel).await {
                    Ok(md) => Some(md),
                    Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                    Err(e) => {
                        self.stats.crawl_skipped.fetch_add(1, Ordering::Relaxed);
                        warn!("[ingest] {}: crawl of {} skipped: {}", self.source.id, entry.link, e);
                        None
                    }
                }
            } else {
                None
            };

            let item = FeedItem {
                source_id: self.source.id.clone(),
                link: entry.link.clone(),
                title: entry.title.clone(),
                published_at: Utc
                    .timestamp_millis_opt(published_ms as i64)
                    .single()
                    .unwrap_or_else(Utc::now),
                raw: entry.summary.clone(),
                content_markdown,
            };
            let fingerprint = item.fingerprint();

            if self.store.contains(fingerprint) {
                self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                self.cache.set_watermark(&self.source.id, published_ms)?;
                continue;
            }

            let record = match self.enrich_with_retry(&item, cancel).await {
                Ok(r) => r,
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => {
                    self.stats.items_dropped.fetch_add(1, Ordering::Relaxed);
                    warn!(
                        "[ingest] {}: dropping {} after {} attempt(s): {}",
                        self.source.id, entry.link, self.retry.max_attempts, e
                    );
                    continue;
                }
            };

            match self.store.append(&record) {
                Ok(()) => {
                    self.stats.items_ingested.fetch_add(1, Ordering::Relaxed);
                    self.cache.set_watermark(&self.source.id, published_ms)?;
                }
                Err(e) if e.is_duplicate() => {
                    info!("[ingest] {}: {} already stored", self.source.id, entry.link);
                    self.stats.duplicates.fetch_add(1, Ordering::Relaxed);
                    self.cache.set_watermark(&self.source.id, published_ms)?;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    async fn crawl_entry(&self, link: &str, cancel: &CancellationToken) -> EngineResult<String> {
        tokio::select! {
            _ = cancel.cancelled() => Err(EngineError::Cancelled),
            result = self.http.crawl(link) => result,
        }
    }

    /// Enrich with the configured retry budget; only the embedding (or a
    /// critical field) makes `enrich` fail, so every failure here is worth
    /// the backoff.
    async fn enrich_with_retry(
        &self,
        item: &FeedItem,
        cancel: &CancellationToken,
    ) -> EngineResult<Record> {
        let mut last = EngineError::internal("no enrichment attempt ran");
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.delay(attempt - 1);
                debug!(
                    "[ingest] {}: enrichment retry {}/{} in {:?}",
                    self.source.id, attempt, self.retry.max_attempts - 1, delay
                );
                tokio::select! {
                    _ = cancel.cancelled() => return Err(EngineError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            match self.enricher.enrich(item, &self.source.labels_extra, cancel).await {
                Ok(record) => return Ok(record),
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

/// Items newer than the watermark, oldest first. Entries without a date
/// are stamped with the poll time so they are ingested exactly once (their
/// fingerprint dedups later polls).
fn candidate_entries(
    entries: Vec<FeedEntry>,
    watermark_ms: u64,
    now_ms: u64,
) -> Vec<(FeedEntry, u64)> {
    let mut out: Vec<(FeedEntry, u64)> = entries
        .into_iter()
        .map(|e| {
            let published_ms = e
                .published
                .map(|dt| dt.timestamp_millis().max(0) as u64)
                .unwrap_or(now_ms);
            (e, published_ms)
        })
        .filter(|(_, ms)| *ms > watermark_ms)
        .collect();
    out.sort_by_key(|(_, ms)| *ms);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(link: &str, published_ms: Option<u64>) -> FeedEntry {
        FeedEntry {
            title: link.to_string(),
            link: link.to_string(),
            published: published_ms
                .map(|ms| Utc.timestamp_millis_opt(ms as i64).single().unwrap()),
            summary: String::new(),
        }
    }

    #[test]
    fn candidates_filter_by_watermark_and_sort_ascending() {
        let entries = vec![
            entry("https://e.com/c", Some(3000)),
            entry("https://e.com/a", Some(1000)),
            entry("https://e.com/b", Some(2000)),
        ];
        let picked = candidate_entries(entries, 1000, 9999);
        let links: Vec<&str> = picked.iter().map(|(e, _)| e.link.as_str()).collect();
        assert_eq!(links, vec!["https://e.com/b", "https://e.com/c"]);
    }

    #[test]
    fn undated_entries_get_poll_time() {
        let picked = candidate_entries(vec![entry("https://e.com/x", None)], 0, 5000);
        assert_eq!(picked[0].1, 5000);
    }

    #[test]
    fn undated_entries_respect_watermark_at_poll_time() {
        // Watermark equal to poll time → undated entry is not re-ingested.
        let picked = candidate_entries(vec![entry("https://e.com/x", None)], 5000, 5000);
        assert!(picked.is_empty());
    }

    #[test]
    fn retry_policy_grows_and_caps() {
        let p = RetryPolicy {
            max_attempts: 5,
            base: Duration::from_secs(2),
            factor: 2.0,
            cap: Duration::from_secs(10),
        };
        assert_eq!(p.delay(0), Duration::from_secs(2));
        assert_eq!(p.delay(1), Duration::from_secs(4));
        assert_eq!(p.delay(2), Duration::from_secs(8));
        assert_eq!(p.delay(3), Duration::from_secs(10)); // capped
        assert_eq!(p.delay(10), Duration::from_secs(10));
    }
}
