// ── Zenfeed Engine Layer ───────────────────────────────────────────────────
// Everything with side effects: storage, HTTP, LLM calls, scheduling.
// The Engine struct wires the components together and owns the in-process
// API surface (append, query, get_by_fingerprint, register_rule,
// unregister_rule, close).

pub mod cache;
pub mod channels;
pub mod enrich;
pub mod feed;
pub mod http;
pub mod ingest;
pub mod llm;
pub mod query;
pub mod rules;
pub mod schedule;
pub mod store;
pub mod web;

use crate::atoms::config::AppConfig;
use crate::atoms::constants::LLM_CACHE_DIR;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{Clock, LlmClient};
use crate::atoms::types::{QueryHit, Record, Rule};
use self::cache::CacheDb;
use self::enrich::Enricher;
use self::ingest::{Ingester, RetryPolicy};
use self::llm::OpenAiClient;
use self::query::{QueryPlanner, TextQuery};
use self::rules::RuleEvaluator;
use self::schedule::Scheduler;
use self::store::Store;
use self::web::HttpContext;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::SystemTime;
use tokio_util::sync::CancellationToken;

// ── Clock ──────────────────────────────────────────────────────────────────

/// Wall clock used by the production engine.
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64
    }
}

// ── Engine ─────────────────────────────────────────────────────────────────

pub struct Engine {
    config: AppConfig,
    store: Arc<Store>,
    cache: Arc<CacheDb>,
    enricher: Arc<Enricher>,
    planner: Arc<QueryPlanner>,
    rules: Arc<RuleEvaluator>,
    http: Arc<HttpContext>,
    scheduler: Scheduler,
    cancel: CancellationToken,
    clock: Arc<dyn Clock>,
}

impl Engine {
    pub fn new(config: AppConfig) -> EngineResult<Engine> {
        Engine::with_clock(config, Arc::new(SystemClock))
    }

    /// Construction with an injected clock; tests drive rotation and
    /// retention manually through it.
    pub fn with_clock(config: AppConfig, clock: Arc<dyn Clock>) -> EngineResult<Engine> {
        config.validate()?;

        let store = Arc::new(Store::open(
            &config.engine.data_dir,
            config.llm.embedding_dim,
            config.engine.block_window,
            config.engine.retention,
            clock.clone(),
        )?);
        let cache = Arc::new(CacheDb::open(&config.engine.data_dir.join(LLM_CACHE_DIR))?);
        let llm: Arc<dyn LlmClient> = Arc::new(OpenAiClient::new(&config.llm, clock.clone())?);
        let http = Arc::new(HttpContext::new(config.llm.request_timeout)?);

        let enricher = Arc::new(Enricher::new(
            llm.clone(),
            cache.clone(),
            clock.clone(),
            &config.enrich,
            config.llm.max_inflight,
        ));
        let planner = Arc::new(QueryPlanner::new(store.clone(), llm));
        let channels = channels::build_channels(&config.channels)?;
        let rules = Arc::new(RuleEvaluator::new(
            store.clone(),
            planner.clone(),
            channels,
            clock.clone(),
        ));
        for rule_cfg in &config.rules {
            rules.register(rule_cfg.to_rule()?)?;
        }

        let cancel = CancellationToken::new();
        let scheduler = Scheduler::new(cancel.clone());

        Ok(Engine {
            config,
            store,
            cache,
            enricher,
            planner,
            rules,
            http,
            scheduler,
            cancel,
            clock,
        })
    }

    // ── In-process API ─────────────────────────────────────────────────

    pub fn append(&self, record: &Record) -> EngineResult<()> {
        self.store.append(record)
    }

    pub async fn query(&self, q: &TextQuery) -> EngineResult<Vec<QueryHit>> {
        self.planner.search(q).await
    }

    pub fn get_by_fingerprint(&self, fingerprint: u64) -> EngineResult<Record> {
        self.store.get_by_fingerprint(fingerprint)
    }

    /// Register a rule and start its periodic evaluation.
    pub fn register_rule(&self, rule: Rule) -> EngineResult<()> {
        let period = rule.period;
        let rule_id = rule.id.clone();
        self.rules.register(rule)?;
        self.spawn_rule_job(&rule_id, period);
        Ok(())
    }

    /// Remove a rule; its scheduled job finds nothing and goes quiet.
    pub fn unregister_rule(&self, rule_id: &str) -> EngineResult<()> {
        self.rules.unregister(rule_id)
    }

    pub fn store(&self) -> Arc<Store> {
        self.store.clone()
    }

    // ── Lifecycle ──────────────────────────────────────────────────────

    /// Register every periodic job: one ingest loop per source, one
    /// evaluation loop per configured rule, and the maintenance sweep.
    /// A shared worker gate bounds how many sources poll at once.
    pub fn start(&self) {
        let ingest_gate = Arc::new(tokio::sync::Semaphore::new(
            self.config.engine.max_concurrent_sources.max(1),
        ));
        for source in &self.config.sources {
            let ingester = Arc::new(Ingester::new(
                source.clone(),
                self.http.clone(),
                self.store.clone(),
                self.enricher.clone(),
                self.cache.clone(),
                self.clock.clone(),
                RetryPolicy::from_config(&self.config.enrich),
            ));
            let id = source.id.clone();
            let gate = ingest_gate.clone();
            self.scheduler.register(
                &format!("ingest/{}", source.id),
                source.period,
                source.jitter,
                move |cancel| {
                    let ingester = ingester.clone();
                    let id = id.clone();
                    let gate = gate.clone();
                    async move {
                        let _slot = tokio::select! {
                            _ = cancel.cancelled() => return,
                            permit = gate.acquire_owned() => match permit {
                                Ok(p) => p,
                                Err(_) => return,
                            },
                        };
                        match ingester.run_once(&cancel).await {
                            Ok(()) => {}
                            Err(EngineError::Cancelled) => {}
                            Err(e) => log::warn!("[engine] ingest {} tick failed: {}", id, e),
                        }
                    }
                },
            );
        }

        for rule_cfg in &self.config.rules {
            self.spawn_rule_job(&rule_cfg.id, rule_cfg.period);
        }

        let store = self.store.clone();
        let cache = self.cache.clone();
        let max_entries = self.config.engine.cache_max_entries;
        self.scheduler.register(
            "maintenance",
            self.config.engine.maintenance_period,
            0.1,
            move |_cancel| {
                let store = store.clone();
                let cache = cache.clone();
                async move {
                    match store.gc() {
                        Ok(0) => {}
                        Ok(n) => log::info!("[engine] gc dropped {} block(s)", n),
                        Err(e) => log::warn!("[engine] gc failed: {}", e),
                    }
                    if let Err(e) = cache.evict_lru(max_entries) {
                        log::warn!("[engine] cache eviction failed: {}", e);
                    }
                }
            },
        );

        log::info!(
            "[engine] started: {} source(s), {} rule(s)",
            self.config.sources.len(),
            self.config.rules.len()
        );
    }

    fn spawn_rule_job(&self, rule_id: &str, period: std::time::Duration) {
        let rules = self.rules.clone();
        let id = rule_id.to_string();
        self.scheduler.register(&format!("rule/{}", rule_id), period, 0.05, move |cancel| {
            let rules = rules.clone();
            let id = id.clone();
            async move {
                match rules.evaluate(&id, &cancel).await {
                    Ok(()) => {}
                    Err(EngineError::NotFound) => {
                        log::debug!("[engine] rule {} no longer registered", id)
                    }
                    Err(EngineError::Cancelled) => {}
                    Err(e) => log::warn!("[engine] rule {} tick failed: {}", id, e),
                }
            }
        });
    }

    /// Block until shutdown is requested through the token.
    pub async fn wait(&self) {
        self.cancel.cancelled().await;
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel all jobs, wait for them, then seal and flush the store.
    pub async fn shutdown(&self) -> EngineResult<()> {
        self.scheduler.shutdown().await;
        self.store.close()?;
        let stats = self.rules.stats();
        log::info!(
            "[engine] closed (dispatched {}, deduped {})",
            stats.dispatched.load(Ordering::Relaxed),
            stats.deduped.load(Ordering::Relaxed)
        );
        Ok(())
    }
}
