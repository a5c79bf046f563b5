// ── Zenfeed Atoms: Configuration ───────────────────────────────────────────
// The deployment configuration tree, deserialized from a TOML file.
// Durations use humantime syntax ("10m", "24h", "8d"). Every section has
// workable defaults except [llm], which names the deployment's models.
//
// Parsing is pure (`AppConfig::from_toml_str`); the binary owns file I/O.

use crate::atoms::constants::{
    EMBEDDING_FIELD, LABEL_CATEGORY, LABEL_SUMMARY, LABEL_TAGS,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::types::{LabelFilter, LabelMatch, Rule};
use serde::Deserialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

// ── Top level ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AppConfig {
    #[serde(default)]
    pub engine: EngineConfig,
    pub llm: LlmConfig,
    #[serde(default)]
    pub enrich: EnrichConfig,
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
    #[serde(default)]
    pub channels: Vec<ChannelConfig>,
}

impl AppConfig {
    pub fn from_toml_str(text: &str) -> EngineResult<Self> {
        let cfg: AppConfig =
            toml::from_str(text).map_err(|e| EngineError::Config(e.to_string()))?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Structural validation beyond what serde can express.
    pub fn validate(&self) -> EngineResult<()> {
        if self.llm.embedding_dim == 0 {
            return Err(EngineError::config("llm.embedding_dim must be > 0"));
        }
        if self.engine.block_window.is_zero() {
            return Err(EngineError::config("engine.block_window must be > 0"));
        }
        if self.engine.retention < self.engine.block_window {
            return Err(EngineError::config(
                "engine.retention must be >= engine.block_window",
            ));
        }

        let mut seen = std::collections::HashSet::new();
        for s in &self.sources {
            if !seen.insert(format!("source/{}", s.id)) {
                return Err(EngineError::Config(format!("duplicate source id: {}", s.id)));
            }
            if !(0.0..1.0).contains(&s.jitter) {
                return Err(EngineError::Config(format!(
                    "source {}: jitter must be in [0, 1)",
                    s.id
                )));
            }
        }
        for c in &self.channels {
            if !seen.insert(format!("channel/{}", c.id)) {
                return Err(EngineError::Config(format!("duplicate channel id: {}", c.id)));
            }
            if c.kind == ChannelKind::Webhook && c.url.is_none() {
                return Err(EngineError::Config(format!(
                    "channel {}: webhook channels need a url",
                    c.id
                )));
            }
        }
        for r in &self.rules {
            if !seen.insert(format!("rule/{}", r.id)) {
                return Err(EngineError::Config(format!("duplicate rule id: {}", r.id)));
            }
            if let Some(t) = r.threshold {
                if !(0.0..=1.0).contains(&t) {
                    return Err(EngineError::Config(format!(
                        "rule {}: threshold must be in [0, 1]",
                        r.id
                    )));
                }
            }
            if !self.channels.iter().any(|c| c.id == r.channel) {
                return Err(EngineError::Config(format!(
                    "rule {}: unknown channel {}",
                    r.id, r.channel
                )));
            }
            for clause in &r.labels {
                clause.to_match().map_err(|e| {
                    EngineError::Config(format!("rule {}: {}", r.id, e))
                })?;
            }
        }
        for f in &self.enrich.fields {
            if f.name == EMBEDDING_FIELD {
                return Err(EngineError::Config(format!(
                    "enrich field name {:?} is reserved",
                    EMBEDDING_FIELD
                )));
            }
        }
        Ok(())
    }
}

// ── [engine] ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EngineConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Width of one block's time window.
    #[serde(with = "humantime_serde", default = "default_block_window")]
    pub block_window: Duration,
    /// How long past its t_end a block stays queryable.
    #[serde(with = "humantime_serde", default = "default_retention")]
    pub retention: Duration,
    /// Upper bound on LLM cache entries; LRU beyond this.
    #[serde(default = "default_cache_max_entries")]
    pub cache_max_entries: u64,
    /// Feed sources polled concurrently; further ticks queue.
    #[serde(default = "default_max_concurrent_sources")]
    pub max_concurrent_sources: usize,
    /// Period of the maintenance job (store GC + cache eviction).
    #[serde(with = "humantime_serde", default = "default_maintenance_period")]
    pub maintenance_period: Duration,
}

fn default_data_dir() -> PathBuf { PathBuf::from("data") }
fn default_block_window() -> Duration { Duration::from_secs(24 * 3600) }
fn default_retention() -> Duration { Duration::from_secs(8 * 24 * 3600) }
fn default_cache_max_entries() -> u64 { 100_000 }
fn default_max_concurrent_sources() -> usize { 4 }
fn default_maintenance_period() -> Duration { Duration::from_secs(3600) }

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            block_window: default_block_window(),
            retention: default_retention(),
            cache_max_entries: default_cache_max_entries(),
            max_concurrent_sources: default_max_concurrent_sources(),
            maintenance_period: default_maintenance_period(),
        }
    }
}

// ── [llm] ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LlmConfig {
    /// Any OpenAI-compatible base URL (OpenAI, OpenRouter, Ollama, vLLM…).
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,
    /// Bearer token; empty for unauthenticated local endpoints.
    #[serde(default)]
    pub api_key: String,
    pub completion_model: String,
    pub embedding_model: String,
    /// Deployment-wide embedding dimension D.
    pub embedding_dim: usize,
    /// Global cap on concurrent LLM calls.
    #[serde(default = "default_max_inflight")]
    pub max_inflight: usize,
    /// Per-call deadline.
    #[serde(with = "humantime_serde", default = "default_llm_timeout")]
    pub request_timeout: Duration,
}

fn default_llm_base_url() -> String { "http://localhost:11434/v1".into() }
fn default_max_inflight() -> usize { 4 }
fn default_llm_timeout() -> Duration { Duration::from_secs(120) }

// ── [enrich] ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EnrichConfig {
    /// Declared completion fields; each becomes a label on the record.
    #[serde(default = "default_fields")]
    pub fields: Vec<FieldSpec>,
    /// Retry budget for items whose embedding call failed.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(with = "humantime_serde", default = "default_backoff_base")]
    pub backoff_base: Duration,
    #[serde(default = "default_backoff_factor")]
    pub backoff_factor: f64,
    #[serde(with = "humantime_serde", default = "default_backoff_cap")]
    pub backoff_cap: Duration,
}

fn default_max_attempts() -> u32 { 3 }
fn default_backoff_base() -> Duration { Duration::from_secs(2) }
fn default_backoff_factor() -> f64 { 2.0 }
fn default_backoff_cap() -> Duration { Duration::from_secs(300) }

impl Default for EnrichConfig {
    fn default() -> Self {
        Self {
            fields: default_fields(),
            max_attempts: default_max_attempts(),
            backoff_base: default_backoff_base(),
            backoff_factor: default_backoff_factor(),
            backoff_cap: default_backoff_cap(),
        }
    }
}

/// One LLM-derived field. The prompt is a template over {title} and
/// {content}; bumping `version` invalidates the field's cache entries.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FieldSpec {
    pub name: String,
    pub prompt: String,
    #[serde(default = "default_field_version")]
    pub version: String,
    /// Critical fields fail the item; others degrade to empty.
    #[serde(default)]
    pub critical: bool,
}

fn default_field_version() -> String { "v1".into() }

fn default_fields() -> Vec<FieldSpec> {
    vec![
        FieldSpec {
            name: LABEL_SUMMARY.into(),
            prompt: "Summarize the following article in two sentences.\n\nTitle: {title}\n\n{content}".into(),
            version: default_field_version(),
            critical: false,
        },
        FieldSpec {
            name: LABEL_CATEGORY.into(),
            prompt: "Name the single best category (one word, lowercase) for this article.\n\nTitle: {title}\n\n{content}".into(),
            version: default_field_version(),
            critical: false,
        },
        FieldSpec {
            name: LABEL_TAGS.into(),
            prompt: "List up to five comma-separated lowercase tags for this article.\n\nTitle: {title}\n\n{content}".into(),
            version: default_field_version(),
            critical: false,
        },
        FieldSpec {
            name: "score".into(),
            prompt: "Rate how substantial this article is from 0.0 to 1.0. Reply with the number only.\n\nTitle: {title}\n\n{content}".into(),
            version: default_field_version(),
            critical: false,
        },
    ]
}

// ── [[sources]] ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceConfig {
    pub id: String,
    /// Feed URL (RSS 2.0 or Atom).
    pub url: String,
    #[serde(with = "humantime_serde", default = "default_source_period")]
    pub period: Duration,
    /// Fraction of the period used as random tick jitter, in [0, 1).
    #[serde(default = "default_jitter")]
    pub jitter: f64,
    /// Crawl each article URL for full content.
    #[serde(default)]
    pub crawl: bool,
    /// Extra labels stamped on every record from this source.
    #[serde(default)]
    pub labels_extra: BTreeMap<String, String>,
}

fn default_source_period() -> Duration { Duration::from_secs(600) }
fn default_jitter() -> f64 { 0.1 }

// ── [[rules]] ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RuleConfig {
    pub id: String,
    #[serde(default = "default_field_version")]
    pub version: String,
    /// Optional semantic query; embedded once per (id, version).
    #[serde(default)]
    pub query_text: Option<String>,
    #[serde(default)]
    pub labels: Vec<LabelClause>,
    #[serde(default = "default_rule_k")]
    pub k: usize,
    #[serde(default)]
    pub threshold: Option<f32>,
    #[serde(with = "humantime_serde", default = "default_lookback")]
    pub lookback: Duration,
    #[serde(with = "humantime_serde", default = "default_rule_period")]
    pub period: Duration,
    pub channel: String,
    #[serde(with = "humantime_serde", default = "default_dedup_window")]
    pub dedup_window: Duration,
    #[serde(default = "default_message_template")]
    pub message: String,
}

fn default_rule_k() -> usize { 10 }
fn default_lookback() -> Duration { Duration::from_secs(24 * 3600) }
fn default_rule_period() -> Duration { Duration::from_secs(300) }
fn default_dedup_window() -> Duration { Duration::from_secs(24 * 3600) }
fn default_message_template() -> String { "{title}\n{link}\n\n{summary}".into() }

impl RuleConfig {
    pub fn to_rule(&self) -> EngineResult<Rule> {
        let mut filter = LabelFilter::default();
        for clause in &self.labels {
            filter.clauses.push((clause.name.clone(), clause.to_match()?));
        }
        Ok(Rule {
            id: self.id.clone(),
            version: self.version.clone(),
            query_text: self.query_text.clone(),
            filter,
            k: self.k,
            threshold: self.threshold,
            lookback: self.lookback,
            period: self.period,
            channel: self.channel.clone(),
            dedup_window: self.dedup_window,
            message_template: self.message.clone(),
        })
    }
}

/// One label constraint in config form:
///   { name = "source", op = "eq", value = "hn" }
///   { name = "category", op = "in", values = ["tech", "sci"] }
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LabelClause {
    pub name: String,
    #[serde(default = "default_op")]
    pub op: String,
    #[serde(default)]
    pub value: Option<String>,
    #[serde(default)]
    pub values: Option<Vec<String>>,
}

fn default_op() -> String { "eq".into() }

impl LabelClause {
    pub fn to_match(&self) -> EngineResult<LabelMatch> {
        let need_value = || {
            self.value.clone().ok_or_else(|| {
                EngineError::Config(format!("label clause {}: missing value", self.name))
            })
        };
        match self.op.as_str() {
            "eq" => Ok(LabelMatch::Eq { value: need_value()? }),
            "not-eq" => Ok(LabelMatch::NotEq { value: need_value()? }),
            "prefix" => Ok(LabelMatch::Prefix { value: need_value()? }),
            "in" => {
                let values = self.values.clone().ok_or_else(|| {
                    EngineError::Config(format!("label clause {}: missing values", self.name))
                })?;
                Ok(LabelMatch::In { values })
            }
            other => Err(EngineError::Config(format!(
                "label clause {}: unknown op {:?}",
                self.name, other
            ))),
        }
    }
}

// ── [[channels]] ───────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ChannelConfig {
    pub id: String,
    #[serde(default)]
    pub kind: ChannelKind,
    /// Webhook endpoint; required for kind = "webhook".
    #[serde(default)]
    pub url: Option<String>,
    /// Optional bearer token sent with webhook posts.
    #[serde(default)]
    pub auth_token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelKind {
    Webhook,
    /// Logs the rendered message; for dry-run deployments.
    #[default]
    Log,
}
