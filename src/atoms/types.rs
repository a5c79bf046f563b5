// ── Zenfeed Atoms: Domain Types ────────────────────────────────────────────
// Pure data types for the ingestion pipeline and the feed store.
// Follows the project pattern: structs in atoms/, impls with I/O in engine/.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Label set of a record: short name → short value, sorted by name.
/// An empty value means "absent" and is never indexed.
pub type Labels = BTreeMap<String, String>;

// ── Feed item (pre-enrichment) ─────────────────────────────────────────────

/// A candidate item as produced by the feed parser, before enrichment.
#[derive(Debug, Clone)]
pub struct FeedItem {
    /// Stable identifier of the feed source (from config).
    pub source_id: String,
    /// Canonical URL after normalization.
    pub link: String,
    pub title: String,
    pub published_at: DateTime<Utc>,
    /// Raw HTML or text from the feed entry body.
    pub raw: String,
    /// Markdown produced by crawling the article URL, when crawling ran.
    pub content_markdown: Option<String>,
}

impl FeedItem {
    pub fn fingerprint(&self) -> u64 {
        crate::atoms::fingerprint::item_fingerprint(&self.source_id, &self.link, &self.title)
    }
}

// ── Enriched record (stored) ───────────────────────────────────────────────

/// A fully enriched record as appended to and returned by the store.
/// The block-local id is assigned on append and not part of this struct.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub fingerprint: u64,
    /// Ingestion timestamp; authoritative for time partitioning.
    pub time_ms: u64,
    pub published_ms: u64,
    pub labels: Labels,
    /// Dense embedding, exactly the deployment dimension, L2-normalized.
    pub vector: Vec<f32>,
    /// LLM relevance score in [0, 1].
    pub score: f32,
}

impl Record {
    /// Label lookup treating empty values as absent.
    pub fn label(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str).filter(|v| !v.is_empty())
    }
}

// ── Label filters ──────────────────────────────────────────────────────────

/// A single matcher against one label name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "op")]
pub enum LabelMatch {
    /// Value equals exactly.
    Eq { value: String },
    /// Value is one of the alternatives.
    In { values: Vec<String> },
    /// Value differs (an absent label passes).
    NotEq { value: String },
    /// Value starts with the prefix.
    Prefix { value: String },
}

impl LabelMatch {
    /// Whether a concrete value (empty = absent) satisfies this matcher.
    pub fn matches(&self, value: Option<&str>) -> bool {
        match self {
            LabelMatch::Eq { value: want } => value == Some(want.as_str()),
            LabelMatch::In { values } => {
                value.is_some_and(|v| values.iter().any(|w| w == v))
            }
            LabelMatch::NotEq { value: want } => value != Some(want.as_str()),
            LabelMatch::Prefix { value: prefix } => {
                value.is_some_and(|v| v.starts_with(prefix.as_str()))
            }
        }
    }

    /// True for matchers that can drive an inverted-index lookup.
    /// `NotEq` can only post-filter a candidate set.
    pub fn is_positive(&self) -> bool {
        !matches!(self, LabelMatch::NotEq { .. })
    }
}

/// Conjunction of label matchers; an empty filter matches everything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelFilter {
    pub clauses: Vec<(String, LabelMatch)>,
}

impl LabelFilter {
    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, labels: &Labels) -> bool {
        self.clauses.iter().all(|(name, m)| {
            let value = labels.get(name).map(String::as_str).filter(|v| !v.is_empty());
            m.matches(value)
        })
    }

    /// Builder-style helper used by callers and tests.
    pub fn with(mut self, name: impl Into<String>, m: LabelMatch) -> Self {
        self.clauses.push((name.into(), m));
        self
    }
}

// ── Time ranges ────────────────────────────────────────────────────────────

/// Half-open interval of epoch milliseconds: [start_ms, end_ms).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    pub start_ms: u64,
    pub end_ms: u64,
}

impl TimeRange {
    pub fn new(start_ms: u64, end_ms: u64) -> Self {
        Self { start_ms, end_ms }
    }

    pub fn contains(&self, t_ms: u64) -> bool {
        t_ms >= self.start_ms && t_ms < self.end_ms
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start_ms < other.end_ms && other.start_ms < self.end_ms
    }
}

// ── Queries ────────────────────────────────────────────────────────────────

/// A store query: time window, label constraints, optional vector search.
#[derive(Debug, Clone)]
pub struct Query {
    pub time_range: TimeRange,
    pub filter: LabelFilter,
    /// When present, results are ranked by dot-product similarity.
    pub vector: Option<Vec<f32>>,
    pub k: usize,
    /// Minimum similarity; only applied when `vector` is present.
    pub threshold: Option<f32>,
}

/// One query result. `similarity` is None for pure label scans.
#[derive(Debug, Clone)]
pub struct QueryHit {
    pub record: Record,
    pub similarity: Option<f32>,
}

// ── Rules ──────────────────────────────────────────────────────────────────

/// A stored query evaluated periodically, dispatching hits to a channel.
#[derive(Debug, Clone)]
pub struct Rule {
    pub id: String,
    /// Bumping the version re-embeds `query_text` and resets dispatch dedup.
    pub version: String,
    /// Natural-language query, embedded once per (id, version).
    pub query_text: Option<String>,
    pub filter: LabelFilter,
    pub k: usize,
    pub threshold: Option<f32>,
    /// Query window relative to now: [now - lookback, now).
    pub lookback: Duration,
    pub period: Duration,
    /// Channel id from configuration.
    pub channel: String,
    /// Window within which a (rule, item) pair is dispatched at most once.
    pub dedup_window: Duration,
    /// Message template with {title}, {link}, {summary}, {source}, {score}.
    pub message_template: String,
}

// ── Notification outcome ───────────────────────────────────────────────────

/// Result of a channel send, as acked by the sink.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// Delivered; record the dispatch key.
    Ok,
    /// Transient failure; do not record, retry on the next tick.
    Retryable,
    /// Rejected for good; record the key so the rule stops retrying.
    Permanent,
}
