// ── Zenfeed Engine: Query Planner ──────────────────────────────────────────
// Translates user-facing queries (optional natural-language text) into
// store queries. Query text is embedded at most once per (text, embedding
// model) — rule vectors and repeated user searches hit the in-memory
// cache.

use crate::atoms::error::EngineResult;
use crate::atoms::fingerprint::text_key;
use crate::atoms::traits::LlmClient;
use crate::atoms::types::{LabelFilter, Query, QueryHit, TimeRange};
use crate::engine::enrich::l2_normalize;
use crate::engine::store::Store;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

/// Drop the embedding cache wholesale past this size; entries are tiny and
/// the population (rule texts + interactive queries) is small in practice.
const TEXT_CACHE_MAX: usize = 4096;

/// A user-facing query before planning.
#[derive(Debug, Clone)]
pub struct TextQuery {
    pub time_range: TimeRange,
    pub filter: LabelFilter,
    pub text: Option<String>,
    pub k: usize,
    pub threshold: Option<f32>,
}

pub struct QueryPlanner {
    store: Arc<Store>,
    llm: Arc<dyn LlmClient>,
    text_cache: Mutex<HashMap<u64, Vec<f32>>>,
}

impl QueryPlanner {
    pub fn new(store: Arc<Store>, llm: Arc<dyn LlmClient>) -> QueryPlanner {
        QueryPlanner { store, llm, text_cache: Mutex::new(HashMap::new()) }
    }

    /// Plan and run: embed the text if present, query the store, return
    /// hits already threshold-filtered and ranked by the store.
    pub async fn search(&self, q: &TextQuery) -> EngineResult<Vec<QueryHit>> {
        let vector = match q.text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => Some(self.embed_text(text).await?),
            _ => None,
        };
        self.store.query(&Query {
            time_range: q.time_range,
            filter: q.filter.clone(),
            vector,
            k: q.k,
            threshold: q.threshold,
        })
    }

    /// Embed a query text, normalized, memoized by (text, model).
    pub async fn embed_text(&self, text: &str) -> EngineResult<Vec<f32>> {
        let key = text_key(text, self.llm.embedding_model());
        if let Some(v) = self.text_cache.lock().get(&key) {
            return Ok(v.clone());
        }

        let mut vector = self.llm.embed(text).await?;
        l2_normalize(&mut vector);

        let mut cache = self.text_cache.lock();
        if cache.len() >= TEXT_CACHE_MAX {
            cache.clear();
        }
        cache.insert(key, vector.clone());
        Ok(vector)
    }
}
