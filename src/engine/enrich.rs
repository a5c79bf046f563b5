// ── Zenfeed Engine: Enricher ───────────────────────────────────────────────
// Turns a raw feed item into a stored record: one completion per declared
// field (summary, category, tags, score, …) plus the embedding, all cached
// by (fingerprint, field, prompt version) so re-ingestion after a restart
// never re-pays an LLM call.
//
// Concurrency: fields of one item run in parallel; a global semaphore caps
// in-flight LLM calls across all items. Failure policy: a non-critical
// field degrades to empty, a failed embedding fails the whole item.

use crate::atoms::config::{EnrichConfig, FieldSpec};
use crate::atoms::constants::{
    EMBEDDING_FIELD, LABEL_CONTENT, LABEL_LINK, LABEL_SOURCE, LABEL_TITLE,
};
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{Clock, LlmClient};
use crate::atoms::types::{FeedItem, Labels, Record};
use crate::engine::cache::CacheDb;
use futures::future::join_all;
use log::warn;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub struct Enricher {
    llm: Arc<dyn LlmClient>,
    cache: Arc<CacheDb>,
    clock: Arc<dyn Clock>,
    semaphore: Arc<Semaphore>,
    fields: Vec<FieldSpec>,
}

impl Enricher {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        cache: Arc<CacheDb>,
        clock: Arc<dyn Clock>,
        config: &EnrichConfig,
        max_inflight: usize,
    ) -> Enricher {
        Enricher {
            llm,
            cache,
            clock,
            semaphore: Arc::new(Semaphore::new(max_inflight.max(1))),
            fields: config.fields.clone(),
        }
    }

    /// Enrich one item into an appendable record.
    ///
    /// Returns `Cancelled` as soon as the token fires; the embedding error
    /// of the item propagates, per-field errors degrade.
    pub async fn enrich(
        &self,
        item: &FeedItem,
        extra_labels: &BTreeMap<String, String>,
        cancel: &CancellationToken,
    ) -> EngineResult<Record> {
        let fingerprint = item.fingerprint();
        let body = item.content_markdown.as_deref().unwrap_or(&item.raw);

        let field_futures = self.fields.iter().map(|spec| {
            let prompt = render_prompt(&spec.prompt, &item.title, body);
            async move { (spec, self.cached_complete(fingerprint, spec, &prompt, cancel).await) }
        });
        let embed_text = format!("{}\n\n{}", item.title, body);
        let (field_results, embedding) = tokio::join!(
            join_all(field_futures),
            self.cached_embed(fingerprint, &embed_text, cancel),
        );

        let mut vector = embedding?;
        l2_normalize(&mut vector);

        let mut labels: Labels = Labels::new();
        labels.insert(LABEL_SOURCE.into(), item.source_id.clone());
        labels.insert(LABEL_TITLE.into(), item.title.clone());
        labels.insert(LABEL_LINK.into(), item.link.clone());
        labels.insert(
            LABEL_CONTENT.into(),
            item.content_markdown.clone().unwrap_or_default(),
        );
        for (name, value) in extra_labels {
            labels.insert(name.clone(), value.clone());
        }

        let mut score = 0.0f32;
        for (spec, result) in field_results {
            match result {
                Ok(output) => {
                    if spec.name == "score" {
                        score = parse_score(&output).unwrap_or(0.0);
                    } else {
                        labels.insert(spec.name.clone(), output);
                    }
                }
                Err(EngineError::Cancelled) => return Err(EngineError::Cancelled),
                Err(e) if spec.critical => return Err(e),
                Err(e) => {
                    // Degrade: the field stays absent.
                    warn!("[enrich] field {} failed for {:#x}: {}", spec.name, fingerprint, e);
                }
            }
        }

        Ok(Record {
            fingerprint,
            time_ms: self.clock.now_ms(),
            published_ms: item.published_at.timestamp_millis().max(0) as u64,
            labels,
            vector,
            score,
        })
    }

    /// One completion field, cache-first, semaphore-bounded.
    async fn cached_complete(
        &self,
        fingerprint: u64,
        spec: &FieldSpec,
        prompt: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<String> {
        let now_ms = self.clock.now_ms();
        if let Some(bytes) = self.cache.get(fingerprint, &spec.name, &spec.version, now_ms)? {
            return Ok(String::from_utf8_lossy(&bytes).into_owned());
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::internal("llm semaphore closed"))?
            }
        };
        let output = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.llm.complete(prompt) => result?,
        };

        self.cache
            .put(fingerprint, &spec.name, &spec.version, output.as_bytes(), now_ms)?;
        Ok(output)
    }

    /// The embedding, cached under the reserved field name with the model
    /// id as version (switching models re-embeds everything).
    async fn cached_embed(
        &self,
        fingerprint: u64,
        text: &str,
        cancel: &CancellationToken,
    ) -> EngineResult<Vec<f32>> {
        let now_ms = self.clock.now_ms();
        let version = self.llm.embedding_model().to_string();
        if let Some(bytes) = self.cache.get(fingerprint, EMBEDDING_FIELD, &version, now_ms)? {
            return Ok(f32_vec_from_bytes(&bytes));
        }

        let _permit = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = self.semaphore.clone().acquire_owned() => {
                permit.map_err(|_| EngineError::internal("llm semaphore closed"))?
            }
        };
        let vector = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            result = self.llm.embed(text) => result?,
        };

        self.cache.put(
            fingerprint,
            EMBEDDING_FIELD,
            &version,
            &f32_vec_to_bytes(&vector),
            now_ms,
        )?;
        Ok(vector)
    }
}

// ── Helpers ────────────────────────────────────────────────────────────────

/// Substitute {title} and {content} into a field prompt template.
fn render_prompt(template: &str, title: &str, content: &str) -> String {
    template.replace("{title}", title).replace("{content}", content)
}

/// Scale to unit L2 norm. The zero vector stays zero — it is indexable and
/// scores zero similarity against everything.
pub fn l2_normalize(vector: &mut [f32]) {
    let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
    if norm > 1e-8 {
        for x in vector.iter_mut() {
            *x /= norm;
        }
    }
}

/// Pull the first float token out of a scorer reply like "0.8" or
/// "Score: 0.75/1.0". Clamped to [0, 1].
fn parse_score(text: &str) -> Option<f32> {
    for token in text.split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-')) {
        let token = token.trim_matches('.');
        if token.is_empty() {
            continue;
        }
        if let Ok(v) = token.parse::<f32>() {
            return Some(v.clamp(0.0, 1.0));
        }
    }
    None
}

pub fn f32_vec_to_bytes(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|f| f.to_le_bytes()).collect()
}

pub fn f32_vec_from_bytes(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}
