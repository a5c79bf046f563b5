// ── Zenfeed Atoms: Capability Traits ───────────────────────────────────────
// The seams between the engine and its external collaborators.
// Implementations live in engine/ (or in test code); the engine core only
// ever sees these traits.

use crate::atoms::error::EngineResult;
use crate::atoms::types::{Record, SendOutcome};
use async_trait::async_trait;

// ── LLM client ─────────────────────────────────────────────────────────────

/// An OpenAI-compatible model endpoint: one embedding model and one
/// completion model, both fixed at construction.
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Embed a text into a dense vector of `embedding_dim()` components.
    /// The returned vector is NOT normalized; the enricher normalizes.
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>>;

    /// Run a single-turn completion and return the text of the reply.
    async fn complete(&self, prompt: &str) -> EngineResult<String>;

    /// Identifier of the embedding model; part of every embedding cache key.
    fn embedding_model(&self) -> &str;

    /// Deployment-wide embedding dimension D.
    fn embedding_dim(&self) -> usize;
}

// ── Notification channels ──────────────────────────────────────────────────

/// A delivery sink for rule matches (webhook, log, …).
#[async_trait]
pub trait NotificationChannel: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one rendered message for one record.
    /// Must not panic; maps all failures onto the outcome enum.
    async fn send(&self, rule_id: &str, record: &Record, message: &str) -> SendOutcome;
}

// ── Clock ──────────────────────────────────────────────────────────────────

/// Injectable wall clock. The store (rotation, retention) and the rule
/// evaluator (relative time ranges) read time only through this trait so
/// tests can drive them with a manual clock.
pub trait Clock: Send + Sync {
    fn now_ms(&self) -> u64;
}
