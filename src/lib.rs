// ── Zenfeed ────────────────────────────────────────────────────────────────
// Self-hosted feed intelligence engine: RSS/Atom ingestion, LLM enrichment
// with per-field caching, a time-partitioned hybrid vector + label store,
// and periodic rules dispatching notifications.
//
// Layering:
//   atoms/  — pure constants, error types, domain types, capability traits
//   engine/ — storage, pipeline, scheduling; everything with side effects

pub mod atoms;
pub mod engine;

pub use atoms::config::AppConfig;
pub use atoms::error::{EngineError, EngineResult};
pub use engine::Engine;
