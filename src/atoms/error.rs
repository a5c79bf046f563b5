// ── Zenfeed Atoms: Error Types ─────────────────────────────────────────────
// Single canonical error enum for the engine, built with `thiserror`.
//
// Design rules:
//   • Variants are the engine's user-visible error kinds; callers match on
//     them to decide policy (skip, retry, requeue, quarantine).
//   • Conversions from std/external errors fold into the nearest kind so
//     `?` works everywhere without boilerplate.
//   • No variant carries secret material (API keys) in its message.

use thiserror::Error;

// ── Primary error enum ─────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum EngineError {
    /// The requested record, block or rule does not exist.
    #[error("not found")]
    NotFound,

    /// A record with the same fingerprint is already stored.
    /// Not an error to ingestion — callers log and count it.
    #[error("duplicate fingerprint")]
    Duplicate,

    /// Append attempted on a sealed block.
    #[error("block is sealed")]
    Sealed,

    /// The operation observed a cancellation request and unwound without
    /// partial writes.
    #[error("cancelled")]
    Cancelled,

    /// A per-call or per-tick deadline elapsed.
    #[error("timeout: {0}")]
    Timeout(String),

    /// An upstream HTTP or LLM endpoint failed.
    #[error("upstream error ({endpoint}): {message}")]
    Upstream { endpoint: String, message: String },

    /// Persisted state is unreadable past the last good checkpoint.
    #[error("corruption: {0}")]
    Corruption(String),

    /// Invalid or missing configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// Invariant violation or unexpected internal failure.
    #[error("internal error: {0}")]
    Internal(String),
}

// ── Convenience constructors ───────────────────────────────────────────────

impl EngineError {
    /// Create an upstream error with endpoint name and message.
    pub fn upstream(endpoint: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Upstream { endpoint: endpoint.into(), message: message.into() }
    }

    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    pub fn corruption(message: impl Into<String>) -> Self {
        Self::Corruption(message.into())
    }

    /// True for `Duplicate` — the one kind ingestion treats as success.
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Self::Duplicate)
    }

    /// Stable lowercase kind name, used for counters and log lines.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound => "not_found",
            Self::Duplicate => "duplicate",
            Self::Sealed => "sealed",
            Self::Cancelled => "cancelled",
            Self::Timeout(_) => "timeout",
            Self::Upstream { .. } => "upstream",
            Self::Corruption(_) => "corruption",
            Self::Config(_) => "config",
            Self::Internal(_) => "internal",
        }
    }
}

// ── Conversions from external error types ──────────────────────────────────

impl From<std::io::Error> for EngineError {
    fn from(e: std::io::Error) -> Self {
        EngineError::Internal(format!("I/O error: {}", e))
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("serialization error: {}", e))
    }
}

impl From<rusqlite::Error> for EngineError {
    fn from(e: rusqlite::Error) -> Self {
        EngineError::Internal(format!("database error: {}", e))
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            EngineError::Timeout(e.to_string())
        } else {
            EngineError::Upstream {
                endpoint: "http".into(),
                message: e.to_string(),
            }
        }
    }
}

// ── Convenience alias ──────────────────────────────────────────────────────

/// All engine operations return this type.
pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(EngineError::Duplicate.kind(), "duplicate");
        assert_eq!(EngineError::Sealed.kind(), "sealed");
        assert_eq!(EngineError::upstream("llm", "boom").kind(), "upstream");
        assert_eq!(EngineError::Timeout("2s".into()).kind(), "timeout");
    }

    #[test]
    fn duplicate_detection() {
        assert!(EngineError::Duplicate.is_duplicate());
        assert!(!EngineError::NotFound.is_duplicate());
    }

    #[test]
    fn io_error_folds_to_internal() {
        let e: EngineError = std::io::Error::other("disk").into();
        assert_eq!(e.kind(), "internal");
    }
}
