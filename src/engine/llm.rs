// ── Zenfeed Engine: OpenAI-Compatible LLM Client ───────────────────────────
// Implements the LlmClient capability against any OpenAI-compatible REST
// API: OpenAI, OpenRouter, Ollama (/v1), vLLM, Azure-style gateways.
//
// Two endpoints are used, both non-streaming:
//   POST {base}/embeddings        — one input, one vector back
//   POST {base}/chat/completions  — single user message, text reply

use crate::atoms::config::LlmConfig;
use crate::atoms::error::{EngineError, EngineResult};
use crate::atoms::traits::{Clock, LlmClient};
use crate::engine::http::{
    is_retryable_status, parse_retry_after, Backoff, CircuitBreaker, MAX_RETRIES,
};
use async_trait::async_trait;
use log::{error, info, warn};
use reqwest::Client;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;

/// Consecutive failures before the client fails fast.
const CIRCUIT_THRESHOLD: u32 = 5;
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(60);

pub struct OpenAiClient {
    client: Client,
    base_url: String,
    api_key: String,
    completion_model: String,
    embedding_model: String,
    embedding_dim: usize,
    backoff: Backoff,
    /// One breaker for both endpoints — one upstream, one state.
    circuit: CircuitBreaker,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig, clock: Arc<dyn Clock>) -> EngineResult<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(config.request_timeout)
            .build()?;
        Ok(OpenAiClient {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
            completion_model: config.completion_model.clone(),
            embedding_model: config.embedding_model.clone(),
            embedding_dim: config.embedding_dim,
            backoff: Backoff::new(clock.clone()),
            circuit: CircuitBreaker::new(CIRCUIT_THRESHOLD, CIRCUIT_COOLDOWN, clock),
        })
    }

    /// POST one JSON body with retries; returns the parsed response body.
    async fn post_json(&self, path: &str, body: &Value) -> EngineResult<Value> {
        let url = format!("{}{}", self.base_url, path);

        if let Err(msg) = self.circuit.check() {
            return Err(EngineError::upstream("llm", msg));
        }

        let mut last_error = String::new();
        let mut retry_after: Option<u64> = None;

        for attempt in 0..=MAX_RETRIES {
            if attempt > 0 {
                let delay = self.backoff.wait(attempt - 1, retry_after.take()).await;
                warn!(
                    "[llm] retry {}/{} for {} after {}ms",
                    attempt,
                    MAX_RETRIES,
                    path,
                    delay.as_millis()
                );
            }

            let mut req = self.client.post(&url).json(body);
            if !self.api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    self.circuit.record_failure();
                    if e.is_timeout() {
                        return Err(EngineError::Timeout(format!("llm {}: {}", path, e)));
                    }
                    last_error = format!("request failed: {}", e);
                    continue;
                }
            };

            let status = response.status().as_u16();
            if !response.status().is_success() {
                retry_after = response
                    .headers()
                    .get("retry-after")
                    .and_then(|v| v.to_str().ok())
                    .and_then(parse_retry_after);
                let body_text = response.text().await.unwrap_or_default();
                last_error = format!("API error {}: {}", status, truncate(&body_text, 200));
                error!("[llm] {} returned {}: {}", path, status, truncate(&body_text, 500));

                self.circuit.record_failure();

                // Auth errors are never retried.
                if status == 401 || status == 403 {
                    return Err(EngineError::upstream("llm", last_error));
                }
                if is_retryable_status(status) && attempt < MAX_RETRIES {
                    continue;
                }
                return Err(EngineError::upstream("llm", last_error));
            }

            let parsed: Value = response.json().await.map_err(|e| {
                self.circuit.record_failure();
                EngineError::upstream("llm", format!("invalid JSON response: {}", e))
            })?;
            self.circuit.record_success();
            return Ok(parsed);
        }

        Err(EngineError::upstream("llm", last_error))
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn embed(&self, text: &str) -> EngineResult<Vec<f32>> {
        let body = json!({
            "model": self.embedding_model,
            "input": text,
        });
        let response = self.post_json("/embeddings", &body).await?;

        let raw = response["data"][0]["embedding"]
            .as_array()
            .ok_or_else(|| EngineError::upstream("llm", "embedding missing from response"))?;
        let vector: Vec<f32> = raw
            .iter()
            .map(|v| v.as_f64().unwrap_or(0.0) as f32)
            .collect();

        if vector.len() != self.embedding_dim {
            return Err(EngineError::Config(format!(
                "model {} returned {} dimensions, configuration says {}",
                self.embedding_model,
                vector.len(),
                self.embedding_dim
            )));
        }
        Ok(vector)
    }

    async fn complete(&self, prompt: &str) -> EngineResult<String> {
        let body = json!({
            "model": self.completion_model,
            "messages": [{"role": "user", "content": prompt}],
            "stream": false,
        });
        info!("[llm] completion request model={}", self.completion_model);
        let response = self.post_json("/chat/completions", &body).await?;

        response["choices"][0]["message"]["content"]
            .as_str()
            .map(|s| s.trim().to_string())
            .ok_or_else(|| EngineError::upstream("llm", "completion missing from response"))
    }

    fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    fn embedding_dim(&self) -> usize {
        self.embedding_dim
    }
}

/// Truncate a response body for log lines, respecting char boundaries.
fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("hello", 10), "hello");
        assert_eq!(truncate("hello", 3), "hel");
        // Multi-byte char straddling the cut.
        let s = "ab\u{00e9}cd";
        assert_eq!(truncate(s, 3), "ab");
    }
}
