// ── Zenfeed Engine: Notification Channels ──────────────────────────────────
// Delivery sinks for rule matches. Two concrete channels:
//   webhook — JSON POST with optional bearer auth
//   log     — writes the rendered message to the log (dry-run deployments)
//
// Channels never error; every failure maps onto SendOutcome so the rule
// evaluator's retry/dedup policy stays in one place.

use crate::atoms::config::{ChannelConfig, ChannelKind};
use crate::atoms::constants::USER_AGENT;
use crate::atoms::error::EngineResult;
use crate::atoms::traits::NotificationChannel;
use crate::atoms::types::{Record, SendOutcome};
use crate::engine::http::is_retryable_status;
use async_trait::async_trait;
use log::{info, warn};
use reqwest::Client;
use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

// ── Message rendering ──────────────────────────────────────────────────────

/// Fill a rule's message template from a record's labels and score.
/// Unknown placeholders are left verbatim.
pub fn render_message(template: &str, record: &Record) -> String {
    let mut out = template.to_string();
    for key in ["title", "link", "summary", "source", "category", "content", "tags"] {
        let placeholder = format!("{{{}}}", key);
        if out.contains(&placeholder) {
            out = out.replace(&placeholder, record.label(key).unwrap_or(""));
        }
    }
    out.replace("{score}", &format!("{:.2}", record.score))
}

// ── Construction from config ───────────────────────────────────────────────

pub fn build_channels(
    configs: &[ChannelConfig],
) -> EngineResult<HashMap<String, Arc<dyn NotificationChannel>>> {
    let mut channels: HashMap<String, Arc<dyn NotificationChannel>> = HashMap::new();
    for cfg in configs {
        let channel: Arc<dyn NotificationChannel> = match cfg.kind {
            ChannelKind::Webhook => Arc::new(WebhookChannel::new(cfg)?),
            ChannelKind::Log => Arc::new(LogChannel { name: cfg.id.clone() }),
        };
        channels.insert(cfg.id.clone(), channel);
    }
    Ok(channels)
}

// ── Webhook ────────────────────────────────────────────────────────────────

pub struct WebhookChannel {
    name: String,
    client: Client,
    url: String,
    auth_token: Option<String>,
}

impl WebhookChannel {
    pub fn new(cfg: &ChannelConfig) -> EngineResult<WebhookChannel> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(30))
            .build()?;
        Ok(WebhookChannel {
            name: cfg.id.clone(),
            client,
            url: cfg.url.clone().unwrap_or_default(),
            auth_token: cfg.auth_token.clone(),
        })
    }
}

#[async_trait]
impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, rule_id: &str, record: &Record, message: &str) -> SendOutcome {
        let body = json!({
            "rule_id": rule_id,
            "fingerprint": format!("{:016x}", record.fingerprint),
            "title": record.label("title").unwrap_or(""),
            "link": record.label("link").unwrap_or(""),
            "source": record.label("source").unwrap_or(""),
            "score": record.score,
            "message": message,
        });

        let mut req = self.client.post(&self.url).json(&body);
        if let Some(token) = &self.auth_token {
            req = req.header("Authorization", format!("Bearer {}", token));
        }

        match req.send().await {
            Ok(response) => {
                let status = response.status().as_u16();
                let outcome = outcome_for_status(status);
                if outcome != SendOutcome::Ok {
                    warn!("[channel] {} returned HTTP {} for rule {}", self.name, status, rule_id);
                }
                outcome
            }
            Err(e) => {
                warn!("[channel] {} unreachable for rule {}: {}", self.name, rule_id, e);
                SendOutcome::Retryable
            }
        }
    }
}

/// 2xx delivered; retryable statuses and network errors retry on the next
/// tick; any other 4xx is a permanent rejection of this payload.
pub fn outcome_for_status(status: u16) -> SendOutcome {
    if (200..300).contains(&status) {
        SendOutcome::Ok
    } else if is_retryable_status(status) {
        SendOutcome::Retryable
    } else {
        SendOutcome::Permanent
    }
}

// ── Log sink ───────────────────────────────────────────────────────────────

pub struct LogChannel {
    pub name: String,
}

#[async_trait]
impl NotificationChannel for LogChannel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, rule_id: &str, _record: &Record, message: &str) -> SendOutcome {
        info!("[channel] {} rule={}: {}", self.name, rule_id, message);
        SendOutcome::Ok
    }
}
