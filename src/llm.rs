//! LLM routing: provider selection, fallback chain, cost ledger, and
//! budget enforcement.
//!
//! Providers form an ordered chain (primary, fallback, emergency). A call
//! tries each provider in order — the requested model's provider first when
//! one is named — retrying transient failures with exponential backoff, and
//! stops at the first success. Every successful call is recorded in the
//! in-process cost ledger (and appended to the JSONL snapshot when
//! configured); once the daily budget is spent the router refuses further
//! calls with `budget_exceeded` so callers can degrade gracefully.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, warn};

use crate::config::{LlmConfig, ProviderConfig};
use crate::error::{Result, SiftError};

/// Transient-retry schedule: base 0.5s, factor 2, cap 30s.
const RETRY_BASE_MS: u64 = 500;
const RETRY_CAP_MS: u64 = 30_000;
const RETRY_MAX_ATTEMPTS: u32 = 4;

fn backoff_delay(attempt: u32) -> Duration {
    let ms = RETRY_BASE_MS.saturating_mul(1u64 << attempt.min(16));
    Duration::from_millis(ms.min(RETRY_CAP_MS))
}

/// Raw completion from a provider transport.
#[derive(Debug, Clone)]
pub struct ChatCompletion {
    pub text: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// Transport seam for one provider. Production uses the OpenAI-compatible
/// HTTP client; tests inject scripted implementations.
#[async_trait]
pub trait ChatClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ChatCompletion>;
}

/// OpenAI-compatible chat completions over HTTP.
pub struct HttpChatClient {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
}

impl HttpChatClient {
    pub fn new(endpoint: &str, api_key: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

#[async_trait]
impl ChatClient for HttpChatClient {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> anyhow::Result<ChatCompletion> {
        let body = serde_json::json!({
            "model": model,
            "messages": [{"role": "user", "content": prompt}],
            "temperature": temperature,
            "max_tokens": max_tokens,
        });

        let mut request = self
            .client
            .post(format!("{}/chat/completions", self.endpoint))
            .header("Content-Type", "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }

        let response = request.json(&body).send().await?;
        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            anyhow::bail!("provider error {status}: {text}");
        }

        let json: serde_json::Value = response.json().await?;
        let text = json
            .get("choices")
            .and_then(|c| c.get(0))
            .and_then(|c| c.get("message"))
            .and_then(|m| m.get("content"))
            .and_then(|c| c.as_str())
            .ok_or_else(|| anyhow::anyhow!("malformed completion response"))?
            .to_string();

        // Measured usage when reported; a chars/4 estimate otherwise.
        let usage = json.get("usage");
        let input_tokens = usage
            .and_then(|u| u.get("prompt_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| (prompt.len() / 4) as u64);
        let output_tokens = usage
            .and_then(|u| u.get("completion_tokens"))
            .and_then(|v| v.as_u64())
            .unwrap_or_else(|| (text.len() / 4) as u64);

        Ok(ChatCompletion {
            text,
            input_tokens,
            output_tokens,
        })
    }
}

// ============ Cost ledger ============

/// One ledger record, also the JSONL snapshot line shape.
#[derive(Debug, Clone, Serialize)]
pub struct CostRecord {
    pub provider: String,
    pub model: String,
    pub operation: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct LedgerInner {
    day: Option<NaiveDate>,
    daily_total: f64,
    per_provider: HashMap<String, f64>,
    records: Vec<CostRecord>,
}

/// Aggregate view used by `stats`.
#[derive(Debug, Clone, Serialize)]
pub struct CostSummary {
    pub day: Option<NaiveDate>,
    pub daily_total: f64,
    pub per_provider: Vec<(String, f64)>,
    pub call_count: usize,
}

/// In-process cost ledger with internal mutual exclusion. Increments and
/// budget checks are atomic under one lock; the daily totals roll over at
/// the UTC date boundary.
pub struct CostLedger {
    inner: Mutex<LedgerInner>,
    snapshot_path: Option<PathBuf>,
}

impl CostLedger {
    pub fn new(snapshot_path: Option<PathBuf>) -> Self {
        Self {
            inner: Mutex::new(LedgerInner::default()),
            snapshot_path,
        }
    }

    fn roll_day(inner: &mut LedgerInner, today: NaiveDate) {
        if inner.day != Some(today) {
            inner.day = Some(today);
            inner.daily_total = 0.0;
            inner.per_provider.clear();
            inner.records.clear();
        }
    }

    /// Record one successful call.
    pub fn record(&self, record: CostRecord) {
        {
            let mut inner = self.inner.lock().unwrap();
            Self::roll_day(&mut inner, record.timestamp.date_naive());
            inner.daily_total += record.cost;
            *inner.per_provider.entry(record.provider.clone()).or_insert(0.0) += record.cost;
            inner.records.push(record.clone());
        }
        if let Some(path) = &self.snapshot_path {
            if let Err(e) = append_snapshot(path, &record) {
                warn!(error = %e, "failed to append cost ledger snapshot");
            }
        }
    }

    /// Spend so far today. Rolls the day over first.
    pub fn daily_total(&self) -> f64 {
        let mut inner = self.inner.lock().unwrap();
        Self::roll_day(&mut inner, Utc::now().date_naive());
        inner.daily_total
    }

    pub fn summary(&self) -> CostSummary {
        let mut inner = self.inner.lock().unwrap();
        Self::roll_day(&mut inner, Utc::now().date_naive());
        let mut per_provider: Vec<(String, f64)> = inner
            .per_provider
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        per_provider.sort_by(|a, b| a.0.cmp(&b.0));
        CostSummary {
            day: inner.day,
            daily_total: inner.daily_total,
            per_provider,
            call_count: inner.records.len(),
        }
    }

    pub fn records(&self) -> Vec<CostRecord> {
        self.inner.lock().unwrap().records.clone()
    }
}

fn append_snapshot(path: &PathBuf, record: &CostRecord) -> std::io::Result<()> {
    use std::io::Write;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)?;
    let line = serde_json::to_string(record).map_err(std::io::Error::other)?;
    writeln!(file, "{line}")?;
    Ok(())
}

// ============ Router ============

struct Provider {
    config: ProviderConfig,
    client: Arc<dyn ChatClient>,
    /// Timestamps of recent dispatches for the per-minute cap.
    recent: Mutex<Vec<DateTime<Utc>>>,
}

impl Provider {
    fn over_rate_limit(&self, now: DateTime<Utc>) -> bool {
        if self.config.rpm == 0 {
            return false;
        }
        let mut recent = self.recent.lock().unwrap();
        recent.retain(|t| (now - *t).num_seconds() < 60);
        recent.len() as u32 >= self.config.rpm
    }

    fn mark_dispatch(&self, now: DateTime<Utc>) {
        self.recent.lock().unwrap().push(now);
    }
}

/// A successful routed call.
#[derive(Debug, Clone)]
pub struct LlmReply {
    pub text: String,
    pub model_used: String,
    pub cost: f64,
}

/// A successful routed call with a strictly parsed payload.
#[derive(Debug, Clone)]
pub struct StructuredReply<T> {
    pub value: T,
    pub model_used: String,
    pub cost: f64,
}

/// Model selection, fallback chain, cost ledger, budget enforcement.
pub struct LlmRouter {
    providers: Vec<Provider>,
    ledger: CostLedger,
    daily_budget: f64,
    max_attempts: u32,
}

impl LlmRouter {
    /// Build the production router from configuration. Credentials are read
    /// from each provider's `api_key_env` at startup.
    pub fn from_config(config: &LlmConfig, call_timeout: Duration) -> anyhow::Result<Self> {
        let mut providers = Vec::new();
        for p in &config.providers {
            let api_key = p
                .api_key_env
                .as_deref()
                .filter(|e| !e.is_empty())
                .and_then(|env| std::env::var(env).ok());
            let client = HttpChatClient::new(&p.endpoint, api_key, call_timeout)?;
            providers.push(Provider {
                config: p.clone(),
                client: Arc::new(client),
                recent: Mutex::new(Vec::new()),
            });
        }
        Ok(Self {
            providers,
            ledger: CostLedger::new(config.ledger_path.clone()),
            daily_budget: config.daily_budget_usd,
            max_attempts: RETRY_MAX_ATTEMPTS,
        })
    }

    /// Build a router with injected transports. Used by tests.
    pub fn with_clients(
        providers: Vec<(ProviderConfig, Arc<dyn ChatClient>)>,
        daily_budget: f64,
        ledger_path: Option<PathBuf>,
    ) -> Self {
        Self {
            providers: providers
                .into_iter()
                .map(|(config, client)| Provider {
                    config,
                    client,
                    recent: Mutex::new(Vec::new()),
                })
                .collect(),
            ledger: CostLedger::new(ledger_path),
            daily_budget,
            max_attempts: RETRY_MAX_ATTEMPTS,
        }
    }

    /// Cap transient retries per provider (tests use 1).
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn ledger(&self) -> &CostLedger {
        &self.ledger
    }

    pub fn remaining_budget(&self) -> f64 {
        (self.daily_budget - self.ledger.daily_total()).max(0.0)
    }

    /// Providers in dispatch order: the requested model's provider first
    /// when one is named, then the configured chain order.
    fn ordered(&self, model: Option<&str>) -> Vec<&Provider> {
        let mut ordered: Vec<&Provider> = Vec::new();
        if let Some(model) = model {
            for p in &self.providers {
                if p.config.model == model {
                    ordered.push(p);
                }
            }
        }
        for p in &self.providers {
            if !ordered.iter().any(|o| std::ptr::eq(*o, p)) {
                ordered.push(p);
            }
        }
        ordered
    }

    fn check_budget(&self) -> Result<()> {
        let spent = self.ledger.daily_total();
        if spent >= self.daily_budget {
            return Err(SiftError::BudgetExceeded {
                spent,
                cap: self.daily_budget,
            });
        }
        Ok(())
    }

    /// Plain-text call: first successful provider wins.
    pub async fn call(
        &self,
        operation: &str,
        prompt: &str,
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<LlmReply> {
        self.check_budget()?;
        let mut last_error = String::from("no providers configured");

        for provider in self.ordered(model) {
            match self
                .try_provider(provider, operation, prompt, temperature, max_tokens)
                .await
            {
                Ok(reply) => return Ok(reply),
                Err(e) => {
                    warn!(provider = %provider.config.name, error = %e, "provider failed, moving down the chain");
                    last_error = e;
                }
            }
        }
        Err(SiftError::ProvidersExhausted { reason: last_error })
    }

    /// Structured call: a provider whose output fails the strict schema
    /// parse counts as failed, and the chain moves on.
    pub async fn call_structured<T: DeserializeOwned>(
        &self,
        operation: &str,
        prompt: &str,
        model: Option<&str>,
        temperature: f32,
        max_tokens: u32,
    ) -> Result<StructuredReply<T>> {
        self.check_budget()?;
        let mut last_error = String::from("no providers configured");

        for provider in self.ordered(model) {
            match self
                .try_provider(provider, operation, prompt, temperature, max_tokens)
                .await
            {
                Ok(reply) => match parse_json_payload::<T>(&reply.text) {
                    Ok(value) => {
                        return Ok(StructuredReply {
                            value,
                            model_used: reply.model_used,
                            cost: reply.cost,
                        })
                    }
                    Err(e) => {
                        warn!(provider = %provider.config.name, error = %e, "schema-unrecoverable output, moving down the chain");
                        last_error = format!("schema parse failed: {e}");
                    }
                },
                Err(e) => {
                    warn!(provider = %provider.config.name, error = %e, "provider failed, moving down the chain");
                    last_error = e;
                }
            }
        }
        Err(SiftError::ProvidersExhausted { reason: last_error })
    }

    /// One provider with transient retries. Returns a string error so the
    /// chain loop can keep the last failure for diagnostics.
    async fn try_provider(
        &self,
        provider: &Provider,
        operation: &str,
        prompt: &str,
        temperature: f32,
        max_tokens: u32,
    ) -> std::result::Result<LlmReply, String> {
        let now = Utc::now();
        if provider.over_rate_limit(now) {
            return Err(format!("{} is over its rate limit", provider.config.name));
        }

        let mut last = String::new();
        for attempt in 0..self.max_attempts {
            if attempt > 0 {
                tokio::time::sleep(backoff_delay(attempt - 1)).await;
            }
            provider.mark_dispatch(Utc::now());
            match provider
                .client
                .complete(&provider.config.model, prompt, temperature, max_tokens)
                .await
            {
                Ok(completion) => {
                    let cost = completion.input_tokens as f64 / 1e6 * provider.config.input_price
                        + completion.output_tokens as f64 / 1e6 * provider.config.output_price;
                    self.ledger.record(CostRecord {
                        provider: provider.config.name.clone(),
                        model: provider.config.model.clone(),
                        operation: operation.to_string(),
                        input_tokens: completion.input_tokens,
                        output_tokens: completion.output_tokens,
                        cost,
                        timestamp: Utc::now(),
                    });
                    if attempt > 0 {
                        debug!(provider = %provider.config.name, attempt, "succeeded after retry");
                    }
                    return Ok(LlmReply {
                        text: completion.text,
                        model_used: provider.config.model.clone(),
                        cost,
                    });
                }
                Err(e) => last = e.to_string(),
            }
        }
        Err(last)
    }
}

/// Pull a JSON object out of a model response and parse it strictly.
/// Tolerates markdown fences and prose around the object; unknown fields
/// inside it are rejected by the schema types.
pub fn parse_json_payload<T: DeserializeOwned>(text: &str) -> anyhow::Result<T> {
    let trimmed = text.trim();
    let candidate = if trimmed.starts_with('{') {
        trimmed.to_string()
    } else {
        let start = trimmed
            .find('{')
            .ok_or_else(|| anyhow::anyhow!("no JSON object in response"))?;
        let end = trimmed
            .rfind('}')
            .ok_or_else(|| anyhow::anyhow!("unterminated JSON object in response"))?;
        if end < start {
            anyhow::bail!("malformed JSON object in response");
        }
        trimmed[start..=end].to_string()
    };
    Ok(serde_json::from_str(&candidate)?)
}
