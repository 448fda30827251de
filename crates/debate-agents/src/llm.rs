//! OpenAI-compatible chat client with retry and token accounting.
//!
//! [`HttpTransport`] performs exactly one `POST /chat/completions` and
//! classifies failures. [`RetryingClient`] wraps any [`ChatTransport`] with
//! jittered exponential backoff and implements the engine's [`ModelClient`].

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use debate_engine::persistence;
use debate_engine::text::snippet;
use debate_engine::{ModelClient, ModelRequest, ModelResponse, TransportError, Usage};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::config::{LlmConfig, RetryConfig};

/// API key sent to local inference servers that ignore authentication.
pub const LOCAL_API_KEY: &str = "EMPTY";

/// Substrings of error messages that mark a failure as transient.
const RETRYABLE_HINTS: &[&str] = &[
    "rate limit",
    "try again",
    "overloaded",
    "temporary",
    "econnreset",
    "econnrefused",
    "connection reset",
    "connection refused",
];

fn host_of(url: &str) -> &str {
    let rest = url.split_once("://").map_or(url, |(_, rest)| rest);
    let authority = rest.split(['/', '?']).next().unwrap_or(rest);
    let authority = authority.rsplit('@').next().unwrap_or(authority);
    if let Some(v6) = authority.strip_prefix('[') {
        return v6.split(']').next().unwrap_or(v6);
    }
    authority.split(':').next().unwrap_or(authority)
}

/// Loopback, unspecified, private IPv4 and link-local IPv6 hosts.
pub fn is_local_host(url: &str) -> bool {
    let host = host_of(url).to_ascii_lowercase();
    if host == "localhost" {
        return true;
    }
    match host.parse::<IpAddr>() {
        Ok(IpAddr::V4(ip)) => ip.is_loopback() || ip.is_unspecified() || ip.is_private(),
        Ok(IpAddr::V6(ip)) => {
            ip.is_loopback() || ip.is_unspecified() || (ip.segments()[0] & 0xffc0) == 0xfe80
        }
        Err(_) => false,
    }
}

/// Base URL for OpenAI-style paths: scheme added if missing, trailing slash
/// removed, `/v1` appended for local servers.
pub fn api_base(raw: &str) -> String {
    let trimmed = raw.trim().trim_end_matches('/');
    let mut base = if trimmed.contains("://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if is_local_host(&base) && !base.ends_with("/v1") {
        base.push_str("/v1");
    }
    base
}

/// Configured key, or [`LOCAL_API_KEY`] for local servers.
pub fn resolve_api_key(config: &LlmConfig) -> Option<String> {
    match config.api_key.as_deref().map(str::trim) {
        Some(key) if !key.is_empty() => Some(key.to_string()),
        _ if is_local_host(&api_base(&config.base_url)) => Some(LOCAL_API_KEY.to_string()),
        _ => None,
    }
}

/// Classify a failed request from its HTTP status (if any) and message.
pub fn classify_failure(status: Option<u16>, message: &str) -> TransportError {
    if let Some(status) = status {
        let err = TransportError::from_status(status, message);
        if err.is_retryable() {
            return err;
        }
    }
    let lower = message.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") || lower.contains("etimedout") {
        TransportError::Timeout(message.to_string())
    } else if lower.contains("rate limit") {
        TransportError::RateLimited(message.to_string())
    } else if RETRYABLE_HINTS.iter().any(|hint| lower.contains(hint)) {
        TransportError::Connection(message.to_string())
    } else {
        match status {
            Some(status) => TransportError::from_status(status, message),
            None => TransportError::Fatal(message.to_string()),
        }
    }
}

fn classify_reqwest(err: reqwest::Error) -> TransportError {
    if err.is_timeout() {
        TransportError::Timeout(err.to_string())
    } else if err.is_connect() {
        TransportError::Connection(err.to_string())
    } else if err.is_decode() {
        TransportError::Fatal(format!("malformed response: {err}"))
    } else {
        classify_failure(err.status().map(|s| s.as_u16()), &err.to_string())
    }
}

/// One chat completion against a backend, no retries.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send(&self, model: &str, request: &ModelRequest)
        -> Result<ModelResponse, TransportError>;
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    temperature: f32,
    top_p: f32,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<Choice>,
    usage: Option<Usage>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

/// reqwest-backed transport for OpenAI-compatible servers (vLLM and friends).
pub struct HttpTransport {
    http: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    top_p: f32,
}

impl HttpTransport {
    pub fn new(config: &LlmConfig) -> Result<Self, TransportError> {
        let base = api_base(&config.base_url);
        let mut builder = reqwest::Client::builder().timeout(config.timeout());
        // Local inference servers are never reached through a proxy.
        if is_local_host(&base) {
            builder = builder.no_proxy();
        }
        let http = builder
            .build()
            .map_err(|e| TransportError::Fatal(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            endpoint: format!("{base}/chat/completions"),
            api_key: resolve_api_key(config),
            top_p: config.top_p,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl ChatTransport for HttpTransport {
    async fn send(
        &self,
        model: &str,
        request: &ModelRequest,
    ) -> Result<ModelResponse, TransportError> {
        let body = ChatCompletionRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system,
                },
                ChatMessage {
                    role: "user",
                    content: &request.user,
                },
            ],
            temperature: request.temperature,
            top_p: self.top_p,
            max_tokens: request.max_tokens,
        };
        let mut builder = self.http.post(&self.endpoint).json(&body);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(classify_reqwest)?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(classify_failure(Some(status.as_u16()), &snippet(&text, 300)));
        }

        let parsed: ChatCompletionResponse = response.json().await.map_err(classify_reqwest)?;
        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| TransportError::Fatal("response has no message content".into()))?;
        Ok(ModelResponse {
            content,
            usage: parsed.usage,
        })
    }
}

/// Cumulative token usage, persisted to `token_stats.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TokenStats {
    pub total_prompt_tokens: u64,
    pub total_completion_tokens: u64,
    pub total_tokens: u64,
    pub requests: u64,
    pub last_updated: Option<DateTime<Utc>>,
}

impl TokenStats {
    pub fn record(&mut self, usage: &Usage, at: DateTime<Utc>) {
        self.total_prompt_tokens += usage.prompt_tokens;
        self.total_completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
        self.requests += 1;
        self.last_updated = Some(at);
    }
}

/// Health of the backend as seen by the most recent request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApiStatus {
    pub ok: bool,
    pub last_latency_ms: Option<u64>,
    pub last_error: Option<String>,
    pub retries: u64,
}

/// Something that can report client statistics for `status.json`.
pub trait StatsSource: Send + Sync {
    fn snapshot(&self) -> serde_json::Value;
}

#[derive(Default)]
struct ClientStats {
    tokens: TokenStats,
    api: ApiStatus,
}

/// [`ModelClient`] that retries retryable transport errors.
pub struct RetryingClient<T> {
    transport: T,
    llm: LlmConfig,
    retry: RetryConfig,
    stats: Mutex<ClientStats>,
    stats_path: Option<PathBuf>,
}

impl<T: ChatTransport> RetryingClient<T> {
    pub fn new(transport: T, llm: LlmConfig, retry: RetryConfig) -> Self {
        Self {
            transport,
            llm,
            retry,
            stats: Mutex::new(ClientStats::default()),
            stats_path: None,
        }
    }

    /// Persist token stats to `path`, resuming from its current contents.
    pub fn with_stats_path(mut self, path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        match persistence::load_json::<TokenStats>(&path) {
            Ok(Some(tokens)) => {
                if let Ok(mut stats) = self.stats.lock() {
                    stats.tokens = tokens;
                }
            }
            Ok(None) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable token stats"),
        }
        self.stats_path = Some(path);
        self
    }

    pub fn token_stats(&self) -> TokenStats {
        self.stats
            .lock()
            .map(|s| s.tokens.clone())
            .unwrap_or_default()
    }

    pub fn api_status(&self) -> ApiStatus {
        self.stats.lock().map(|s| s.api.clone()).unwrap_or_default()
    }

    fn record_success(&self, usage: Option<&Usage>, latency_ms: u64) {
        let tokens = {
            let Ok(mut stats) = self.stats.lock() else {
                return;
            };
            stats.api.ok = true;
            stats.api.last_latency_ms = Some(latency_ms);
            stats.api.last_error = None;
            match usage {
                Some(usage) => {
                    stats.tokens.record(usage, Utc::now());
                    stats.tokens.clone()
                }
                None => return,
            }
        };
        if let Some(path) = &self.stats_path {
            if let Err(e) = persistence::save_json(path, &tokens) {
                warn!(path = %path.display(), error = %e, "Failed to save token stats");
            }
        }
    }

    fn record_failure(&self, err: &TransportError, retrying: bool) {
        if let Ok(mut stats) = self.stats.lock() {
            stats.api.ok = false;
            stats.api.last_error = Some(err.to_string());
            if retrying {
                stats.api.retries += 1;
            }
        }
    }
}

#[async_trait]
impl<T: ChatTransport> ModelClient for RetryingClient<T> {
    async fn complete(&self, mut request: ModelRequest) -> Result<ModelResponse, TransportError> {
        if let Some(cap) = self.llm.max_tokens {
            request.max_tokens = request.max_tokens.min(cap);
        }
        request.max_tokens = request.max_tokens.max(1);
        let model = self.llm.model_for(request.persona).to_string();

        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            let started = Instant::now();
            match self.transport.send(&model, &request).await {
                Ok(response) => {
                    let latency_ms = started.elapsed().as_millis() as u64;
                    debug!(
                        model = %model,
                        attempt,
                        latency_ms,
                        chars = response.content.chars().count(),
                        "Model call succeeded"
                    );
                    self.record_success(response.usage.as_ref(), latency_ms);
                    return Ok(response);
                }
                Err(e) if e.is_retryable() && attempt <= self.retry.max_retries => {
                    self.record_failure(&e, true);
                    let unit: f64 = rand::rng().random();
                    let backoff = self.retry.backoff(attempt, unit);
                    warn!(
                        attempt,
                        max_retries = self.retry.max_retries,
                        backoff_secs = backoff.as_secs_f64(),
                        error = %e,
                        "Transient model error, retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => {
                    self.record_failure(&e, false);
                    warn!(model = %model, attempt, error = %e, "Model call failed");
                    return Err(e);
                }
            }
        }
    }
}

impl<T: ChatTransport> StatsSource for RetryingClient<T> {
    fn snapshot(&self) -> serde_json::Value {
        let Ok(stats) = self.stats.lock() else {
            return serde_json::Value::Null;
        };
        let mut value = serde_json::to_value(&stats.tokens).unwrap_or_default();
        if let serde_json::Value::Object(map) = &mut value {
            map.insert(
                "api_status".into(),
                serde_json::to_value(&stats.api).unwrap_or_default(),
            );
        }
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use debate_engine::Persona;
    use std::time::Duration;

    fn request(persona: Option<Persona>) -> ModelRequest {
        ModelRequest {
            persona,
            system: "sys".into(),
            user: "user".into(),
            max_tokens: 900,
            temperature: 0.4,
        }
    }

    fn fast_retry(max_retries: u32) -> RetryConfig {
        RetryConfig {
            max_retries,
            base_secs: 1.0,
            max_secs: 4.0,
            multiplier: 2.0,
            jitter_secs: 0.0,
        }
    }

    #[test]
    fn test_api_base_normalization() {
        assert_eq!(api_base("localhost:8000"), "http://localhost:8000/v1");
        assert_eq!(api_base("http://127.0.0.1:8000/"), "http://127.0.0.1:8000/v1");
        assert_eq!(api_base("http://192.168.1.5:8000/v1"), "http://192.168.1.5:8000/v1");
        assert_eq!(api_base("http://[::1]:8000"), "http://[::1]:8000/v1");
        assert_eq!(api_base("https://api.example.com/v1"), "https://api.example.com/v1");
        assert_eq!(api_base("https://api.example.com"), "https://api.example.com");
    }

    #[test]
    fn test_local_host_detection() {
        assert!(is_local_host("http://10.0.0.2:8000"));
        assert!(is_local_host("http://172.20.1.1"));
        assert!(!is_local_host("http://172.40.1.1"));
        assert!(is_local_host("http://[fe80::1]:8000"));
        assert!(is_local_host("http://0.0.0.0:8000"));
        assert!(!is_local_host("https://api.openai.com/v1"));
    }

    #[test]
    fn test_api_key_resolution() {
        let local = LlmConfig::default();
        assert_eq!(resolve_api_key(&local).as_deref(), Some(LOCAL_API_KEY));
        let remote = LlmConfig {
            base_url: "https://api.example.com/v1".into(),
            ..LlmConfig::default()
        };
        assert_eq!(resolve_api_key(&remote), None);
        let keyed = LlmConfig {
            api_key: Some("sk-test".into()),
            ..remote
        };
        assert_eq!(resolve_api_key(&keyed).as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_failure_classification() {
        assert!(matches!(classify_failure(Some(429), "slow down"), TransportError::RateLimited(_)));
        assert!(matches!(classify_failure(Some(502), "bad gateway"), TransportError::Server { .. }));
        assert!(matches!(
            classify_failure(Some(400), "model overloaded, try again"),
            TransportError::Connection(_)
        ));
        assert!(matches!(classify_failure(Some(401), "unauthorized"), TransportError::Fatal(_)));
        assert!(matches!(classify_failure(None, "ETIMEDOUT"), TransportError::Timeout(_)));
        assert!(matches!(classify_failure(None, "ECONNRESET"), TransportError::Connection(_)));
        assert!(matches!(classify_failure(None, "invalid json"), TransportError::Fatal(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_errors_then_succeeds() {
        let mut transport = MockChatTransport::new();
        let mut calls = 0;
        transport.expect_send().times(3).returning(move |_, _| {
            calls += 1;
            if calls < 3 {
                Err(TransportError::Server {
                    status: 503,
                    message: "busy".into(),
                })
            } else {
                Ok(ModelResponse {
                    content: "ok".into(),
                    usage: Some(Usage {
                        prompt_tokens: 10,
                        completion_tokens: 5,
                        total_tokens: 15,
                    }),
                })
            }
        });
        let client = RetryingClient::new(transport, LlmConfig::default(), fast_retry(5));

        let started = tokio::time::Instant::now();
        let response = client.complete(request(Some(Persona::P1))).await.unwrap();
        assert_eq!(response.content, "ok");
        // 1s + 2s of backoff.
        assert!(started.elapsed() >= Duration::from_secs(3));
        let stats = client.token_stats();
        assert_eq!(stats.requests, 1);
        assert_eq!(stats.total_tokens, 15);
        let api = client.api_status();
        assert!(api.ok);
        assert_eq!(api.retries, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_fatal_error_is_not_retried() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send()
            .times(1)
            .returning(|_, _| Err(TransportError::Fatal("status 401: bad key".into())));
        let client = RetryingClient::new(transport, LlmConfig::default(), fast_retry(5));
        let err = client.complete(request(None)).await.unwrap_err();
        assert!(!err.is_retryable());
        assert!(!client.api_status().ok);
    }

    #[tokio::test(start_paused = true)]
    async fn test_gives_up_after_max_retries() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send()
            .times(3)
            .returning(|_, _| Err(TransportError::Timeout("slow".into())));
        let client = RetryingClient::new(transport, LlmConfig::default(), fast_retry(2));
        let err = client.complete(request(None)).await.unwrap_err();
        assert!(matches!(err, TransportError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_routes_persona_model_and_caps_tokens() {
        let mut transport = MockChatTransport::new();
        transport
            .expect_send()
            .withf(|model, req| model.to_string() == "p2-model" && req.max_tokens == 512)
            .times(1)
            .returning(|_, _| Ok(ModelResponse::text("hi")));
        let llm = LlmConfig {
            model_p2: Some("p2-model".into()),
            max_tokens: Some(512),
            ..LlmConfig::default()
        };
        let client = RetryingClient::new(transport, llm, fast_retry(0));
        client.complete(request(Some(Persona::P2))).await.unwrap();
    }

    #[tokio::test]
    async fn test_token_stats_persist_and_resume() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token_stats.json");
        let usage = Usage {
            prompt_tokens: 3,
            completion_tokens: 4,
            total_tokens: 7,
        };
        let mut transport = MockChatTransport::new();
        transport.expect_send().times(1).returning(move |_, _| {
            Ok(ModelResponse {
                content: "x".into(),
                usage: Some(usage),
            })
        });
        let client = RetryingClient::new(transport, LlmConfig::default(), fast_retry(0))
            .with_stats_path(&path);
        client.complete(request(None)).await.unwrap();

        let resumed = RetryingClient::new(MockChatTransport::new(), LlmConfig::default(), fast_retry(0))
            .with_stats_path(&path);
        assert_eq!(resumed.token_stats().total_tokens, 7);
        let snapshot = resumed.snapshot();
        assert_eq!(snapshot["requests"], 1);
        assert!(snapshot["api_status"].is_object());
    }
}
