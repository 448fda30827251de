//! Runtime configuration.
//!
//! Layering: built-in defaults, then an optional TOML file, then `DEBATE_*`
//! environment variables. The engine tuning block is nested under `[engine]`.

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use debate_engine::skills::load_skills;
use debate_engine::{EngineConfig, Persona, StateLayout};
use serde::{Deserialize, Serialize};

pub const DEFAULT_BASE_URL: &str = "http://localhost:8000";
pub const DEFAULT_MODEL: &str = "qwen3-8b";

/// Model endpoint settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub base_url: String,
    /// Bearer token. Local endpoints fall back to `"EMPTY"`.
    pub api_key: Option<String>,
    pub model: String,
    /// Per-persona model overrides.
    pub model_p1: Option<String>,
    pub model_p2: Option<String>,
    pub top_p: f32,
    /// Hard ceiling applied on top of the per-request token budget.
    pub max_tokens: Option<u32>,
    pub timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.into(),
            api_key: None,
            model: DEFAULT_MODEL.into(),
            model_p1: None,
            model_p2: None,
            top_p: 0.9,
            max_tokens: None,
            timeout_secs: 60,
        }
    }
}

impl LlmConfig {
    /// Model used for `persona`, or the shared model for system tasks.
    pub fn model_for(&self, persona: Option<Persona>) -> &str {
        let over = match persona {
            Some(Persona::P1) => self.model_p1.as_deref(),
            Some(Persona::P2) => self.model_p2.as_deref(),
            None => None,
        };
        over.filter(|m| !m.trim().is_empty()).unwrap_or(&self.model)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs.max(1))
    }
}

/// Jittered exponential backoff for retryable transport errors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub max_retries: u32,
    pub base_secs: f64,
    pub max_secs: f64,
    pub multiplier: f64,
    pub jitter_secs: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 12,
            base_secs: 2.0,
            max_secs: 90.0,
            multiplier: 2.0,
            jitter_secs: 1.5,
        }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (1-based).
    ///
    /// `min(max, base * multiplier^(attempt-1) + unit * jitter)` where `unit`
    /// is a sample from `[0, 1)`.
    pub fn backoff(&self, attempt: u32, unit: f64) -> Duration {
        let exp = attempt.saturating_sub(1).min(64) as i32;
        let raw = self.base_secs * self.multiplier.powi(exp) + unit.clamp(0.0, 1.0) * self.jitter_secs;
        let secs = raw.min(self.max_secs);
        if secs.is_finite() && secs > 0.0 {
            Duration::from_secs_f64(secs)
        } else {
            Duration::ZERO
        }
    }
}

/// Top-level configuration for the agents binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Directory holding `state/`, `journal/` and `logs/`.
    pub root: PathBuf,
    pub loop_sleep_secs: u64,
    /// Score rounds with the model judge; off means no policy learning.
    pub judge_enabled: bool,
    pub llm: LlmConfig,
    pub retry: RetryConfig,
    pub engine: EngineConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("."),
            loop_sleep_secs: 10,
            judge_enabled: true,
            llm: LlmConfig::default(),
            retry: RetryConfig::default(),
            engine: EngineConfig::default(),
        }
    }
}

fn parsed<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match lookup(key) {
        Some(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("{key} has an invalid value: {raw:?}")),
        _ => Ok(None),
    }
}

fn text(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<String> {
    lookup(key).filter(|v| !v.trim().is_empty())
}

impl AppConfig {
    /// Defaults, then `path` (if given), then the process environment, then
    /// the `--root` override, then `state/skills.json` under the final root.
    pub fn load(path: Option<&Path>, root_override: Option<PathBuf>) -> Result<Self> {
        Self::load_with(path, root_override, |key| std::env::var(key).ok())
    }

    /// [`Self::load`] with environment lookups resolved through `lookup`.
    pub fn load_with(
        path: Option<&Path>,
        root_override: Option<PathBuf>,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_toml_file(path)?,
            None => Self::default(),
        };
        config.apply_env(lookup)?;
        if let Some(root) = root_override {
            config.root = root;
        }
        let skills_path = config.layout().skills();
        if skills_path.exists() {
            config.engine.skills = load_skills(&skills_path);
        }
        config
            .engine
            .validate()
            .context("Invalid engine configuration")?;
        Ok(config)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .with_context(|| format!("Failed to parse config TOML {}", path.display()))
    }

    /// Overlay `DEBATE_*` variables resolved through `lookup`.
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(root) = text(&lookup, "DEBATE_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(v) = parsed(&lookup, "DEBATE_LOOP_SLEEP_SECS")? {
            self.loop_sleep_secs = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_JUDGE_ENABLED")? {
            self.judge_enabled = v;
        }

        let llm = &mut self.llm;
        if let Some(v) = text(&lookup, "DEBATE_BASE_URL") {
            llm.base_url = v;
        }
        if let Some(v) = text(&lookup, "DEBATE_API_KEY") {
            llm.api_key = Some(v);
        }
        if let Some(v) = text(&lookup, "DEBATE_MODEL") {
            llm.model = v;
        }
        if let Some(v) = text(&lookup, "DEBATE_MODEL_P1") {
            llm.model_p1 = Some(v);
        }
        if let Some(v) = text(&lookup, "DEBATE_MODEL_P2") {
            llm.model_p2 = Some(v);
        }
        if let Some(v) = parsed(&lookup, "DEBATE_TOP_P")? {
            llm.top_p = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_MAX_TOKENS")? {
            llm.max_tokens = Some(v);
        }
        if let Some(v) = parsed(&lookup, "DEBATE_TIMEOUT_SECS")? {
            llm.timeout_secs = v;
        }

        let retry = &mut self.retry;
        if let Some(v) = parsed(&lookup, "DEBATE_MAX_RETRIES")? {
            retry.max_retries = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_RETRY_BASE_SECS")? {
            retry.base_secs = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_RETRY_MAX_SECS")? {
            retry.max_secs = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_RETRY_MULTIPLIER")? {
            retry.multiplier = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_RETRY_JITTER_SECS")? {
            retry.jitter_secs = v;
        }

        let engine = &mut self.engine;
        if let Some(v) = parsed(&lookup, "DEBATE_TEMPERATURE")? {
            engine.temperature = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_CONTEXT_MAX_CHARS")? {
            engine.context_max_chars = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_FREE_ROUNDS")? {
            engine.schedule.free_rounds = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_FREE_TOTAL_CHARS")? {
            engine.schedule.free_total_chars = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_RL_ENABLED")? {
            engine.policy.enabled = v;
        }
        if let Some(v) = parsed(&lookup, "DEBATE_FINAL_EVALUATION")? {
            engine.final_evaluation = v;
        }
        Ok(())
    }

    pub fn layout(&self) -> StateLayout {
        StateLayout::new(&self.root)
    }

    pub fn loop_sleep(&self) -> Duration {
        Duration::from_secs(self.loop_sleep_secs)
    }
}
