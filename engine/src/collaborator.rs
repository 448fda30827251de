//! Seams to the outside world: the model channel and the judge.
//!
//! The engine never talks HTTP itself. It submits [`ModelRequest`]s through a
//! [`ModelClient`] and asks a [`Judge`] for evaluations; concrete
//! implementations live in the agents crate.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::evaluation::{EvaluationParseError, FinalEvaluation, RoundEvaluation};
use crate::persona::{PerPersona, Persona};

/// One prompt submission.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelRequest {
    /// Persona the request is made for; `None` for system tasks (topic, judge).
    pub persona: Option<Persona>,
    pub system: String,
    pub user: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ModelResponse {
    pub content: String,
    pub usage: Option<Usage>,
}

impl ModelResponse {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            usage: None,
        }
    }
}

/// Failure talking to the model backend.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TransportError {
    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited: {0}")]
    RateLimited(String),

    #[error("server error {status}: {message}")]
    Server { status: u16, message: String },

    #[error("connection failed: {0}")]
    Connection(String),

    /// Not worth retrying: bad request, auth failure, malformed response.
    #[error("fatal transport error: {0}")]
    Fatal(String),
}

impl TransportError {
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Fatal(_))
    }

    /// Classify an HTTP status that is not a success.
    pub fn from_status(status: u16, message: impl Into<String>) -> Self {
        let message = message.into();
        match status {
            408 => Self::Timeout(message),
            429 => Self::RateLimited(message),
            500..=599 => Self::Server { status, message },
            _ => Self::Fatal(format!("status {status}: {message}")),
        }
    }
}

#[async_trait]
pub trait ModelClient: Send + Sync {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, TransportError>;
}

/// Material the judge scores for one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct JudgeRequest {
    pub round: u64,
    pub topic: String,
    pub stage_key: String,
    pub stage_title: String,
    pub stage_rule: String,
    pub replies: PerPersona<String>,
}

#[derive(Debug, Error)]
pub enum JudgeError {
    #[error("judge transport failed: {0}")]
    Transport(#[from] TransportError),

    #[error("judge output unusable: {0}")]
    Parse(#[from] EvaluationParseError),

    #[error("judge disabled")]
    Disabled,
}

#[async_trait]
pub trait Judge: Send + Sync {
    async fn evaluate_round(&self, request: JudgeRequest) -> Result<RoundEvaluation, JudgeError>;

    /// Whole-debate verdict from the session transcript.
    async fn evaluate_debate(
        &self,
        topic: &str,
        transcript: &str,
    ) -> Result<FinalEvaluation, JudgeError>;
}
