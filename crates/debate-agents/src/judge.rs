//! Model-backed judge.

use std::sync::Arc;

use async_trait::async_trait;
use debate_engine::evaluation::{parse_final_evaluation, parse_round_evaluation};
use debate_engine::prompts::{build_final_judge_prompt, build_round_judge_prompt, PromptPair};
use debate_engine::text::tail_chars;
use debate_engine::{
    FinalEvaluation, Judge, JudgeError, JudgeRequest, ModelClient, ModelRequest, RoundEvaluation,
};
use tracing::{info, warn};

pub const JUDGE_TEMPERATURE: f32 = 0.3;
pub const ROUND_JUDGE_MAX_TOKENS: u32 = 2048;
pub const FINAL_JUDGE_MAX_TOKENS: u32 = 3072;

/// Transcript characters shown to the final judge; older text is dropped.
pub const FINAL_TRANSCRIPT_MAX_CHARS: usize = 24_000;

/// Scores rounds and whole debates by prompting the shared model client.
pub struct LlmJudge {
    client: Arc<dyn ModelClient>,
    enabled: bool,
}

impl LlmJudge {
    pub fn new(client: Arc<dyn ModelClient>) -> Self {
        Self {
            client,
            enabled: true,
        }
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    async fn ask(&self, prompt: PromptPair, max_tokens: u32) -> Result<String, JudgeError> {
        if !self.enabled {
            return Err(JudgeError::Disabled);
        }
        let response = self
            .client
            .complete(ModelRequest {
                persona: None,
                system: prompt.system,
                user: prompt.user,
                max_tokens,
                temperature: JUDGE_TEMPERATURE,
            })
            .await?;
        Ok(response.content)
    }
}

#[async_trait]
impl Judge for LlmJudge {
    async fn evaluate_round(&self, request: JudgeRequest) -> Result<RoundEvaluation, JudgeError> {
        let prompt = build_round_judge_prompt(
            request.round,
            &request.topic,
            &request.stage_title,
            &request.stage_key,
            &request.stage_rule,
            &request.replies,
        );
        let raw = self.ask(prompt, ROUND_JUDGE_MAX_TOKENS).await?;
        let evaluation = parse_round_evaluation(&raw).inspect_err(|e| {
            warn!(round = request.round, error = %e, "Judge returned an unusable round evaluation");
        })?;
        info!(
            round = request.round,
            winner = %evaluation.winner,
            p1 = evaluation.averages.p1,
            p2 = evaluation.averages.p2,
            "Round judged"
        );
        Ok(evaluation)
    }

    async fn evaluate_debate(
        &self,
        topic: &str,
        transcript: &str,
    ) -> Result<FinalEvaluation, JudgeError> {
        let prompt = build_final_judge_prompt(topic, tail_chars(transcript, FINAL_TRANSCRIPT_MAX_CHARS));
        let raw = self.ask(prompt, FINAL_JUDGE_MAX_TOKENS).await?;
        let evaluation = parse_final_evaluation(&raw).inspect_err(|e| {
            warn!(error = %e, "Judge returned an unusable final evaluation");
        })?;
        info!(winner = %evaluation.winner, "Debate judged");
        Ok(evaluation)
    }
}
