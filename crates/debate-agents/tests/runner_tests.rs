//! Loop-level behavior: round limits, status reporting and cancellation.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use debate_agents::runner::Runner;
use debate_engine::evaluation::DimensionScores;
use debate_engine::orchestrator::read_status;
use debate_engine::{
    EngineConfig, FinalEvaluation, Judge, JudgeError, JudgeRequest, ModelClient, ModelRequest,
    ModelResponse, PerPersona, RoundEvaluation, RoundOrchestrator, ScheduleConfig, Session,
    StateLayout, TransportError, Winner,
};
use tokio_util::sync::CancellationToken;

struct EchoModel {
    calls: AtomicUsize,
    hang: bool,
}

#[async_trait]
impl ModelClient for EchoModel {
    async fn complete(&self, request: ModelRequest) -> Result<ModelResponse, TransportError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang && request.persona.is_some() {
            std::future::pending::<()>().await;
        }
        match request.persona {
            Some(p) => Ok(ModelResponse::text(format!(
                r#"{{"reply":"{p} 第{n}次发言，论点各不相同"}}"#
            ))),
            None => Ok(ModelResponse::text(r#"{"new_topic":"新题目？"}"#)),
        }
    }
}

struct EvenJudge;

#[async_trait]
impl Judge for EvenJudge {
    async fn evaluate_round(&self, _request: JudgeRequest) -> Result<RoundEvaluation, JudgeError> {
        Ok(RoundEvaluation::from_scores(PerPersona::splat(
            DimensionScores::uniform(6.0),
        )))
    }

    async fn evaluate_debate(
        &self,
        _topic: &str,
        _transcript: &str,
    ) -> Result<FinalEvaluation, JudgeError> {
        Ok(FinalEvaluation {
            winner: Winner::Tie,
            key_turning_points: vec![],
            decisive_factors: vec![],
            strengths: PerPersona::default(),
            weaknesses: PerPersona::default(),
            final_scores: PerPersona::splat(75.0),
            overall_comment: "平局".into(),
        })
    }
}

fn orchestrator(dir: &std::path::Path, hang: bool) -> RoundOrchestrator {
    let config = EngineConfig {
        schedule: ScheduleConfig {
            free_rounds: 1,
            free_total_chars: 0,
        },
        ..EngineConfig::default()
    };
    RoundOrchestrator::open(
        config,
        StateLayout::new(dir),
        Arc::new(EchoModel {
            calls: AtomicUsize::new(0),
            hang,
        }),
        Arc::new(EvenJudge),
    )
    .unwrap()
}

#[tokio::test(start_paused = true)]
async fn test_runner_stops_at_round_limit() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Runner::new(orchestrator(dir.path(), false), Duration::from_secs(10))
        .with_max_rounds(Some(3))
        .run(CancellationToken::new())
        .await;
    assert_eq!(summary.rounds_committed, 3);
    assert_eq!(summary.failed_attempts, 0);

    let layout = StateLayout::new(dir.path());
    let status = read_status(&layout).unwrap().unwrap();
    assert_eq!(status.round, 3);
    assert_eq!(status.sleep_seconds, 10);
    assert!(status.last_error.is_none());
    assert_eq!(Session::load(&layout.session()).unwrap().round, 3);
}

#[tokio::test(start_paused = true)]
async fn test_full_session_counts_completion() {
    let dir = tempfile::tempdir().unwrap();
    let summary = Runner::new(orchestrator(dir.path(), false), Duration::from_secs(1))
        .with_max_rounds(Some(8))
        .run(CancellationToken::new())
        .await;
    assert_eq!(summary.sessions_completed, 1);
    let session = Session::load(&StateLayout::new(dir.path()).session()).unwrap();
    assert_eq!(session.session_id, 2);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_drops_in_flight_round() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let runner = Runner::new(orchestrator(dir.path(), true), Duration::from_secs(10));
    let handle = tokio::spawn(runner.run(cancel.clone()));

    tokio::time::sleep(Duration::from_secs(5)).await;
    cancel.cancel();
    let summary = handle.await.unwrap();
    assert_eq!(summary.rounds_committed, 0);

    let layout = StateLayout::new(dir.path());
    assert!(!layout.session().exists());
    let transcript = std::fs::read_to_string(layout.conversation()).unwrap_or_default();
    assert!(transcript.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_cancel_between_rounds() {
    let dir = tempfile::tempdir().unwrap();
    let cancel = CancellationToken::new();
    let runner = Runner::new(orchestrator(dir.path(), false), Duration::from_secs(3600));
    let handle = tokio::spawn(runner.run(cancel.clone()));

    // First round commits immediately, then the loop sleeps for an hour.
    tokio::time::sleep(Duration::from_secs(60)).await;
    cancel.cancel();
    let summary = handle.await.unwrap();
    assert_eq!(summary.rounds_committed, 1);
}
