//! The long-running debate loop.

use std::sync::Arc;
use std::time::Duration;

use debate_engine::text::{format_utc8, snippet};
use debate_engine::{RoundOrchestrator, RoundOutcome, StatusReport};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::llm::StatsSource;

/// Counters reported when the loop exits.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub rounds_committed: u64,
    pub failed_attempts: u64,
    pub sessions_completed: u64,
}

/// Drives [`RoundOrchestrator::run_round`] until cancelled or a round limit
/// is reached, writing `status.json` after every attempt.
pub struct Runner {
    orchestrator: RoundOrchestrator,
    loop_sleep: Duration,
    max_rounds: Option<u64>,
    stats: Option<Arc<dyn StatsSource>>,
}

impl Runner {
    pub fn new(orchestrator: RoundOrchestrator, loop_sleep: Duration) -> Self {
        Self {
            orchestrator,
            loop_sleep,
            max_rounds: None,
            stats: None,
        }
    }

    /// Stop after this many committed rounds.
    pub fn with_max_rounds(mut self, max_rounds: Option<u64>) -> Self {
        self.max_rounds = max_rounds;
        self
    }

    pub fn with_stats(mut self, stats: Arc<dyn StatsSource>) -> Self {
        self.stats = Some(stats);
        self
    }

    pub fn orchestrator(&self) -> &RoundOrchestrator {
        &self.orchestrator
    }

    fn log_outcome(outcome: &RoundOutcome) {
        info!(
            round = outcome.round,
            session_id = outcome.session_id,
            stage = %outcome.stage_key,
            topic = %outcome.topic,
            judged = outcome.evaluation.is_some(),
            duplicate = outcome.replies_identical,
            "Round committed"
        );
        if let Some(eval) = &outcome.evaluation {
            info!(
                round = outcome.round,
                winner = %eval.winner,
                p1 = eval.averages.p1,
                p2 = eval.averages.p2,
                "Round scores"
            );
        }
        if outcome.session_completed {
            info!(
                session_id = outcome.session_id,
                winner = ?outcome.final_evaluation.as_ref().map(|f| f.winner.to_string()),
                "Debate session completed"
            );
        }
    }

    fn write_status(&self, last_error: Option<String>) {
        let stats = self.stats.as_ref().map(|s| s.snapshot());
        if let Err(e) =
            self.orchestrator
                .write_status(last_error, self.loop_sleep.as_secs(), stats)
        {
            warn!(error = %e, "Failed to write status report");
        }
    }

    /// Run until `cancel` fires. A round in flight when cancellation arrives
    /// is dropped before it commits anything.
    pub async fn run(mut self, cancel: CancellationToken) -> RunSummary {
        let mut summary = RunSummary::default();
        info!(
            loop_sleep_secs = self.loop_sleep.as_secs(),
            max_rounds = ?self.max_rounds,
            "Debate loop starting"
        );
        self.write_status(None);

        loop {
            if self
                .max_rounds
                .is_some_and(|max| summary.rounds_committed >= max)
            {
                info!(rounds = summary.rounds_committed, "Round limit reached");
                break;
            }

            let result = tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancellation requested; abandoning in-flight round");
                    break;
                }
                result = self.orchestrator.run_round() => result,
            };

            let last_error = match result {
                Ok(outcome) => {
                    summary.rounds_committed += 1;
                    if outcome.session_completed {
                        summary.sessions_completed += 1;
                    }
                    Self::log_outcome(&outcome);
                    None
                }
                Err(e) => {
                    summary.failed_attempts += 1;
                    if e.is_retriable() {
                        warn!(
                            category = %e.retry_category(),
                            error = %e,
                            "Round failed; will retry after sleep"
                        );
                    } else {
                        error!(category = %e.retry_category(), error = %e, "Round failed");
                    }
                    Some(e.to_string())
                }
            };
            self.write_status(last_error);

            if self
                .max_rounds
                .is_some_and(|max| summary.rounds_committed >= max)
            {
                continue;
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Cancellation requested; stopping between rounds");
                    break;
                }
                _ = tokio::time::sleep(self.loop_sleep) => {}
            }
        }

        info!(
            rounds = summary.rounds_committed,
            failures = summary.failed_attempts,
            sessions = summary.sessions_completed,
            "Debate loop stopped"
        );
        summary
    }
}

/// One-line human summary of a status report.
pub fn status_line(report: &StatusReport) -> String {
    let topic = if report.topic.is_empty() {
        "-".to_string()
    } else {
        snippet(&report.topic, 60)
    };
    let stage = report
        .stage
        .as_ref()
        .map(|s| format!("{} ({}/{})", s.title, report.stage_round + 1, report.stage_total))
        .unwrap_or_else(|| "-".into());
    let last_reply = report
        .last_reply_at
        .map(format_utc8)
        .unwrap_or_else(|| "-".into());
    let tokens = report
        .token_stats
        .as_ref()
        .and_then(|t| Some((t.get("total_tokens")?.as_u64()?, t.get("requests")?.as_u64()?)))
        .filter(|(_, requests)| *requests > 0)
        .map(|(total, requests)| format!("{total} ({requests} req)"))
        .unwrap_or_else(|| "-".into());
    let api = report
        .token_stats
        .as_ref()
        .and_then(|t| t.get("api_status"))
        .and_then(|a| a.get("ok"))
        .and_then(|ok| ok.as_bool())
        .map(|ok| if ok { "OK" } else { "FAIL" })
        .unwrap_or("-");
    let leader = report
        .judge
        .overall_winner
        .map(|w| w.to_string())
        .unwrap_or_else(|| "-".into());

    let mut line = format!(
        "辩论 {} | 轮次 {} | 阶段 {stage} | 主题 {topic} | 上次回复 {last_reply} | 领先 {leader} | API {api} | Tokens {tokens}",
        report.session_id, report.round
    );
    if let Some(err) = &report.last_error {
        line.push_str(&format!(" | LastError {}", snippet(err, 80)));
    }
    line
}

#[cfg(test)]
mod tests {
    use super::*;
    use debate_engine::session::Session;
    use debate_engine::{ScheduleConfig, StageSchedule};

    #[test]
    fn test_status_line() {
        let mut session = Session::default();
        session.round = 3;
        session.stage_round = 2;
        session.topic = "效率与公平".into();
        let schedule = StageSchedule::build(&ScheduleConfig::default());
        let stats = serde_json::json!({
            "total_tokens": 1234,
            "requests": 5,
            "api_status": {"ok": false}
        });
        let report = StatusReport::build(&session, &schedule, Some("timeout".into()), 10, Some(stats));
        let line = status_line(&report);
        assert!(line.contains("轮次 3"));
        assert!(line.contains("(3/11)"));
        assert!(line.contains("主题 效率与公平"));
        assert!(line.contains("Tokens 1234 (5 req)"));
        assert!(line.contains("API FAIL"));
        assert!(line.ends_with("LastError timeout"));
    }

    #[test]
    fn test_status_line_without_stats() {
        let report = StatusReport::build(
            &Session::default(),
            &StageSchedule::build(&ScheduleConfig::default()),
            None,
            10,
            None,
        );
        let line = status_line(&report);
        assert!(line.contains("主题 -"));
        assert!(line.contains("Tokens -"));
        assert!(!line.contains("LastError"));
    }
}
