//! Human-readable daily journal plus a structured JSONL event log.
//!
//! Journal writes are best-effort: a failure is logged and swallowed so that
//! observability problems never block a round from committing.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::warn;

use crate::evaluation::{Dimension, FinalEvaluation, RoundEvaluation, Winner};
use crate::persistence::{self, PersistenceError};
use crate::persona::Persona;
use crate::text::{date_utc8, format_utc8};

/// One line of `debate_events.jsonl`.
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord<'a> {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: &'a str,
    pub payload: Value,
}

#[derive(Debug, Clone)]
pub struct Journal {
    journal_dir: PathBuf,
    events_path: PathBuf,
}

fn or_pending(topic: &str) -> &str {
    if topic.trim().is_empty() {
        "(待定)"
    } else {
        topic.trim()
    }
}

fn bullets(items: &[String]) -> Vec<String> {
    items.iter().map(|s| format!("- {s}")).collect()
}

impl Journal {
    pub fn new(journal_dir: impl Into<PathBuf>, log_dir: impl AsRef<Path>) -> Self {
        Self {
            journal_dir: journal_dir.into(),
            events_path: log_dir.as_ref().join("debate_events.jsonl"),
        }
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Markdown file for the UTC+8 day of `at`.
    pub fn day_path(&self, at: DateTime<Utc>) -> PathBuf {
        self.journal_dir.join(format!("{}.md", date_utc8(at)))
    }

    fn try_event(&self, kind: &str, payload: Value) -> Result<(), PersistenceError> {
        persistence::append_jsonl(
            &self.events_path,
            &EventRecord {
                ts: Utc::now(),
                kind,
                payload,
            },
        )
    }

    /// Append a structured event.
    pub fn event(&self, kind: &str, payload: Value) {
        if let Err(e) = self.try_event(kind, payload) {
            warn!(kind, error = %e, "Failed to append debate event");
        }
    }

    fn markdown(&self, text: &str) {
        let now = Utc::now();
        if let Err(e) = persistence::append_text(&self.day_path(now), &format!("{text}\n")) {
            warn!(error = %e, "Failed to append journal entry");
        }
    }

    pub fn round_start(&self, round: u64, topic: &str, stage_title: &str) {
        self.event(
            "round_start",
            json!({"round": round, "topic": topic, "stage": stage_title}),
        );
        self.markdown(&format!(
            "\n## {} Round {round} | Topic: {} | {stage_title}\n",
            format_utc8(Utc::now()),
            or_pending(topic)
        ));
    }

    pub fn message(&self, persona: Persona, round: u64, topic: &str, reply: &str) {
        self.event(
            "message",
            json!({"round": round, "persona": persona, "topic": topic, "reply": reply}),
        );
        let body = if reply.trim().is_empty() { "(空)" } else { reply.trim() };
        self.markdown(&format!(
            "**{persona}** ({})\nTopic: {}\n{body}\n",
            format_utc8(Utc::now()),
            or_pending(topic)
        ));
    }

    pub fn plan_update(&self, persona: Persona, applied: &[String]) {
        if applied.is_empty() {
            return;
        }
        self.event("plan_update", json!({"persona": persona, "updates": applied}));
        let mut lines = vec![format!(
            "**{persona} plan update** ({})",
            format_utc8(Utc::now())
        )];
        lines.extend(bullets(applied));
        lines.push(String::new());
        self.markdown(&lines.join("\n"));
    }

    pub fn topic_change(&self, from: &str, to: &str, by: &str) {
        self.event("topic_change", json!({"from": from, "to": to, "by": by}));
        let from = if from.is_empty() { "(空)" } else { from };
        let to = if to.is_empty() { "(空)" } else { to };
        self.markdown(&format!(
            "**Topic change** ({}) {from} -> {to}\n",
            format_utc8(Utc::now())
        ));
    }

    /// Structured system event (errors, skips, lifecycle markers).
    pub fn system(&self, event: &str, detail: &str) {
        self.event("system", json!({"event": event, "detail": detail}));
        self.markdown(&format!(
            "**System** ({}) {event}: {detail}\n",
            format_utc8(Utc::now())
        ));
    }

    pub fn round_evaluation(&self, round: u64, evaluation: &RoundEvaluation) {
        self.event(
            "round_evaluation",
            json!({"round": round, "evaluation": evaluation}),
        );
        let mut lines = vec![
            format!("**评委评分** ({})", format_utc8(Utc::now())),
            format!("轮次: {round}"),
            format!("本轮胜方: {}", evaluation.winner),
            format!(
                "平均分: 正方 {:.2} | 反方 {:.2}",
                evaluation.averages[Persona::P1],
                evaluation.averages[Persona::P2]
            ),
        ];
        if !evaluation.core_conflict.is_empty() {
            lines.push(format!("核心交锋: {}", evaluation.core_conflict));
        }
        for persona in Persona::ALL {
            lines.push(String::new());
            lines.push(format!("{}详细得分:", persona.side()));
            for dim in Dimension::ALL {
                lines.push(format!(
                    "- {}: {}/10",
                    dim.label(),
                    evaluation.scores[persona].get(dim)
                ));
            }
        }
        for (title, section) in [("亮点", &evaluation.highlights), ("改进建议", &evaluation.suggestions)] {
            for persona in Persona::ALL {
                lines.push(String::new());
                lines.push(format!("{}{title}:", persona.side()));
                lines.extend(bullets(&section[persona]));
            }
        }
        lines.push(String::new());
        self.markdown(&lines.join("\n"));
    }

    pub fn final_evaluation(&self, session_id: u64, topic: &str, evaluation: &FinalEvaluation) {
        self.event(
            "final_evaluation",
            json!({"session_id": session_id, "topic": topic, "evaluation": evaluation}),
        );
        let verdict = match evaluation.winner {
            Winner::P1 => "正方获胜",
            Winner::P2 => "反方获胜",
            Winner::Tie => "平局",
        };
        let mut lines = vec![
            format!("\n\n# 辩论赛最终结果 [{}]", format_utc8(Utc::now())),
            format!("## Debate {session_id} | 辩题: {}", or_pending(topic)),
            String::new(),
            format!("### 最终判定: {verdict}"),
            String::new(),
            "### 综合评分:".to_string(),
            format!("- 正方: {}/100", evaluation.final_scores[Persona::P1]),
            format!("- 反方: {}/100", evaluation.final_scores[Persona::P2]),
            String::new(),
            "### 关键转折点:".to_string(),
        ];
        lines.extend(evaluation.key_turning_points.iter().map(|p| match p.round {
            Some(round) => format!("- 第{round}轮: {}", p.description),
            None => format!("- {}", p.description),
        }));
        lines.push(String::new());
        lines.push("### 决定性因素:".to_string());
        lines.extend(bullets(&evaluation.decisive_factors));
        for persona in Persona::ALL {
            lines.push(String::new());
            lines.push(format!("### {}优点:", persona.side()));
            lines.extend(bullets(&evaluation.strengths[persona]));
            lines.push(String::new());
            lines.push(format!("### {}不足:", persona.side()));
            lines.extend(bullets(&evaluation.weaknesses[persona]));
        }
        lines.push(String::new());
        lines.push("### 整体评价:".to_string());
        lines.push(evaluation.overall_comment.clone());
        lines.push(String::new());
        self.markdown(&lines.join("\n"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::evaluation::DimensionScores;
    use crate::persona::PerPersona;

    fn journal(dir: &Path) -> Journal {
        Journal::new(dir.join("journal"), dir.join("logs"))
    }

    fn read_day(j: &Journal) -> String {
        std::fs::read_to_string(j.day_path(Utc::now())).unwrap()
    }

    #[test]
    fn test_events_are_jsonl() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        j.round_start(1, "题", "开篇陈词");
        j.system("judge_unavailable", "timeout");
        let raw = std::fs::read_to_string(j.events_path()).unwrap();
        let lines: Vec<Value> = raw
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["type"], "round_start");
        assert_eq!(lines[1]["payload"]["event"], "judge_unavailable");
    }

    #[test]
    fn test_markdown_sections() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        j.message(Persona::P2, 3, "", "反驳");
        j.plan_update(Persona::P1, &[]);
        j.plan_update(Persona::P1, &["add: 数据".to_string()]);
        let mut eval = RoundEvaluation::from_scores(PerPersona::new(
            DimensionScores::uniform(7.0),
            DimensionScores::uniform(6.0),
        ));
        eval.suggestions[Persona::P2] = vec!["多举证".into()];
        j.round_evaluation(3, &eval);
        let text = read_day(&j);
        assert!(text.contains("**P2** ("));
        assert!(text.contains("Topic: (待定)"));
        assert_eq!(text.matches("plan update").count(), 1);
        assert!(text.contains("平均分: 正方 7.00 | 反方 6.00"));
        assert!(text.contains("反方改进建议:\n- 多举证"));
    }

    #[test]
    fn test_final_evaluation_block() {
        let dir = tempfile::tempdir().unwrap();
        let j = journal(dir.path());
        let eval = FinalEvaluation {
            winner: Winner::P2,
            key_turning_points: vec![],
            decisive_factors: vec!["证据".into()],
            strengths: PerPersona::default(),
            weaknesses: PerPersona::default(),
            final_scores: PerPersona::new(70.0, 82.0),
            overall_comment: "势均力敌".into(),
        };
        j.final_evaluation(4, "题", &eval);
        let text = read_day(&j);
        assert!(text.contains("# 辩论赛最终结果"));
        assert!(text.contains("### 最终判定: 反方获胜"));
        assert!(text.contains("- 反方: 82/100"));
    }
}
