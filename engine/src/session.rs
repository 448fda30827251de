//! Session state: where the debate is in the schedule, which topic is being
//! argued, which topics were already used, and running score aggregates.

use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::evaluation::{RoundEvaluation, Winner};
use crate::persistence::{self, PersistenceError, Versioned};
use crate::persona::{PerPersona, Persona};
use crate::schedule::StageSchedule;

/// Topics used when the model cannot propose one, tried in order.
pub const FALLBACK_TOPICS: [&str; 8] = [
    "人工智能应否优先用于公共治理而非商业营销？",
    "高校招生应更看重综合素质而非统一考试成绩？",
    "城市应限制私家车出行以改善环境？",
    "短视频平台应承担用户成瘾的主要责任？",
    "企业远程办公应成为常态而非特例？",
    "未成年人应全面禁止网络直播打赏？",
    "应否对生成式 AI 内容强制标注来源？",
    "公共资源分配应优先效率还是公平？",
];

/// Base for numbered variants once every fallback topic is used.
pub const FALLBACK_VARIANT_BASE: &str = "公共政策应更强调公平还是效率？";

/// Topic history entries shown in the status report.
const STATUS_TOPIC_WINDOW: usize = 50;

/// Judge score aggregates for the running session.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreBoard {
    pub evaluated_rounds: u64,
    pub cumulative: PerPersona<f64>,
    pub current_evaluation: Option<RoundEvaluation>,
}

impl ScoreBoard {
    pub fn record(&mut self, evaluation: &RoundEvaluation) {
        for persona in Persona::ALL {
            self.cumulative[persona] += evaluation.averages[persona];
        }
        self.evaluated_rounds += 1;
        self.current_evaluation = Some(evaluation.clone());
    }

    /// Mean round average per persona, `None` before the first score.
    pub fn averages(&self) -> Option<PerPersona<f64>> {
        if self.evaluated_rounds == 0 {
            return None;
        }
        let n = self.evaluated_rounds as f64;
        Some(self.cumulative.map(|_, total| total / n))
    }

    pub fn overall_leader(&self) -> Option<Winner> {
        self.averages().map(|avg| Winner::from_averages(&avg))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub version: u32,
    pub session_id: u64,
    /// Total committed rounds across all sessions.
    pub round: u64,
    /// Index of the next stage to run; 0 means a session is about to start.
    pub stage_round: usize,
    /// Key of the most recently completed stage.
    pub stage_pointer: Option<String>,
    pub topic: String,
    pub topic_history: Vec<String>,
    pub free_stage_usage: PerPersona<u32>,
    pub scores: ScoreBoard,
    pub last_reply_at: Option<DateTime<Utc>>,
    /// Transcript tail of the last finished debate; seeds topic generation
    /// once the live transcript has been archived.
    pub previous_context: String,
}

impl Versioned for Session {
    const CURRENT_VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}

impl Default for Session {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            session_id: 1,
            round: 0,
            stage_round: 0,
            stage_pointer: None,
            topic: String::new(),
            topic_history: Vec::new(),
            free_stage_usage: PerPersona::default(),
            scores: ScoreBoard::default(),
            last_reply_at: None,
            previous_context: String::new(),
        }
    }
}

impl Session {
    pub fn load(path: &Path) -> Result<Self, PersistenceError> {
        Ok(persistence::load_versioned::<Self>(path)?.unwrap_or_default())
    }

    pub fn save(&self, path: &Path) -> Result<(), PersistenceError> {
        persistence::save_json(path, self)
    }

    pub fn is_session_start(&self) -> bool {
        self.stage_round == 0
    }

    pub fn is_topic_used(&self, topic: &str) -> bool {
        let topic = topic.trim();
        !topic.is_empty() && self.topic_history.iter().any(|t| t == topic)
    }

    /// Add `topic` to the history unless empty or already present.
    pub fn record_topic(&mut self, topic: &str) {
        let topic = topic.trim();
        if !topic.is_empty() && !self.is_topic_used(topic) {
            self.topic_history.push(topic.to_string());
        }
    }

    /// First unused fallback topic, or a numbered variant of the base topic.
    pub fn pick_fallback_topic(&self) -> String {
        if let Some(topic) = FALLBACK_TOPICS.iter().find(|t| !self.is_topic_used(t)) {
            return (*topic).to_string();
        }
        let mut candidate = FALLBACK_VARIANT_BASE.to_string();
        let mut index = 1;
        while self.is_topic_used(&candidate) {
            candidate = format!("{FALLBACK_VARIANT_BASE}（备选{index}）");
            index += 1;
        }
        candidate
    }

    /// The carried-over topic, if it is set and unused.
    pub fn reusable_topic(&self) -> Option<&str> {
        let topic = self.topic.trim();
        (!topic.is_empty() && !self.is_topic_used(topic)).then_some(topic)
    }

    /// Accept a persona's proposed topic only while the topic is still open.
    pub fn pick_topic(&self, current: &str, proposed: Option<&str>) -> String {
        let current = current.trim();
        match proposed.map(str::trim) {
            Some(p) if current.is_empty() && !p.is_empty() && !self.is_topic_used(p) => {
                p.to_string()
            }
            _ => current.to_string(),
        }
    }

    /// Reset per-session aggregates at the start of a session.
    pub fn begin_session(&mut self) {
        self.scores = ScoreBoard::default();
        self.free_stage_usage = PerPersona::default();
    }

    /// Close the finished session and prepare the next one. `context` is the
    /// finished transcript's tail.
    pub fn rollover(&mut self, context: String) {
        self.session_id += 1;
        self.previous_context = context;
        self.stage_round = 0;
        self.topic.clear();
        self.free_stage_usage = PerPersona::default();
        self.scores = ScoreBoard::default();
    }
}

/// Metadata for the stage the next round will run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageMeta {
    pub key: String,
    pub title: String,
    pub rule: String,
    pub length_guide: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JudgeSummary {
    pub evaluated_rounds: u64,
    pub current_evaluation: Option<RoundEvaluation>,
    pub cumulative: PerPersona<f64>,
    pub averages: Option<PerPersona<f64>>,
    pub overall_winner: Option<Winner>,
}

/// Snapshot written to `status.json` after every loop iteration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub updated_at: DateTime<Utc>,
    pub session_id: u64,
    pub round: u64,
    pub stage_round: usize,
    pub stage_total: usize,
    pub stage_pointer: Option<String>,
    pub stage: Option<StageMeta>,
    pub topic: String,
    pub topic_history: Vec<String>,
    pub free_stage_usage: PerPersona<u32>,
    pub last_reply_at: Option<DateTime<Utc>>,
    pub sleep_seconds: u64,
    pub last_error: Option<String>,
    /// Opaque token accounting supplied by the model client.
    pub token_stats: Option<serde_json::Value>,
    pub judge: JudgeSummary,
}

impl StatusReport {
    pub fn build(
        session: &Session,
        schedule: &StageSchedule,
        last_error: Option<String>,
        sleep_seconds: u64,
        token_stats: Option<serde_json::Value>,
    ) -> Self {
        let stage = schedule.get(session.stage_round).map(|s| StageMeta {
            key: s.key.clone(),
            title: s.title.clone(),
            rule: s.rule.clone(),
            length_guide: s.format_length_guides(),
        });
        let start = session
            .topic_history
            .len()
            .saturating_sub(STATUS_TOPIC_WINDOW);
        Self {
            updated_at: Utc::now(),
            session_id: session.session_id,
            round: session.round,
            stage_round: session.stage_round,
            stage_total: schedule.len(),
            stage_pointer: session.stage_pointer.clone(),
            stage,
            topic: session.topic.clone(),
            topic_history: session.topic_history[start..].to_vec(),
            free_stage_usage: session.free_stage_usage.clone(),
            last_reply_at: session.last_reply_at,
            sleep_seconds,
            last_error,
            token_stats,
            judge: JudgeSummary {
                evaluated_rounds: session.scores.evaluated_rounds,
                current_evaluation: session.scores.current_evaluation.clone(),
                cumulative: session.scores.cumulative.clone(),
                averages: session.scores.averages(),
                overall_winner: session.scores.overall_leader(),
            },
        }
    }
}
