//! The round orchestrator: runs one stage of the debate per call.
//!
//! A round has two phases. The *gather* phase performs every await (topic
//! generation, both persona turns, judge calls) against working copies of the
//! state. The *commit* phase is synchronous and writes transcript, policy,
//! dynamics and finally the session document, which acts as the commit
//! marker. Planning documents and session archival follow the marker. A
//! transport failure or a dropped future during gather leaves durable state
//! untouched, so the same round simply runs again on the next tick.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::collaborator::{Judge, JudgeRequest, ModelClient, ModelRequest};
use crate::conversation::{append_and_trim, round_separator, ConversationEntry, ConversationLog};
use crate::dynamics::{DynamicsConfig, DynamicsState, Observation};
use crate::error::{EngineError, RoundError};
use crate::evaluation::{FinalEvaluation, RoundEvaluation, Winner};
use crate::journal::Journal;
use crate::persistence::{self, PersistenceError};
use crate::persona::{PerPersona, Persona};
use crate::planning::PlanningDocs;
use crate::policy::{PolicyConfig, PolicyUpdate, TacticPolicy, TACTICS};
use crate::prompts::{
    build_persona_prompts, build_topic_prompt, max_tokens_for, parse_persona_reply, parse_topic,
    PersonaPromptInput, PersonaTurnResult, SpeakerPosition, PROMPT_VERSION,
};
use crate::schedule::{ScheduleConfig, Stage, StageSchedule};
use crate::session::{Session, StatusReport};
use crate::skills::SkillProfile;
use crate::text::{char_len, text_similarity};

pub const DEFAULT_CONTEXT_MAX_CHARS: usize = 6000;
pub const DEFAULT_EXPERIENCE_MAX_CHARS: usize = 5000;
pub const DEFAULT_DUPLICATE_SIMILARITY: f64 = 0.9;

const TOPIC_MAX_TOKENS: u32 = 256;

/// File locations of all durable state under one root directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateLayout {
    pub root: PathBuf,
}

impl StateLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn state_dir(&self) -> PathBuf {
        self.root.join("state")
    }

    pub fn session(&self) -> PathBuf {
        self.state_dir().join("session.json")
    }

    pub fn status(&self) -> PathBuf {
        self.state_dir().join("status.json")
    }

    pub fn dynamics(&self) -> PathBuf {
        self.state_dir().join("dynamics.json")
    }

    pub fn policy(&self) -> PathBuf {
        self.state_dir().join("rl").join("rl_policy.json")
    }

    pub fn policy_metrics(&self) -> PathBuf {
        self.state_dir().join("rl").join("rl_metrics.json")
    }

    pub fn policy_history(&self) -> PathBuf {
        self.state_dir().join("rl").join("rl_history.jsonl")
    }

    pub fn conversation(&self) -> PathBuf {
        self.state_dir().join("conversation.log")
    }

    pub fn plan(&self, persona: Persona) -> PathBuf {
        self.state_dir()
            .join(format!("plan_{}.md", persona.tag().to_lowercase()))
    }

    pub fn experience(&self) -> PathBuf {
        self.state_dir().join("experience.md")
    }

    pub fn last_turn(&self) -> PathBuf {
        self.state_dir().join("last_turn.json")
    }

    pub fn archives(&self) -> PathBuf {
        self.state_dir().join("archives")
    }

    pub fn token_stats(&self) -> PathBuf {
        self.state_dir().join("token_stats.json")
    }

    pub fn lock(&self) -> PathBuf {
        self.state_dir().join("agent.lock")
    }

    pub fn skills(&self) -> PathBuf {
        self.state_dir().join("skills.json")
    }

    pub fn journal_dir(&self) -> PathBuf {
        self.root.join("journal")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.root.join("logs")
    }
}

/// Engine tuning consumed by the orchestrator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub schedule: ScheduleConfig,
    /// Characters of transcript tail shown to the personas.
    pub context_max_chars: usize,
    /// Characters of experience log shown to the personas.
    pub experience_max_chars: usize,
    pub policy: PolicyConfig,
    pub dynamics: DynamicsConfig,
    pub skills: PerPersona<SkillProfile>,
    /// Bigram Jaccard similarity at which two replies count as duplicates.
    pub duplicate_similarity_threshold: f64,
    pub temperature: f32,
    /// Ask the judge for a whole-debate verdict after the closing stage.
    pub final_evaluation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            schedule: ScheduleConfig::default(),
            context_max_chars: DEFAULT_CONTEXT_MAX_CHARS,
            experience_max_chars: DEFAULT_EXPERIENCE_MAX_CHARS,
            policy: PolicyConfig::default(),
            dynamics: DynamicsConfig::default(),
            skills: PerPersona::default(),
            duplicate_similarity_threshold: DEFAULT_DUPLICATE_SIMILARITY,
            temperature: 0.4,
            final_evaluation: true,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.schedule.free_rounds == 0 {
            return Err(EngineError::Configuration(
                "free_rounds must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.duplicate_similarity_threshold) {
            return Err(EngineError::Configuration(format!(
                "duplicate_similarity_threshold {} outside [0, 1]",
                self.duplicate_similarity_threshold
            )));
        }
        let p = &self.policy;
        if p.action_count == 0 || p.min_prob < 0.0 || p.min_prob * TACTICS.len() as f64 > 1.0 {
            return Err(EngineError::Configuration(format!(
                "policy min_prob {} / action_count {} not satisfiable",
                p.min_prob, p.action_count
            )));
        }
        Ok(())
    }
}

/// How the session topic was chosen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TopicSource {
    Carried,
    Generated,
    Fallback,
}

impl std::fmt::Display for TopicSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Carried => write!(f, "carried"),
            Self::Generated => write!(f, "generated"),
            Self::Fallback => write!(f, "fallback"),
        }
    }
}

/// Snapshot of the last committed round, written to `last_turn.json`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LastTurn {
    pub at: DateTime<Utc>,
    pub round: u64,
    pub session_id: u64,
    pub stage_key: String,
    pub stage_title: String,
    pub topic: String,
    pub prompt_version: String,
    pub replies: PerPersona<Option<String>>,
    pub experience_notes: PerPersona<Vec<String>>,
    pub evaluation: Option<RoundEvaluation>,
    pub cumulative: PerPersona<f64>,
    pub averages: Option<PerPersona<f64>>,
}

/// Result of one committed round.
#[derive(Debug, Clone, PartialEq)]
pub struct RoundOutcome {
    pub round: u64,
    pub session_id: u64,
    pub stage_key: String,
    pub topic: String,
    /// Set on the first round of a session.
    pub topic_source: Option<TopicSource>,
    pub replies: PerPersona<Option<String>>,
    /// Personas that passed because their free-debate budget was spent.
    pub skipped: Vec<Persona>,
    pub evaluation: Option<RoundEvaluation>,
    pub replies_identical: bool,
    pub session_completed: bool,
    pub final_evaluation: Option<FinalEvaluation>,
}

/// Everything gathered before commit.
struct Gathered {
    round: u64,
    stage_index: usize,
    stage: Stage,
    session_start: bool,
    topic: String,
    topic_source: Option<TopicSource>,
    turns: PerPersona<Option<PersonaTurnResult>>,
    entries: Vec<ConversationEntry>,
    skipped: Vec<Persona>,
    evaluation: Option<RoundEvaluation>,
    final_evaluation: Option<FinalEvaluation>,
    replies_identical: bool,
    dynamics: DynamicsState,
    observations: Vec<Observation>,
    events: Vec<(&'static str, String)>,
}

pub struct RoundOrchestrator {
    config: EngineConfig,
    layout: StateLayout,
    schedule: StageSchedule,
    model: Arc<dyn ModelClient>,
    judge: Arc<dyn Judge>,
    rng: StdRng,
    session: Session,
    dynamics: DynamicsState,
    policy: TacticPolicy,
    conversation: ConversationLog,
    planning: PlanningDocs,
    journal: Journal,
}

impl RoundOrchestrator {
    /// Load persisted state under `layout`; absent files start fresh.
    pub fn open(
        config: EngineConfig,
        layout: StateLayout,
        model: Arc<dyn ModelClient>,
        judge: Arc<dyn Judge>,
    ) -> Result<Self, EngineError> {
        config.validate()?;
        let schedule = StageSchedule::build(&config.schedule);
        let mut session = Session::load(&layout.session())?;
        if session.stage_round >= schedule.len() {
            warn!(
                stage_round = session.stage_round,
                stages = schedule.len(),
                "Stored stage index beyond schedule; resuming at closing stage"
            );
            session.stage_round = schedule.closing_index();
        }
        let dynamics = persistence::load_json::<DynamicsState>(&layout.dynamics())?.unwrap_or_default();
        let policy = TacticPolicy::load(
            config.policy.clone(),
            &layout.policy(),
            &layout.policy_metrics(),
        )?;
        let conversation = ConversationLog::new(layout.conversation());
        let planning = PlanningDocs::new(
            PerPersona::from_fn(|p| layout.plan(p)),
            layout.experience(),
        );
        let journal = Journal::new(layout.journal_dir(), layout.log_dir());
        info!(
            session_id = session.session_id,
            round = session.round,
            stage_round = session.stage_round,
            stages = schedule.len(),
            "Opened debate state"
        );
        Ok(Self {
            config,
            layout,
            schedule,
            model,
            judge,
            rng: StdRng::from_os_rng(),
            session,
            dynamics,
            policy,
            conversation,
            planning,
            journal,
        })
    }

    /// Replace the random source, e.g. with a seeded one in tests.
    pub fn with_rng(mut self, rng: StdRng) -> Self {
        self.rng = rng;
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn layout(&self) -> &StateLayout {
        &self.layout
    }

    pub fn schedule(&self) -> &StageSchedule {
        &self.schedule
    }

    pub fn session(&self) -> &Session {
        &self.session
    }

    pub fn dynamics(&self) -> &DynamicsState {
        &self.dynamics
    }

    pub fn policy(&self) -> &TacticPolicy {
        &self.policy
    }

    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    /// Run the next stage and commit it.
    pub async fn run_round(&mut self) -> Result<RoundOutcome, RoundError> {
        let gathered = match self.gather().await {
            Ok(g) => g,
            Err(e) => {
                self.journal.system("round_retry", &e.to_string());
                return Err(e);
            }
        };
        self.commit(gathered)
    }

    async fn resolve_topic(&mut self, context: &str, round: u64) -> (String, TopicSource) {
        if let Some(topic) = self.session.reusable_topic() {
            return (topic.to_string(), TopicSource::Carried);
        }
        if !context.trim().is_empty() {
            let prompt = build_topic_prompt(
                round,
                &self.session.topic,
                &self.session.topic_history,
                context,
            );
            let request = ModelRequest {
                persona: None,
                system: prompt.system,
                user: prompt.user,
                max_tokens: TOPIC_MAX_TOKENS,
                temperature: self.config.temperature,
            };
            match self.model.complete(request).await {
                Ok(response) => match parse_topic(&response.content) {
                    Some(topic) if !self.session.is_topic_used(&topic) => {
                        return (topic, TopicSource::Generated);
                    }
                    Some(topic) => debug!(topic = %topic, "Generated topic already used"),
                    None => debug!("Topic generator returned no topic"),
                },
                Err(e) => warn!(error = %e, "Topic generation failed; using fallback list"),
            }
        }
        (self.session.pick_fallback_topic(), TopicSource::Fallback)
    }

    async fn gather(&mut self) -> Result<Gathered, RoundError> {
        let round = self.session.round + 1;
        let session_start = self.session.is_session_start();
        let usage = if session_start {
            PerPersona::default()
        } else {
            self.session.free_stage_usage.clone()
        };

        let mut stage_index = self.session.stage_round;
        let mut stage = self
            .schedule
            .get(stage_index)
            .cloned()
            .unwrap_or_else(|| self.schedule.stages()[self.schedule.closing_index()].clone());
        if stage.is_free_debate() && self.schedule.budget_exhausted(&usage) {
            stage_index = self.schedule.closing_index();
            stage = self.schedule.stages()[stage_index].clone();
            info!(round, "Free-debate budget spent; jumping to closing stage");
        }

        let context = self.conversation.tail(self.config.context_max_chars)?;
        let (topic, topic_source) = if session_start {
            let topic_context = if context.trim().is_empty() {
                self.session.previous_context.clone()
            } else {
                context.clone()
            };
            let (topic, source) = self.resolve_topic(&topic_context, round).await;
            info!(round, topic = %topic, source = %source, "Resolved session topic");
            (topic, Some(source))
        } else {
            (self.session.topic.clone(), None)
        };

        let last_evaluation = if session_start {
            None
        } else {
            self.session.scores.current_evaluation.clone()
        };
        let experience = self
            .planning
            .read_experience(self.config.experience_max_chars)?;

        let mut running_tail = context;
        let mut turns: PerPersona<Option<PersonaTurnResult>> = PerPersona::default();
        let mut entries = Vec::new();
        let mut skipped = Vec::new();
        let mut topic = topic;

        for (position, persona) in [SpeakerPosition::First, SpeakerPosition::Second]
            .into_iter()
            .zip(stage.speaker_order())
        {
            if stage.is_free_debate() && self.schedule.persona_exhausted(&usage, persona) {
                info!(round, persona = %persona, "Free-debate budget spent; persona passes");
                skipped.push(persona);
                continue;
            }
            let max_chars = self
                .schedule
                .effective_max_chars(&stage, persona, usage[persona]);
            let plan = self.planning.read_plan(persona)?;
            let policy_ctx = self.policy.prompt_context(
                round,
                persona,
                last_evaluation.as_ref().map(|e| &e.scores),
                &mut self.rng,
            );
            let prompts = build_persona_prompts(&PersonaPromptInput {
                persona,
                round,
                session_id: self.session.session_id,
                stage_number: stage_index + 1,
                stage_total: self.schedule.len(),
                stage: &stage,
                position,
                topic: &topic,
                max_chars,
                plan: &plan,
                experience: &experience,
                conversation: &running_tail,
                last_evaluation: last_evaluation.as_ref(),
                policy: self.policy.config().enabled.then_some(&policy_ctx),
            });
            let request = ModelRequest {
                persona: Some(persona),
                system: prompts.system,
                user: prompts.user,
                max_tokens: max_tokens_for(max_chars),
                temperature: self.config.temperature,
            };
            let response = self
                .model
                .complete(request)
                .await
                .map_err(|source| RoundError::Transport { persona, source })?;

            let turn = parse_persona_reply(persona, &response.content, max_chars);
            if let Some(reason) = &turn.parse_failure {
                warn!(round, persona = %persona, reason = %reason, "Persona output unusable; placeholder reply");
            }
            topic = self.session.pick_topic(&topic, turn.proposed_topic.as_deref());
            let entry = ConversationEntry::new(
                persona,
                round,
                &topic,
                Some(&stage.title),
                &turn.reply,
                Utc::now(),
            );
            running_tail = append_and_trim(&running_tail, &entry.render(), self.config.context_max_chars);
            entries.push(entry);
            turns[persona] = Some(turn);
        }

        let mut events: Vec<(&'static str, String)> = turns
            .iter()
            .filter_map(|(p, t)| t.as_ref().and_then(|t| t.parse_failure.as_ref().map(|r| (p, r))))
            .map(|(p, reason)| ("reply_parse_failed", format!("{p}: {reason}")))
            .collect();

        let replies: PerPersona<String> =
            turns.map(|_, t| t.as_ref().map(|t| t.reply.clone()).unwrap_or_default());
        let replies_identical = turns.p1.is_some()
            && turns.p2.is_some()
            && (replies.p1.trim() == replies.p2.trim()
                || text_similarity(&replies.p1, &replies.p2)
                    >= self.config.duplicate_similarity_threshold);
        if replies_identical {
            warn!(round, "Persona replies are duplicates");
            events.push(("duplicate_reply", format!("round {round}")));
        }

        let evaluation = match self
            .judge
            .evaluate_round(JudgeRequest {
                round,
                topic: topic.clone(),
                stage_key: stage.key.clone(),
                stage_title: stage.title.clone(),
                stage_rule: stage.rule.clone(),
                replies: replies.clone(),
            })
            .await
        {
            Ok(eval) => Some(eval),
            Err(e) => {
                warn!(round, error = %e, "Judge unavailable; round proceeds unscored");
                events.push(("judge_unavailable", e.to_string()));
                None
            }
        };

        let mut dynamics = if session_start {
            let mut fresh = self.dynamics.clone();
            fresh.reset();
            fresh
        } else {
            self.dynamics.clone()
        };
        // Both replies are classified against last round's state before
        // either is applied.
        let mut observations = Vec::new();
        for persona in stage.speaker_order() {
            let Some(turn) = &turns[persona] else {
                continue;
            };
            let obs = dynamics.observe(
                persona,
                &turn.reply,
                &self.config.skills[persona],
                &self.config.dynamics,
            );
            debug!(
                round,
                persona = %persona,
                action = %obs.action,
                transition = %obs.signal.transition,
                "Classified reply"
            );
            observations.push(obs);
        }
        for obs in &observations {
            if let Some(turn) = &turns[obs.persona] {
                dynamics.apply(obs, &turn.reply);
            }
        }

        let final_evaluation = if stage.is_closing() && self.config.final_evaluation {
            let mut transcript = self.conversation.read_all()?;
            transcript.push_str(&round_separator(round, &topic));
            for entry in &entries {
                transcript.push_str(&entry.render());
            }
            match self.judge.evaluate_debate(&topic, &transcript).await {
                Ok(verdict) => Some(verdict),
                Err(e) => {
                    warn!(round, error = %e, "Final evaluation unavailable");
                    events.push(("final_evaluation_unavailable", e.to_string()));
                    None
                }
            }
        } else {
            None
        };

        Ok(Gathered {
            round,
            stage_index,
            stage,
            session_start,
            topic,
            topic_source,
            turns,
            entries,
            skipped,
            evaluation,
            final_evaluation,
            replies_identical,
            dynamics,
            observations,
            events,
        })
    }

    fn commit(&mut self, g: Gathered) -> Result<RoundOutcome, RoundError> {
        let now = Utc::now();
        let mut session = self.session.clone();
        let mut policy = self.policy.clone();

        // Transcript and journal.
        self.conversation
            .append_raw(&round_separator(g.round, &g.topic))?;
        for entry in &g.entries {
            self.conversation.append(entry)?;
        }
        self.journal.round_start(g.round, &g.topic, &g.stage.title);
        if let Some(source) = g.topic_source {
            self.journal
                .topic_change(&self.session.topic, &g.topic, &source.to_string());
        }
        for entry in &g.entries {
            self.journal
                .message(entry.persona, g.round, &entry.topic, &entry.body);
        }
        for (event, detail) in &g.events {
            self.journal.system(event, detail);
        }
        if let Some(eval) = &g.evaluation {
            self.journal.round_evaluation(g.round, eval);
        }

        // Policy.
        if let Some(eval) = &g.evaluation {
            let signals = PerPersona::from_fn(|p| {
                g.observations
                    .iter()
                    .find(|o| o.persona == p)
                    .map_or(0.0, |o| o.signal.net())
            });
            let update = PolicyUpdate {
                round: g.round,
                evaluation: eval,
                replies_identical: g.replies_identical,
                dynamics_signals: signals,
            };
            if let Some(outcome) = policy.update(&update) {
                let entry = policy.history_entry(
                    &update,
                    &outcome,
                    session.session_id,
                    &g.topic,
                    &g.stage.key,
                );
                persistence::append_jsonl(&self.layout.policy_history(), &entry)?;
            }
        }

        // Session.
        if g.session_start {
            session.begin_session();
            session.record_topic(&g.topic);
        }
        session.round = g.round;
        session.topic = g.topic.clone();
        session.stage_pointer = Some(g.stage.key.clone());
        session.last_reply_at = Some(now);
        if g.stage.is_free_debate() {
            for persona in Persona::ALL {
                if let Some(turn) = &g.turns[persona] {
                    session.free_stage_usage[persona] += char_len(&turn.reply) as u32;
                }
            }
        }
        if let Some(eval) = &g.evaluation {
            session.scores.record(eval);
        }
        session.stage_round = g.stage_index + 1;
        if let Some(next) = self.schedule.get(session.stage_round) {
            if next.is_free_debate() && self.schedule.budget_exhausted(&session.free_stage_usage) {
                session.stage_round = self.schedule.closing_index();
            }
        }

        let replies = g.turns.map(|_, t| t.as_ref().map(|t| t.reply.clone()));
        let notes = g
            .turns
            .map(|_, t| t.as_ref().map(|t| t.experience_notes.clone()).unwrap_or_default());
        let last_turn = LastTurn {
            at: now,
            round: g.round,
            session_id: session.session_id,
            stage_key: g.stage.key.clone(),
            stage_title: g.stage.title.clone(),
            topic: g.topic.clone(),
            prompt_version: PROMPT_VERSION.to_string(),
            replies: replies.clone(),
            experience_notes: notes.clone(),
            evaluation: g.evaluation.clone(),
            cumulative: session.scores.cumulative.clone(),
            averages: session.scores.averages(),
        };

        let session_completed = g.stage.is_closing();
        let finished_session_id = session.session_id;
        let mut finished = None;
        if session_completed {
            if let Some(verdict) = &g.final_evaluation {
                self.journal
                    .final_evaluation(finished_session_id, &g.topic, verdict);
            }
            let summary = experience_summary(&session, &policy);
            let winner = g
                .final_evaluation
                .as_ref()
                .map(|v| v.winner)
                .or_else(|| session.scores.overall_leader());
            let carried = self.conversation.tail(self.config.context_max_chars)?;
            session.rollover(carried);
            finished = Some((summary, winner));
        }

        // Persist; the session document goes last.
        policy.save(&self.layout.policy(), &self.layout.policy_metrics())?;
        persistence::save_json(&self.layout.dynamics(), &g.dynamics)?;
        persistence::save_json(&self.layout.last_turn(), &last_turn)?;
        session.save(&self.layout.session())?;

        self.session = session;
        self.policy = policy;
        self.dynamics = g.dynamics;

        // Committed. Document upkeep below runs at most once per round and
        // cannot make it rerun.
        for persona in Persona::ALL {
            let Some(turn) = &g.turns[persona] else {
                continue;
            };
            match self.planning.apply(persona, &turn.plan_ops, now) {
                Ok(applied) => self.journal.plan_update(persona, &applied),
                Err(e) => warn!(persona = %persona, error = %e, "Failed to update plan"),
            }
        }
        if let Some((summary, winner)) = finished {
            self.close_session(finished_session_id, &g.topic, &notes, &summary, now);
            self.journal.system(
                "debate_end",
                &format!(
                    "Debate {finished_session_id} completed. Winner: {}",
                    winner.map_or_else(|| "unknown".to_string(), |w| w.to_string())
                ),
            );
        }

        info!(
            round = g.round,
            session_id = finished_session_id,
            stage = %g.stage.key,
            scored = g.evaluation.is_some(),
            completed = session_completed,
            "Round committed"
        );

        Ok(RoundOutcome {
            round: g.round,
            session_id: finished_session_id,
            stage_key: g.stage.key,
            topic: g.topic,
            topic_source: g.topic_source,
            replies,
            skipped: g.skipped,
            evaluation: g.evaluation,
            replies_identical: g.replies_identical,
            session_completed,
            final_evaluation: g.final_evaluation,
        })
    }

    /// Archive the transcript, clear the plans and log the session's lessons.
    fn close_session(
        &self,
        session_id: u64,
        topic: &str,
        notes: &PerPersona<Vec<String>>,
        summary: &[String],
        at: DateTime<Utc>,
    ) {
        if let Err(e) = self
            .conversation
            .archive(&self.layout.archives(), session_id, topic, at)
        {
            warn!(session_id, error = %e, "Failed to archive transcript");
        }
        if let Err(e) = self.planning.reset() {
            warn!(session_id, error = %e, "Failed to reset planning documents");
        }
        if let Err(e) = self
            .planning
            .append_experience(session_id, topic, notes, summary, at)
        {
            warn!(session_id, error = %e, "Failed to append experience log");
        }
    }

    /// Write `status.json` for dashboards and the `status` command.
    pub fn write_status(
        &self,
        last_error: Option<String>,
        sleep_seconds: u64,
        token_stats: Option<serde_json::Value>,
    ) -> Result<(), PersistenceError> {
        let report = StatusReport::build(
            &self.session,
            &self.schedule,
            last_error,
            sleep_seconds,
            token_stats,
        );
        persistence::save_json(&self.layout.status(), &report)
    }

    /// Record an error that happened outside `run_round`.
    pub fn record_error(&self, kind: &str, detail: &str) {
        self.journal.system(kind, detail);
    }
}

/// Score and strategy lines appended to the experience log at rollover.
fn experience_summary(session: &Session, policy: &TacticPolicy) -> Vec<String> {
    let mut lines = Vec::new();
    if let Some(avg) = session.scores.averages() {
        let verdict = match Winner::from_averages(&avg) {
            Winner::P1 => "正方领先",
            Winner::P2 => "反方领先",
            Winner::Tie => "势均力敌",
        };
        lines.push(format!("评估轮数: {}", session.scores.evaluated_rounds));
        lines.push(format!("正方平均分: {:.2}/10", avg[Persona::P1]));
        lines.push(format!("反方平均分: {:.2}/10", avg[Persona::P2]));
        lines.push(format!(
            "累计总分: 正方 {:.2} | 反方 {:.2}",
            session.scores.cumulative[Persona::P1],
            session.scores.cumulative[Persona::P2]
        ));
        lines.push(format!("表现评估: {verdict}"));
    }
    if policy.config().enabled {
        lines.extend(Persona::ALL.iter().map(|p| policy.strategy_summary(*p)));
    }
    lines
}

/// Load the persisted status report, if any.
pub fn read_status(layout: &StateLayout) -> Result<Option<StatusReport>, PersistenceError> {
    persistence::load_json(&layout.status())
}
