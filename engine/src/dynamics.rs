//! Interaction classifier: rhetorical actions, conversational state machine
//! and reward shaping.
//!
//! All rules are deterministic keyword/pattern heuristics. The "question" for
//! a persona is the opponent's previous reply; the "reply" is the persona's own
//! reply this round.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::persona::{PerPersona, Persona};
use crate::skills::{clamp_skill, SkillProfile};
use crate::text::{char_len, count_hits, ends_with_question, extract_keywords, has_question_mark};

/// Pressure-awareness at or above which an interrogative question registers.
pub const PRESSURE_AWARENESS_THRESHOLD: f64 = 0.45;
/// Recovery above which a pressured persona can turn the exchange around.
pub const RECOVERY_THRESHOLD: f64 = 0.55;
/// Default commitment at or above which collapse language is resisted.
pub const DEFAULT_COLLAPSE_RESIST: f64 = 0.85;

const QUESTION_KEYWORDS: usize = 6;
/// Replies longer than this that share no keyword with the question read as deflection.
const OFF_TOPIC_ACTION_CHARS: usize = 120;
const OFF_TOPIC_STATE_CHARS: usize = 80;

/// Discrete rhetorical action detected in a reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Action {
    AttackClaim,
    AttackEvidence,
    ForceClarification,
    Deflect,
    ConcedePartial,
    Reframe,
    CounterQuestion,
    SummarizePressure,
    IntroduceNewClaim,
}

impl Action {
    pub const ALL: [Action; 9] = [
        Self::AttackClaim,
        Self::AttackEvidence,
        Self::ForceClarification,
        Self::Deflect,
        Self::ConcedePartial,
        Self::Reframe,
        Self::CounterQuestion,
        Self::SummarizePressure,
        Self::IntroduceNewClaim,
    ];
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AttackClaim => write!(f, "attack_claim"),
            Self::AttackEvidence => write!(f, "attack_evidence"),
            Self::ForceClarification => write!(f, "force_clarification"),
            Self::Deflect => write!(f, "deflect"),
            Self::ConcedePartial => write!(f, "concede_partial"),
            Self::Reframe => write!(f, "reframe"),
            Self::CounterQuestion => write!(f, "counter_question"),
            Self::SummarizePressure => write!(f, "summarize_pressure"),
            Self::IntroduceNewClaim => write!(f, "introduce_new_claim"),
        }
    }
}

/// How "under pressure" a persona currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ConversationalState {
    #[default]
    Neutral,
    Pressure,
    Defense,
    Advantage,
    Collapse,
}

impl ConversationalState {
    /// States reachable in one classifier step.
    pub fn valid_transitions(self) -> &'static [ConversationalState] {
        use ConversationalState::*;
        match self {
            Neutral => &[Neutral, Pressure, Defense, Advantage],
            Pressure => &[Pressure, Defense, Advantage, Collapse],
            Defense => &[Defense, Pressure, Advantage, Collapse],
            Advantage => &[Advantage, Pressure, Defense],
            Collapse => &[Collapse, Pressure, Defense, Advantage],
        }
    }

    pub fn can_transition_to(self, next: ConversationalState) -> bool {
        self.valid_transitions().contains(&next)
    }

    /// States from which collapse language actually collapses the persona.
    fn is_defense_adjacent(self) -> bool {
        matches!(self, Self::Pressure | Self::Defense | Self::Collapse)
    }
}

impl std::fmt::Display for ConversationalState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Neutral => write!(f, "neutral"),
            Self::Pressure => write!(f, "pressure"),
            Self::Defense => write!(f, "defense"),
            Self::Advantage => write!(f, "advantage"),
            Self::Collapse => write!(f, "collapse"),
        }
    }
}

fn words(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// Keyword lists driving the classifier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct KeywordSets {
    pub pressure: Vec<String>,
    pub defense: Vec<String>,
    pub deflect: Vec<String>,
    pub reframe: Vec<String>,
    pub concession: Vec<String>,
    pub contradiction: Vec<String>,
    pub advantage: Vec<String>,
    /// Phrases admitting the persona cannot answer.
    pub inability: Vec<String>,
    pub evidence: Vec<String>,
    pub claim: Vec<String>,
}

impl Default for KeywordSets {
    fn default() -> Self {
        Self {
            pressure: words(&[
                "是否", "是不是", "请回答", "能否", "定义", "来源", "条件", "必须", "请说明", "请解释",
            ]),
            defense: words(&["不能一概而论", "复杂", "不一定", "视情况", "综合来看", "因地制宜", "不好说"]),
            deflect: words(&["另一方面", "需要更广泛", "话题本身", "更重要的是", "让我们回到"]),
            reframe: words(&["换个角度", "从另一个角度", "重新定义", "问题的关键在于", "讨论的核心是"]),
            concession: words(&["我承认", "确实有", "部分同意", "我们同意"]),
            contradiction: words(&["但是我之前说", "这与我刚才", "自相矛盾", "前后不一致"]),
            advantage: words(&["你没有回答", "你回避了", "你没有解释", "你的前提错误"]),
            inability: words(&["无法回答", "不知道"]),
            evidence: words(&["数据", "证据", "案例", "统计"]),
            claim: words(&["我方认为", "核心论点", "主张", "定义"]),
        }
    }
}

/// Classifier configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicsConfig {
    pub keywords: KeywordSets,
    /// Commitment at or above which collapse language is shrugged off.
    pub collapse_resist: f64,
}

impl Default for DynamicsConfig {
    fn default() -> Self {
        Self {
            keywords: KeywordSets::default(),
            collapse_resist: DEFAULT_COLLAPSE_RESIST,
        }
    }
}

/// Pick the rhetorical action of `reply` given the `question` it answers.
pub fn classify_action(question: &str, reply: &str, keywords: &KeywordSets) -> Action {
    let question_words = extract_keywords(question, QUESTION_KEYWORDS);

    if count_hits(reply, &keywords.concession) > 0 {
        return Action::ConcedePartial;
    }
    if count_hits(reply, &keywords.defense) > 0 {
        return Action::Deflect;
    }
    if count_hits(reply, &keywords.reframe) > 0 {
        return Action::Reframe;
    }
    if count_hits(reply, &keywords.advantage) > 0 {
        return Action::SummarizePressure;
    }
    if has_question_mark(reply) && count_hits(reply, &keywords.pressure) > 0 {
        return Action::ForceClarification;
    }
    if count_hits(reply, &keywords.contradiction) > 0 {
        return Action::Deflect;
    }
    if !question.is_empty()
        && count_hits(reply, &question_words) == 0
        && char_len(reply) > OFF_TOPIC_ACTION_CHARS
    {
        return Action::Deflect;
    }
    if !question.is_empty() && has_question_mark(reply) {
        return Action::CounterQuestion;
    }
    if count_hits(reply, &keywords.evidence) > 0 {
        return Action::AttackEvidence;
    }
    if count_hits(reply, &keywords.claim) > 0 {
        return Action::IntroduceNewClaim;
    }
    Action::AttackClaim
}

fn detect_pressure(question: &str, keywords: &KeywordSets) -> bool {
    if question.trim().is_empty() {
        return false;
    }
    ends_with_question(question) || count_hits(question, &keywords.pressure) > 0
}

fn detect_deflect(question: &str, reply: &str, keywords: &KeywordSets) -> bool {
    if question.is_empty() || reply.is_empty() {
        return false;
    }
    let question_words = extract_keywords(question, QUESTION_KEYWORDS);
    let off_topic = question_words.len() >= 2
        && count_hits(reply, &question_words) == 0
        && char_len(reply) > OFF_TOPIC_STATE_CHARS;
    off_topic || count_hits(reply, &keywords.deflect) > 0
}

fn detect_collapse(reply: &str, keywords: &KeywordSets) -> bool {
    count_hits(reply, &keywords.contradiction) > 0 || count_hits(reply, &keywords.inability) > 0
}

/// Next conversational state after `reply` answers `question`.
///
/// Collapse needs both collapse language and insufficient commitment, and is
/// only entered from a defense-adjacent state; elsewhere the same signal
/// lands in `Defense`.
pub fn next_state(
    prev: ConversationalState,
    question: &str,
    reply: &str,
    skills: &SkillProfile,
    config: &DynamicsConfig,
) -> ConversationalState {
    let keywords = &config.keywords;
    let pressure_awareness = clamp_skill(skills.pressure_awareness);
    let commitment = clamp_skill(skills.commitment);
    let recovery = clamp_skill(skills.recovery);

    let pressured = detect_pressure(question, keywords);
    let deflect = detect_deflect(question, reply, keywords);
    let hedging = count_hits(reply, &keywords.defense) > 0;
    let advantage = count_hits(reply, &keywords.advantage) > 0;
    let collapse = detect_collapse(reply, keywords);

    if collapse && commitment < config.collapse_resist {
        return if prev.is_defense_adjacent() {
            ConversationalState::Collapse
        } else {
            ConversationalState::Defense
        };
    }

    if advantage {
        return ConversationalState::Advantage;
    }

    if pressured && pressure_awareness >= PRESSURE_AWARENESS_THRESHOLD {
        if deflect || hedging {
            return ConversationalState::Defense;
        }
        if recovery > RECOVERY_THRESHOLD {
            return ConversationalState::Advantage;
        }
        return ConversationalState::Pressure;
    }

    if deflect || hedging {
        return ConversationalState::Defense;
    }
    prev
}

/// Reward shaping for one classifier step.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RewardSignal {
    /// `"<prev>-><next>"`, e.g. `"Pressure->Defense"`.
    pub transition: String,
    pub reward: f64,
    pub penalty: f64,
    pub deflect_penalty: f64,
    pub pressure_penalty: f64,
    pub collapse_penalty: f64,
}

impl RewardSignal {
    /// Reward minus penalties.
    pub fn net(&self) -> f64 {
        self.reward - self.penalty
    }
}

pub fn reward_signal(
    prev: ConversationalState,
    next: ConversationalState,
    action: Action,
    skills: &SkillProfile,
) -> RewardSignal {
    use ConversationalState::*;

    let aggression = clamp_skill(skills.aggression);
    let commitment = clamp_skill(skills.commitment);
    let recovery = clamp_skill(skills.recovery);

    let mut signal = RewardSignal {
        transition: format!("{prev:?}->{next:?}"),
        ..RewardSignal::default()
    };

    match (prev, next) {
        (Neutral, Advantage) => signal.reward += 1.0 + aggression * 0.2,
        (Pressure, Advantage) => signal.reward += 1.5 + recovery * 0.3,
        (Pressure, Defense) => signal.pressure_penalty = 0.6 + commitment * 0.4,
        (Defense, Collapse) => signal.collapse_penalty = 2.2 + commitment * 0.4,
        _ => {}
    }
    if action == Action::Deflect {
        signal.deflect_penalty = 0.8 + commitment * 0.4;
    }
    signal.penalty = signal.pressure_penalty + signal.collapse_penalty + signal.deflect_penalty;
    signal
}

/// Outcome of classifying one persona's reply.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub persona: Persona,
    pub prev: ConversationalState,
    pub next: ConversationalState,
    pub action: Action,
    pub signal: RewardSignal,
}

/// Per-persona classifier state.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaDynamics {
    pub state: ConversationalState,
    pub last_action: Option<Action>,
    pub last_reward_signal: f64,
    pub last_transition: Option<String>,
    /// Most recent reply; the opponent's "question" next round.
    pub last_reply: String,
}

/// Persisted classifier state for both personas.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DynamicsState {
    pub personas: PerPersona<PersonaDynamics>,
    pub updated_at: DateTime<Utc>,
}

impl Default for DynamicsState {
    fn default() -> Self {
        Self {
            personas: PerPersona::default(),
            updated_at: Utc::now(),
        }
    }
}

impl DynamicsState {
    /// Back to `Neutral` with no remembered replies (session start).
    pub fn reset(&mut self) {
        self.personas = PerPersona::default();
        self.updated_at = Utc::now();
    }

    /// Classify `reply` from `persona` against the opponent's previous reply.
    ///
    /// Pure with respect to `self`; apply the result with [`Self::apply`].
    pub fn observe(
        &self,
        persona: Persona,
        reply: &str,
        skills: &SkillProfile,
        config: &DynamicsConfig,
    ) -> Observation {
        let question = self.personas[persona.opponent()].last_reply.as_str();
        let prev = self.personas[persona].state;
        let action = classify_action(question, reply, &config.keywords);
        let next = next_state(prev, question, reply, skills, config);
        let signal = reward_signal(prev, next, action, skills);
        Observation {
            persona,
            prev,
            next,
            action,
            signal,
        }
    }

    /// Record an observation and remember `reply` for the next round.
    pub fn apply(&mut self, observation: &Observation, reply: &str) {
        let entry = &mut self.personas[observation.persona];
        entry.state = observation.next;
        entry.last_action = Some(observation.action);
        entry.last_reward_signal = observation.signal.net();
        entry.last_transition = Some(observation.signal.transition.clone());
        entry.last_reply = reply.to_string();
        self.updated_at = Utc::now();
    }
}
