//! Tactic policy: a per-persona categorical distribution over argumentative
//! tactics plus focus weights over the judge's scoring dimensions, trained by
//! a baseline-subtracted reward after each judged round.
//!
//! Invariants after every mutation:
//! - `Σ tactic_probs == 1` and every probability `>= min_prob`;
//! - every focus weight lies in `focus_bounds`;
//! - an update for a round `<= last_updated_round` is a no-op.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::evaluation::{Dimension, DimensionScores, RoundEvaluation};
use crate::persistence::{self, PersistenceError, Versioned};
use crate::persona::{PerPersona, Persona};

/// A named argumentative technique.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tactic {
    pub key: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

pub const TACTICS: [Tactic; 13] = [
    Tactic { key: "data_anchor", label: "数据锚定", description: "引用权威数据并说明统计口径" },
    Tactic { key: "causal_chain", label: "因果链条", description: "建立因果机制并说明边界条件" },
    Tactic { key: "counter_example", label: "反例对照", description: "用反例削弱对方过度泛化" },
    Tactic { key: "assumption_audit", label: "前提审计", description: "识别对方隐含前提并进行质疑" },
    Tactic { key: "definition_lock", label: "定义锁定", description: "澄清关键词定义，避免偷换概念" },
    Tactic { key: "cross_examine", label: "交叉质询", description: "指出对方证据/逻辑漏洞并追问" },
    Tactic { key: "cost_benefit", label: "成本收益", description: "量化成本、收益与风险权衡" },
    Tactic { key: "case_pivot", label: "案例对照", description: "用对比案例提升说服力" },
    Tactic { key: "mechanism_test", label: "机制检验", description: "要求对方给出可验证机制或可操作路径" },
    Tactic { key: "framework_reframe", label: "框架重述", description: "重构问题框架，强调己方价值" },
    Tactic { key: "priority_tradeoff", label: "价值权衡", description: "承认代价并给出权衡路径" },
    Tactic { key: "steelman_refute", label: "先强后破", description: "先概括对方最强论点再精准反驳" },
    Tactic { key: "synthesis", label: "综合归纳", description: "总结要点并回扣核心主张" },
];

pub fn tactic(key: &str) -> Option<&'static Tactic> {
    TACTICS.iter().find(|t| t.key == key)
}

/// Keywords in judge suggestions that boost a dimension's focus weight.
pub fn suggestion_keywords(dim: Dimension) -> &'static [&'static str] {
    match dim {
        Dimension::Logic => &["逻辑", "论证", "严密", "链条", "因果"],
        Dimension::Evidence => &["证据", "数据", "案例", "事实", "来源"],
        Dimension::Responsiveness => &["回应", "反驳", "质疑", "针对", "漏洞"],
        Dimension::Expression => &["表达", "语言", "感染力", "节奏", "清晰"],
        Dimension::RuleCompliance => &["规则", "遵守", "越权", "抢答"],
    }
}

/// Weights of the three reward components.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RewardWeights {
    /// Absolute quality `(avg - 5) / 5`.
    pub quality: f64,
    /// Margin over the opponent `(avg - opp) / 10`.
    pub margin: f64,
    /// Rule compliance `(rule - 5) / 5`.
    pub rule: f64,
}

impl Default for RewardWeights {
    fn default() -> Self {
        Self {
            quality: 0.6,
            margin: 0.3,
            rule: 0.1,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min: f64,
    pub max: f64,
}

impl Bounds {
    pub fn clamp(&self, value: f64) -> f64 {
        value.clamp(self.min, self.max)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyConfig {
    pub enabled: bool,
    pub learning_rate: f64,
    pub focus_learning_rate: f64,
    pub baseline_alpha: f64,
    pub min_prob: f64,
    pub exploration: f64,
    pub action_count: usize,
    pub duplicate_penalty: f64,
    pub reward_weights: RewardWeights,
    pub reward_bounds: Bounds,
    pub focus_bounds: Bounds,
    /// Scale applied to the classifier's reward signal.
    pub dynamics_weight: f64,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            learning_rate: 0.12,
            focus_learning_rate: 0.08,
            baseline_alpha: 0.1,
            min_prob: 0.03,
            exploration: 0.1,
            action_count: 2,
            duplicate_penalty: 0.15,
            reward_weights: RewardWeights::default(),
            reward_bounds: Bounds { min: -1.0, max: 1.0 },
            focus_bounds: Bounds { min: 0.6, max: 1.8 },
            dynamics_weight: 0.05,
        }
    }
}

/// Learner state for one persona.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaPolicy {
    pub tactic_probs: BTreeMap<String, f64>,
    pub focus: BTreeMap<String, f64>,
    /// EMA baseline of the reward.
    pub baseline: f64,
    pub avg_reward: f64,
    pub last_reward: f64,
    pub last_advantage: f64,
    pub step: u64,
    pub last_actions: Vec<String>,
    pub last_update: Option<DateTime<Utc>>,
}

impl Default for PersonaPolicy {
    fn default() -> Self {
        let uniform = 1.0 / TACTICS.len() as f64;
        Self {
            tactic_probs: TACTICS.iter().map(|t| (t.key.to_string(), uniform)).collect(),
            focus: Dimension::ALL.iter().map(|d| (d.key().to_string(), 1.0)).collect(),
            baseline: 0.0,
            avg_reward: 0.0,
            last_reward: 0.0,
            last_advantage: 0.0,
            step: 0,
            last_actions: Vec::new(),
            last_update: None,
        }
    }
}

impl PersonaPolicy {
    pub fn focus_weight(&self, dim: Dimension) -> f64 {
        self.focus.get(dim.key()).copied().unwrap_or(1.0)
    }

    /// Add missing catalog tactics/dimensions and drop unknown ones, then
    /// restore the probability invariant.
    fn reconcile(&mut self, config: &PolicyConfig) {
        self.tactic_probs.retain(|k, _| tactic(k).is_some());
        for t in &TACTICS {
            self.tactic_probs.entry(t.key.to_string()).or_insert(config.min_prob);
        }
        for dim in Dimension::ALL {
            let w = self.focus.entry(dim.key().to_string()).or_insert(1.0);
            *w = config.focus_bounds.clamp(if w.is_finite() { *w } else { 1.0 });
        }
        self.focus.retain(|k, _| Dimension::from_key(k).is_some());
        normalize_with_floor(&mut self.tactic_probs, config.min_prob);
    }
}

/// Catalog entry stored alongside the state for readability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TacticInfo {
    pub key: String,
    pub label: String,
    pub description: String,
}

/// The persisted policy document (`rl/rl_policy.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyDocument {
    pub version: u32,
    pub updated_at: DateTime<Utc>,
    pub last_updated_round: Option<u64>,
    pub tactics: Vec<TacticInfo>,
    pub agents: PerPersona<PersonaPolicy>,
}

impl Versioned for PolicyDocument {
    const CURRENT_VERSION: u32 = 1;

    fn version(&self) -> u32 {
        self.version
    }
}

impl Default for PolicyDocument {
    fn default() -> Self {
        Self {
            version: Self::CURRENT_VERSION,
            updated_at: Utc::now(),
            last_updated_round: None,
            tactics: TACTICS
                .iter()
                .map(|t| TacticInfo {
                    key: t.key.into(),
                    label: t.label.into(),
                    description: t.description.into(),
                })
                .collect(),
            agents: PerPersona::default(),
        }
    }
}

/// Smoothed training metrics (`rl/rl_metrics.json`).
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PersonaMetrics {
    pub steps: u64,
    pub avg_reward: f64,
    pub avg_score: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyMetrics {
    pub updated_at: DateTime<Utc>,
    pub agents: PerPersona<PersonaMetrics>,
}

impl Default for PolicyMetrics {
    fn default() -> Self {
        Self {
            updated_at: Utc::now(),
            agents: PerPersona::default(),
        }
    }
}

/// One line of `rl/rl_history.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyHistoryEntry {
    pub ts: DateTime<Utc>,
    pub round: u64,
    pub session_id: u64,
    pub topic: String,
    pub stage_key: String,
    pub averages: PerPersona<f64>,
    pub duplicate_reply: bool,
    pub actions: PerPersona<Vec<String>>,
    pub rewards: PerPersona<f64>,
    pub advantages: PerPersona<f64>,
}

/// Per-round inputs to [`TacticPolicy::update`].
#[derive(Debug, Clone)]
pub struct PolicyUpdate<'a> {
    pub round: u64,
    pub evaluation: &'a RoundEvaluation,
    pub replies_identical: bool,
    /// Net classifier reward signal per persona.
    pub dynamics_signals: PerPersona<f64>,
}

/// What an update did, for journaling.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateOutcome {
    pub rewards: PerPersona<f64>,
    pub advantages: PerPersona<f64>,
    pub actions: PerPersona<Vec<String>>,
}

/// Prompt-injection summary of the current policy for one persona.
#[derive(Debug, Clone, PartialEq)]
pub struct PromptContext {
    pub tactics: Vec<&'static Tactic>,
    /// Top three dimensions by focus weight, rounded to two decimals.
    pub focus: Vec<(Dimension, f64)>,
    pub opponent_weaknesses: Vec<String>,
}

/// Unpenalized reward from averages and rule-compliance score.
pub fn score_to_reward(weights: &RewardWeights, avg: f64, opp_avg: f64, rule_score: f64) -> f64 {
    weights.quality * (avg - 5.0) / 5.0
        + weights.margin * (avg - opp_avg) / 10.0
        + weights.rule * (rule_score - 5.0) / 5.0
}

/// Renormalize to `Σ = 1` with every value `>= floor`.
///
/// Values pinned at the floor are fixed and the remaining mass is rescaled
/// over the rest; repeated until no free value drops below the floor. Falls
/// back to uniform when the floor cannot be honoured or the mass is empty.
pub fn normalize_with_floor(probs: &mut BTreeMap<String, f64>, floor: f64) {
    let n = probs.len();
    if n == 0 {
        return;
    }
    let uniform = 1.0 / n as f64;
    if floor * n as f64 >= 1.0 {
        probs.values_mut().for_each(|p| *p = uniform);
        return;
    }
    for p in probs.values_mut() {
        if !p.is_finite() || *p < floor {
            *p = floor;
        }
    }

    let mut pinned: Vec<bool> = vec![false; n];
    loop {
        let pinned_count = pinned.iter().filter(|x| **x).count();
        let free_mass = 1.0 - floor * pinned_count as f64;
        let free_sum: f64 = probs
            .values()
            .zip(&pinned)
            .filter(|(_, pin)| !**pin)
            .map(|(p, _)| *p)
            .sum();
        if free_sum <= 0.0 {
            probs.values_mut().for_each(|p| *p = uniform);
            return;
        }
        let scale = free_mass / free_sum;
        let mut newly_pinned = false;
        for (p, pin) in probs.values_mut().zip(pinned.iter_mut()) {
            if *pin {
                *p = floor;
                continue;
            }
            let scaled = *p * scale;
            if scaled < floor {
                *pin = true;
                *p = floor;
                newly_pinned = true;
            } else {
                *p = scaled;
            }
        }
        if !newly_pinned {
            return;
        }
    }
}

fn weighted_pick<R: Rng + ?Sized>(rng: &mut R, keys: &[String], probs: &BTreeMap<String, f64>) -> usize {
    let total: f64 = keys.iter().map(|k| probs.get(k).copied().unwrap_or(0.0)).sum();
    if total <= 0.0 {
        return rng.random_range(0..keys.len());
    }
    let mut threshold = rng.random::<f64>() * total;
    for (i, k) in keys.iter().enumerate() {
        threshold -= probs.get(k).copied().unwrap_or(0.0);
        if threshold <= 0.0 {
            return i;
        }
    }
    keys.len() - 1
}

/// Dimensions where the opponent is weak: score `<= 6` or trailing by more than 0.3.
pub fn opponent_weaknesses(mine: &DimensionScores, theirs: &DimensionScores) -> Vec<String> {
    Dimension::ALL
        .iter()
        .filter_map(|dim| {
            let my = mine.get(*dim);
            let opp = theirs.get(*dim);
            (opp <= 6.0 || opp + 0.3 < my)
                .then(|| format!("{}: 对方{opp}/10 < 你方{my}/10", dim.label()))
        })
        .collect()
}

/// The adaptive tactic learner for both personas.
#[derive(Debug, Clone)]
pub struct TacticPolicy {
    config: PolicyConfig,
    doc: PolicyDocument,
    metrics: PolicyMetrics,
    /// Round whose selections are cached in `round_actions`.
    cached_round: Option<u64>,
    round_actions: PerPersona<Option<Vec<String>>>,
}

impl TacticPolicy {
    pub fn new(config: PolicyConfig) -> Self {
        Self::from_parts(config, PolicyDocument::default(), PolicyMetrics::default())
    }

    pub fn from_parts(config: PolicyConfig, mut doc: PolicyDocument, metrics: PolicyMetrics) -> Self {
        for p in Persona::ALL {
            doc.agents[p].reconcile(&config);
        }
        Self {
            config,
            doc,
            metrics,
            cached_round: None,
            round_actions: PerPersona::default(),
        }
    }

    /// Load persisted state; absent files start fresh.
    pub fn load(
        config: PolicyConfig,
        policy_path: &Path,
        metrics_path: &Path,
    ) -> Result<Self, PersistenceError> {
        let doc = persistence::load_versioned::<PolicyDocument>(policy_path)?.unwrap_or_default();
        let metrics = persistence::load_json::<PolicyMetrics>(metrics_path)?.unwrap_or_default();
        Ok(Self::from_parts(config, doc, metrics))
    }

    pub fn save(&self, policy_path: &Path, metrics_path: &Path) -> Result<(), PersistenceError> {
        persistence::save_json(policy_path, &self.doc)?;
        persistence::save_json(metrics_path, &self.metrics)
    }

    pub fn config(&self) -> &PolicyConfig {
        &self.config
    }

    pub fn document(&self) -> &PolicyDocument {
        &self.doc
    }

    pub fn metrics(&self) -> &PolicyMetrics {
        &self.metrics
    }

    pub fn state(&self, persona: Persona) -> &PersonaPolicy {
        &self.doc.agents[persona]
    }

    pub fn last_updated_round(&self) -> Option<u64> {
        self.doc.last_updated_round
    }

    /// Sample this round's tactics for `persona`, cached for the round.
    ///
    /// With probability `exploration` the whole subset is drawn uniformly;
    /// otherwise each pick is weighted by probability, without replacement.
    pub fn select_actions<R: Rng + ?Sized>(
        &mut self,
        round: u64,
        persona: Persona,
        rng: &mut R,
    ) -> Vec<String> {
        if !self.config.enabled {
            return Vec::new();
        }
        if self.cached_round != Some(round) {
            self.cached_round = Some(round);
            self.round_actions = PerPersona::default();
        }
        if let Some(cached) = &self.round_actions[persona] {
            return cached.clone();
        }

        let probs = &self.doc.agents[persona].tactic_probs;
        let mut remaining: Vec<String> = probs.keys().cloned().collect();
        if remaining.is_empty() {
            return Vec::new();
        }
        let count = self.config.action_count.clamp(1, remaining.len());
        let explore = rng.random::<f64>() < self.config.exploration;
        let mut picked = Vec::with_capacity(count);
        for _ in 0..count {
            let idx = if explore {
                rng.random_range(0..remaining.len())
            } else {
                weighted_pick(rng, &remaining, probs)
            };
            picked.push(remaining.remove(idx));
        }
        debug!(round, persona = %persona, actions = ?picked, explore, "Selected tactics");
        self.round_actions[persona] = Some(picked.clone());
        picked
    }

    /// Cached selection for `round`, if any.
    pub fn round_actions(&self, round: u64, persona: Persona) -> Option<&[String]> {
        if self.cached_round != Some(round) {
            return None;
        }
        self.round_actions[persona].as_deref()
    }

    pub fn prompt_context<R: Rng + ?Sized>(
        &mut self,
        round: u64,
        persona: Persona,
        last_scores: Option<&PerPersona<DimensionScores>>,
        rng: &mut R,
    ) -> PromptContext {
        let tactics = self
            .select_actions(round, persona, rng)
            .iter()
            .filter_map(|k| tactic(k))
            .collect();
        let state = &self.doc.agents[persona];
        let mut focus: Vec<(Dimension, f64)> = Dimension::ALL
            .iter()
            .map(|d| (*d, (state.focus_weight(*d) * 100.0).round() / 100.0))
            .collect();
        focus.sort_by(|a, b| b.1.total_cmp(&a.1));
        focus.truncate(3);
        let opponent_weaknesses = last_scores
            .map(|s| opponent_weaknesses(&s[persona], &s[persona.opponent()]))
            .unwrap_or_default();
        PromptContext {
            tactics,
            focus,
            opponent_weaknesses,
        }
    }

    /// Reward for `persona` before clamping to `reward_bounds`.
    pub fn raw_reward(&self, persona: Persona, update: &PolicyUpdate<'_>) -> f64 {
        let eval = update.evaluation;
        let avg = eval.averages[persona];
        let opp = eval.averages[persona.opponent()];
        let rule = eval.scores[persona].rule_compliance;
        let mut reward = score_to_reward(&self.config.reward_weights, avg, opp, rule)
            + self.config.dynamics_weight * update.dynamics_signals[persona];
        if update.replies_identical {
            reward -= self.config.duplicate_penalty;
        }
        reward
    }

    /// Apply one judged round. Returns `None` when the round was already applied.
    pub fn update(&mut self, update: &PolicyUpdate<'_>) -> Option<UpdateOutcome> {
        if !self.config.enabled {
            return None;
        }
        if self
            .doc
            .last_updated_round
            .is_some_and(|last| last >= update.round)
        {
            debug!(round = update.round, "Policy already updated for round");
            return None;
        }

        let mut rewards = PerPersona::splat(0.0);
        let mut advantages = PerPersona::splat(0.0);
        let now = Utc::now();
        for persona in Persona::ALL {
            let reward = self
                .config
                .reward_bounds
                .clamp(self.raw_reward(persona, update));
            let actions = self
                .round_actions(update.round, persona)
                .map(<[String]>::to_vec)
                .unwrap_or_default();
            let advantage = self.apply_persona(persona, update.evaluation, reward, actions, now);
            rewards[persona] = reward;
            advantages[persona] = advantage;

            let avg = update.evaluation.averages[persona];
            let m = &mut self.metrics.agents[persona];
            m.steps += 1;
            m.avg_reward = m.avg_reward * 0.9 + reward * 0.1;
            m.avg_score = m.avg_score * 0.9 + avg * 0.1;
        }
        self.doc.last_updated_round = Some(update.round);
        self.doc.updated_at = now;
        self.metrics.updated_at = now;

        info!(
            round = update.round,
            reward_p1 = rewards.p1,
            reward_p2 = rewards.p2,
            duplicate = update.replies_identical,
            "Policy updated"
        );
        Some(UpdateOutcome {
            rewards,
            advantages,
            actions: self.doc.agents.map(|_, s| s.last_actions.clone()),
        })
    }

    fn apply_persona(
        &mut self,
        persona: Persona,
        eval: &RoundEvaluation,
        reward: f64,
        actions: Vec<String>,
        now: DateTime<Utc>,
    ) -> f64 {
        let cfg = &self.config;
        let state = &mut self.doc.agents[persona];

        let baseline = state.baseline;
        let advantage = reward - baseline;
        state.baseline = (1.0 - cfg.baseline_alpha) * baseline + cfg.baseline_alpha * reward;
        state.avg_reward = state.avg_reward * 0.9 + reward * 0.1;
        state.last_reward = reward;
        state.last_advantage = advantage;
        state.step += 1;
        state.last_update = Some(now);
        state.last_actions = actions;

        let n = state.tactic_probs.len();
        let others = (n.saturating_sub(1)).max(1) as f64;
        for (key, p) in state.tactic_probs.iter_mut() {
            let direction = if state.last_actions.contains(key) {
                1.0 - *p
            } else {
                -*p / others
            };
            *p = (*p + cfg.learning_rate * advantage * direction).clamp(cfg.min_prob, 1.0);
        }
        normalize_with_floor(&mut state.tactic_probs, cfg.min_prob);

        let mine = &eval.scores[persona];
        let theirs = &eval.scores[persona.opponent()];
        for dim in Dimension::ALL {
            let my = mine.get(dim);
            let opp = theirs.get(dim);
            let gap = ((opp - my) / 10.0).clamp(-0.2, 0.2);
            let target_gap = ((8.0 - my) / 10.0).clamp(-0.1, 0.2);
            let hits = eval.suggestions[persona]
                .iter()
                .filter(|s| suggestion_keywords(dim).iter().any(|kw| s.contains(kw)))
                .count();
            let delta = cfg.focus_learning_rate * (gap + target_gap) + 0.04 * hits as f64;
            let w = state.focus.entry(dim.key().to_string()).or_insert(1.0);
            *w = cfg.focus_bounds.clamp(*w + delta);
        }
        advantage
    }

    /// History line for an applied update.
    pub fn history_entry(
        &self,
        update: &PolicyUpdate<'_>,
        outcome: &UpdateOutcome,
        session_id: u64,
        topic: &str,
        stage_key: &str,
    ) -> PolicyHistoryEntry {
        PolicyHistoryEntry {
            ts: self.doc.updated_at,
            round: update.round,
            session_id,
            topic: topic.to_string(),
            stage_key: stage_key.to_string(),
            averages: update.evaluation.averages.clone(),
            duplicate_reply: update.replies_identical,
            actions: outcome.actions.clone(),
            rewards: outcome.rewards.clone(),
            advantages: outcome.advantages.clone(),
        }
    }

    /// One-line strategy summary per persona for the experience log.
    pub fn strategy_summary(&self, persona: Persona) -> String {
        let state = &self.doc.agents[persona];
        let mut top: Vec<(&String, &f64)> = state.tactic_probs.iter().collect();
        top.sort_by(|a, b| b.1.total_cmp(a.1));
        let tactics: Vec<String> = top
            .iter()
            .take(3)
            .map(|(k, p)| {
                let label = tactic(k).map(|t| t.label).unwrap_or(k.as_str());
                format!("{label}({:.2})", p)
            })
            .collect();
        format!(
            "{persona} 策略偏好：{}；基线 {:.3}，累计更新 {} 次",
            tactics.join("、"),
            state.baseline,
            state.step
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn assert_invariant(probs: &BTreeMap<String, f64>, floor: f64) {
        let sum: f64 = probs.values().sum();
        assert!((sum - 1.0).abs() < 1e-9, "sum = {sum}");
        for (k, p) in probs {
            assert!(*p >= floor - 1e-12, "{k} = {p} below floor");
        }
    }

    fn evaluation(p1: f64, p2: f64) -> RoundEvaluation {
        RoundEvaluation::from_scores(PerPersona::new(
            DimensionScores::uniform(p1),
            DimensionScores::uniform(p2),
        ))
    }

    #[test]
    fn test_normalize_with_floor_keeps_invariant() {
        let mut probs: BTreeMap<String, f64> = [
            ("a".to_string(), 0.9),
            ("b".to_string(), 0.0),
            ("c".to_string(), f64::NAN),
            ("d".to_string(), 0.2),
        ]
        .into_iter()
        .collect();
        normalize_with_floor(&mut probs, 0.1);
        assert_invariant(&probs, 0.1);
        assert!(probs["a"] > probs["d"]);
    }

    #[test]
    fn test_normalize_with_impossible_floor_is_uniform() {
        let mut probs: BTreeMap<String, f64> =
            [("a".to_string(), 0.7), ("b".to_string(), 0.3)].into_iter().collect();
        normalize_with_floor(&mut probs, 0.6);
        assert_eq!(probs["a"], 0.5);
    }

    #[test]
    fn test_selection_is_cached_per_round() {
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut rng = StdRng::seed_from_u64(7);
        let first = policy.select_actions(1, Persona::P1, &mut rng);
        assert_eq!(first.len(), 2);
        assert_ne!(first[0], first[1]);
        assert_eq!(policy.select_actions(1, Persona::P1, &mut rng), first);
        assert_eq!(policy.round_actions(1, Persona::P1), Some(first.as_slice()));
        assert!(policy.round_actions(2, Persona::P1).is_none());
    }

    #[test]
    fn test_update_is_idempotent_per_round() {
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut rng = StdRng::seed_from_u64(1);
        policy.select_actions(3, Persona::P1, &mut rng);
        policy.select_actions(3, Persona::P2, &mut rng);
        let eval = evaluation(8.0, 6.0);
        let update = PolicyUpdate {
            round: 3,
            evaluation: &eval,
            replies_identical: false,
            dynamics_signals: PerPersona::splat(0.0),
        };
        assert!(policy.update(&update).is_some());
        let snapshot = policy.document().clone();
        assert!(policy.update(&update).is_none());
        assert_eq!(policy.document(), &snapshot);

        let older = PolicyUpdate { round: 2, ..update };
        assert!(policy.update(&older).is_none());
    }

    #[test]
    fn test_positive_advantage_raises_chosen_tactics() {
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut rng = StdRng::seed_from_u64(11);
        let chosen = policy.select_actions(1, Persona::P1, &mut rng);
        policy.select_actions(1, Persona::P2, &mut rng);
        let before = policy.state(Persona::P1).tactic_probs[&chosen[0]];
        let eval = evaluation(9.0, 5.0);
        let outcome = policy
            .update(&PolicyUpdate {
                round: 1,
                evaluation: &eval,
                replies_identical: false,
                dynamics_signals: PerPersona::splat(0.0),
            })
            .unwrap();
        assert!(outcome.advantages.p1 > 0.0);
        assert!(policy.state(Persona::P1).tactic_probs[&chosen[0]] > before);
        assert_eq!(policy.state(Persona::P1).last_actions, chosen);
        for p in Persona::ALL {
            assert_invariant(&policy.state(p).tactic_probs, 0.03);
        }
    }

    #[test]
    fn test_duplicate_penalty_is_exact() {
        let policy = TacticPolicy::new(PolicyConfig::default());
        let eval = evaluation(6.0, 6.0);
        let base = PolicyUpdate {
            round: 1,
            evaluation: &eval,
            replies_identical: false,
            dynamics_signals: PerPersona::splat(0.0),
        };
        let dup = PolicyUpdate {
            replies_identical: true,
            ..base.clone()
        };
        for p in Persona::ALL {
            let diff = policy.raw_reward(p, &base) - policy.raw_reward(p, &dup);
            assert!((diff - 0.15).abs() < 1e-12);
        }
    }

    #[test]
    fn test_reward_formula_and_clamp() {
        let weights = RewardWeights::default();
        let r = score_to_reward(&weights, 8.0, 6.0, 9.0);
        assert!((r - (0.6 * 0.6 + 0.3 * 0.2 + 0.1 * 0.8)).abs() < 1e-12);

        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let eval = evaluation(10.0, 1.0);
        let outcome = policy
            .update(&PolicyUpdate {
                round: 1,
                evaluation: &eval,
                replies_identical: false,
                dynamics_signals: PerPersona::new(50.0, -50.0),
            })
            .unwrap();
        assert_eq!(outcome.rewards.p1, 1.0);
        assert_eq!(outcome.rewards.p2, -1.0);
    }

    #[test]
    fn test_focus_moves_toward_weak_dimensions_and_stays_bounded() {
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut eval = evaluation(5.0, 8.0);
        eval.suggestions.p1 = vec!["补充数据和证据".into(); 40];
        for round in 1..=30 {
            policy.update(&PolicyUpdate {
                round,
                evaluation: &eval,
                replies_identical: false,
                dynamics_signals: PerPersona::splat(0.0),
            });
        }
        let p1 = policy.state(Persona::P1);
        assert_eq!(p1.focus_weight(Dimension::Evidence), 1.8);
        for dim in Dimension::ALL {
            let w = policy.state(Persona::P2).focus_weight(dim);
            assert!((0.6..=1.8).contains(&w));
        }
    }

    #[test]
    fn test_probabilities_stay_valid_under_many_updates() {
        let mut policy = TacticPolicy::new(PolicyConfig {
            learning_rate: 0.9,
            ..PolicyConfig::default()
        });
        let mut rng = StdRng::seed_from_u64(42);
        for round in 1..=200u64 {
            policy.select_actions(round, Persona::P1, &mut rng);
            policy.select_actions(round, Persona::P2, &mut rng);
            let a = rng.random_range(1.0..=10.0);
            let b = rng.random_range(1.0..=10.0);
            let eval = evaluation(a, b);
            policy.update(&PolicyUpdate {
                round,
                evaluation: &eval,
                replies_identical: round % 7 == 0,
                dynamics_signals: PerPersona::splat(0.0),
            });
            for p in Persona::ALL {
                assert_invariant(&policy.state(p).tactic_probs, 0.03);
            }
        }
    }

    #[test]
    fn test_state_round_trips_through_disk() {
        let dir = tempfile::tempdir().unwrap();
        let policy_path = dir.path().join("rl/rl_policy.json");
        let metrics_path = dir.path().join("rl/rl_metrics.json");
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut rng = StdRng::seed_from_u64(5);
        policy.select_actions(1, Persona::P1, &mut rng);
        let eval = evaluation(7.3, 6.1);
        policy.update(&PolicyUpdate {
            round: 1,
            evaluation: &eval,
            replies_identical: false,
            dynamics_signals: PerPersona::new(-1.04, 1.12),
        });
        policy.save(&policy_path, &metrics_path).unwrap();

        let loaded = TacticPolicy::load(PolicyConfig::default(), &policy_path, &metrics_path).unwrap();
        for p in Persona::ALL {
            let a = &policy.state(p);
            let b = &loaded.state(p);
            for (k, v) in &a.tactic_probs {
                assert!((v - b.tactic_probs[k]).abs() < 1e-12);
            }
            assert_eq!(a.focus, b.focus);
        }
        assert_eq!(loaded.last_updated_round(), Some(1));
        assert_eq!(loaded.metrics().agents.p1.steps, 1);
    }

    #[test]
    fn test_load_reconciles_unknown_tactics() {
        let mut doc = PolicyDocument::default();
        doc.agents.p1.tactic_probs.remove("synthesis");
        doc.agents.p1.tactic_probs.insert("retired".into(), 0.5);
        let policy = TacticPolicy::from_parts(PolicyConfig::default(), doc, PolicyMetrics::default());
        let probs = &policy.state(Persona::P1).tactic_probs;
        assert!(probs.contains_key("synthesis"));
        assert!(!probs.contains_key("retired"));
        assert_invariant(probs, 0.03);
    }

    #[test]
    fn test_prompt_context_reports_weaknesses() {
        let mut policy = TacticPolicy::new(PolicyConfig::default());
        let mut rng = StdRng::seed_from_u64(3);
        let mut scores = PerPersona::new(DimensionScores::uniform(8.0), DimensionScores::uniform(8.0));
        scores.p2.evidence = 5.0;
        let ctx = policy.prompt_context(1, Persona::P1, Some(&scores), &mut rng);
        assert_eq!(ctx.tactics.len(), 2);
        assert_eq!(ctx.focus.len(), 3);
        assert_eq!(ctx.opponent_weaknesses.len(), 1);
        assert!(ctx.opponent_weaknesses[0].starts_with("证据性"));
    }
}
