//! Judge evaluation model and tolerant parsing of judge output.
//!
//! Judges are language models, so their JSON is parsed leniently: the object
//! may be wrapped in prose, persona keys may use `P1`/`P2` or the legacy
//! `A`/`B`, and numbers may arrive as strings. Missing scores are an error;
//! the engine never invents scores for an unparseable evaluation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::persona::{PerPersona, Persona};
use crate::text::extract_json_object;

pub const SCORE_MIN: f64 = 1.0;
pub const SCORE_MAX: f64 = 10.0;
/// Average difference below which a round is a tie when the judge names no winner.
const TIE_EPSILON: f64 = 0.05;
const MAX_LIST_ITEMS: usize = 5;

/// One of the five fixed scoring dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    Logic,
    Evidence,
    Responsiveness,
    Expression,
    RuleCompliance,
}

impl Dimension {
    pub const ALL: [Dimension; 5] = [
        Self::Logic,
        Self::Evidence,
        Self::Responsiveness,
        Self::Expression,
        Self::RuleCompliance,
    ];

    pub fn key(self) -> &'static str {
        match self {
            Self::Logic => "logic",
            Self::Evidence => "evidence",
            Self::Responsiveness => "responsiveness",
            Self::Expression => "expression",
            Self::RuleCompliance => "rule_compliance",
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::Logic => "逻辑性",
            Self::Evidence => "证据性",
            Self::Responsiveness => "反应度",
            Self::Expression => "表达力",
            Self::RuleCompliance => "规则遵守",
        }
    }

    pub fn from_key(key: &str) -> Option<Dimension> {
        Self::ALL.into_iter().find(|d| d.key() == key)
    }
}

impl std::fmt::Display for Dimension {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.key())
    }
}

/// Per-dimension 1–10 scores for one persona.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DimensionScores {
    pub logic: f64,
    pub evidence: f64,
    pub responsiveness: f64,
    pub expression: f64,
    pub rule_compliance: f64,
}

impl DimensionScores {
    pub fn uniform(value: f64) -> Self {
        Self {
            logic: value,
            evidence: value,
            responsiveness: value,
            expression: value,
            rule_compliance: value,
        }
    }

    pub fn get(&self, dim: Dimension) -> f64 {
        match dim {
            Dimension::Logic => self.logic,
            Dimension::Evidence => self.evidence,
            Dimension::Responsiveness => self.responsiveness,
            Dimension::Expression => self.expression,
            Dimension::RuleCompliance => self.rule_compliance,
        }
    }

    fn set(&mut self, dim: Dimension, value: f64) {
        match dim {
            Dimension::Logic => self.logic = value,
            Dimension::Evidence => self.evidence = value,
            Dimension::Responsiveness => self.responsiveness = value,
            Dimension::Expression => self.expression = value,
            Dimension::RuleCompliance => self.rule_compliance = value,
        }
    }

    pub fn average(&self) -> f64 {
        Dimension::ALL.iter().map(|d| self.get(*d)).sum::<f64>() / Dimension::ALL.len() as f64
    }
}

/// Winner of a round or of a whole debate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Winner {
    P1,
    P2,
    #[serde(rename = "tie")]
    Tie,
}

impl Winner {
    pub fn parse(raw: &str) -> Option<Winner> {
        let raw = raw.trim();
        if let Some(p) = Persona::from_tag(raw) {
            return Some(Self::from(p));
        }
        match raw.to_ascii_lowercase().as_str() {
            "tie" | "draw" | "平局" | "平" => Some(Self::Tie),
            _ => match raw {
                "正方" => Some(Self::P1),
                "反方" => Some(Self::P2),
                _ => None,
            },
        }
    }

    /// Winner implied by two averages.
    pub fn from_averages(averages: &PerPersona<f64>) -> Winner {
        let diff = averages.p1 - averages.p2;
        if diff.abs() < TIE_EPSILON {
            Self::Tie
        } else if diff > 0.0 {
            Self::P1
        } else {
            Self::P2
        }
    }
}

impl From<Persona> for Winner {
    fn from(p: Persona) -> Self {
        match p {
            Persona::P1 => Self::P1,
            Persona::P2 => Self::P2,
        }
    }
}

impl std::fmt::Display for Winner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::P1 => write!(f, "P1"),
            Self::P2 => write!(f, "P2"),
            Self::Tie => write!(f, "tie"),
        }
    }
}

/// Normalized judge verdict for one round.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoundEvaluation {
    pub scores: PerPersona<DimensionScores>,
    pub averages: PerPersona<f64>,
    pub winner: Winner,
    pub highlights: PerPersona<Vec<String>>,
    pub suggestions: PerPersona<Vec<String>>,
    /// One-line summary of the core clash.
    pub core_conflict: String,
}

impl RoundEvaluation {
    /// Build from scores, deriving averages and the winner.
    pub fn from_scores(scores: PerPersona<DimensionScores>) -> Self {
        let averages = scores.map(|_, s| s.average());
        Self {
            winner: Winner::from_averages(&averages),
            scores,
            averages,
            highlights: PerPersona::default(),
            suggestions: PerPersona::default(),
            core_conflict: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurningPoint {
    pub round: Option<u64>,
    pub description: String,
}

/// Whole-debate verdict, requested once at the closing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinalEvaluation {
    pub winner: Winner,
    pub key_turning_points: Vec<TurningPoint>,
    pub decisive_factors: Vec<String>,
    pub strengths: PerPersona<Vec<String>>,
    pub weaknesses: PerPersona<Vec<String>>,
    /// 0–100 overall scores.
    pub final_scores: PerPersona<f64>,
    pub overall_comment: String,
}

#[derive(Debug, Error, PartialEq)]
pub enum EvaluationParseError {
    #[error("no JSON object in judge output")]
    NoJson,
    #[error("missing scores for {0}")]
    MissingScores(Persona),
    #[error("missing or non-numeric {dimension} score for {persona}")]
    MissingDimension { persona: Persona, dimension: Dimension },
}

fn persona_entry(map: &Value, persona: Persona) -> Option<&Value> {
    let keys: &[&str] = match persona {
        Persona::P1 => &["P1", "p1", "A", "a"],
        Persona::P2 => &["P2", "p2", "B", "b"],
    };
    keys.iter().find_map(|k| map.get(*k))
}

fn as_number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
    .filter(|v: &f64| v.is_finite())
}

fn string_list(value: Option<&Value>) -> Vec<String> {
    match value {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
                Value::Null => None,
                other if !other.is_string() => Some(other.to_string()),
                _ => None,
            })
            .take(MAX_LIST_ITEMS)
            .collect(),
        Some(Value::String(s)) if !s.trim().is_empty() => vec![s.trim().to_string()],
        _ => Vec::new(),
    }
}

fn persona_lists(root: &Value, field: &str) -> PerPersona<Vec<String>> {
    let section = root.get(field);
    PerPersona::from_fn(|p| string_list(section.and_then(|s| persona_entry(s, p))))
}

fn parse_scores(root: &Value, persona: Persona) -> Result<DimensionScores, EvaluationParseError> {
    let entry = root
        .get("scores")
        .and_then(|s| persona_entry(s, persona))
        .filter(|e| e.is_object())
        .ok_or(EvaluationParseError::MissingScores(persona))?;
    // Some judges nest dimensions under "details".
    let entry = entry.get("details").filter(|d| d.is_object()).unwrap_or(entry);

    let mut scores = DimensionScores::uniform(SCORE_MIN);
    for dim in Dimension::ALL {
        let value = entry
            .get(dim.key())
            .and_then(as_number)
            .ok_or(EvaluationParseError::MissingDimension {
                persona,
                dimension: dim,
            })?;
        scores.set(dim, value.clamp(SCORE_MIN, SCORE_MAX));
    }
    Ok(scores)
}

/// Parse a round evaluation from raw judge output.
///
/// Averages are recomputed from the clamped dimension scores. The winner is
/// taken from `round_winner` (or `winner`) when recognizable, otherwise
/// derived from the averages.
pub fn parse_round_evaluation(raw: &str) -> Result<RoundEvaluation, EvaluationParseError> {
    let root = extract_json_object(raw).ok_or(EvaluationParseError::NoJson)?;
    let scores = PerPersona::new(
        parse_scores(&root, Persona::P1)?,
        parse_scores(&root, Persona::P2)?,
    );
    let mut evaluation = RoundEvaluation::from_scores(scores);

    if let Some(winner) = root
        .get("round_winner")
        .or_else(|| root.get("winner"))
        .and_then(Value::as_str)
        .and_then(Winner::parse)
    {
        evaluation.winner = winner;
    }
    evaluation.highlights = persona_lists(&root, "highlights");
    evaluation.suggestions = persona_lists(&root, "suggestions");
    evaluation.core_conflict = root
        .get("core_conflict")
        .and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default();
    Ok(evaluation)
}

/// Parse a whole-debate verdict. Missing final scores are an error.
pub fn parse_final_evaluation(raw: &str) -> Result<FinalEvaluation, EvaluationParseError> {
    let root = extract_json_object(raw).ok_or(EvaluationParseError::NoJson)?;
    let final_section = root.get("final_scores");
    let score = |p: Persona| {
        final_section
            .and_then(|s| persona_entry(s, p))
            .and_then(as_number)
            .map(|v| v.clamp(0.0, 100.0))
            .ok_or(EvaluationParseError::MissingScores(p))
    };
    let final_scores = PerPersona::new(score(Persona::P1)?, score(Persona::P2)?);

    let winner = root
        .get("winner")
        .and_then(Value::as_str)
        .and_then(Winner::parse)
        .unwrap_or_else(|| Winner::from_averages(&final_scores));

    let key_turning_points = match root.get("key_turning_points") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| {
                let description = item.get("description").and_then(Value::as_str)?.trim();
                if description.is_empty() {
                    return None;
                }
                Some(TurningPoint {
                    round: item.get("round").and_then(as_number).map(|r| r.max(0.0) as u64),
                    description: description.to_string(),
                })
            })
            .collect(),
        _ => Vec::new(),
    };

    Ok(FinalEvaluation {
        winner,
        key_turning_points,
        decisive_factors: string_list(root.get("decisive_factors")),
        strengths: persona_lists(&root, "strengths"),
        weaknesses: persona_lists(&root, "weaknesses"),
        final_scores,
        overall_comment: root
            .get("overall_comment")
            .and_then(Value::as_str)
            .map(|s| s.trim().to_string())
            .unwrap_or_default(),
    })
}
