//! Per-persona planning documents and the cross-session experience log.
//!
//! Personas edit their planning document through small add/delete/change
//! operations embedded in their replies. Documents are plain markdown lists
//! (`- [timestamp] text`) and are cleared when a session ends; the experience
//! log survives across sessions.

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use serde_json::Value;

use crate::persistence::{self, PersistenceError};
use crate::persona::{PerPersona, Persona};
use crate::text::{format_utc8, tail_chars};

static ADD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(add|新增|添加|补充)\s*[:：]\s*(.+)$").expect("ADD_RE regex should compile")
});
static DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(del|delete|remove|删除|移除)\s*[:：]\s*(.+)$")
        .expect("DELETE_RE regex should compile")
});
static CHANGE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)^(change|update|replace|修改|变更|替换)\s*[:：]\s*(.+?)\s*(?:->|=>|→)\s*(.+)$")
        .expect("CHANGE_RE regex should compile")
});
static LINE_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*-\s*\[[^\]]+\]\s*(.*)$").expect("LINE_PREFIX_RE regex should compile")
});

/// One edit to a planning document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanOp {
    Add(String),
    /// Remove every line containing the text (case-insensitive).
    Delete(String),
    /// Replace the first line containing `from`; appended when nothing matches.
    Change { from: String, to: String },
}

impl std::fmt::Display for PlanOp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Add(text) => write!(f, "add: {text}"),
            Self::Delete(text) => write!(f, "del: {text}"),
            Self::Change { from, to } => write!(f, "change: {from} -> {to}"),
        }
    }
}

enum OpKind {
    Add,
    Delete,
    Change,
}

fn op_kind(raw: &str) -> Option<OpKind> {
    match raw.trim().to_lowercase().as_str() {
        "add" | "新增" | "添加" | "补充" => Some(OpKind::Add),
        "del" | "delete" | "remove" | "删除" | "移除" => Some(OpKind::Delete),
        "change" | "update" | "replace" | "修改" | "变更" | "替换" => Some(OpKind::Change),
        _ => None,
    }
}

/// Parse one textual operation. Unprefixed text is an add.
pub fn parse_plan_op(text: &str) -> Option<PlanOp> {
    let text = text.trim();
    if text.is_empty() {
        return None;
    }
    if let Some(caps) = CHANGE_RE.captures(text) {
        return Some(PlanOp::Change {
            from: caps[2].trim().to_string(),
            to: caps[3].trim().to_string(),
        });
    }
    if let Some(caps) = DELETE_RE.captures(text) {
        return Some(PlanOp::Delete(caps[2].trim().to_string()));
    }
    if let Some(caps) = ADD_RE.captures(text) {
        return Some(PlanOp::Add(caps[2].trim().to_string()));
    }
    Some(PlanOp::Add(text.to_string()))
}

fn field<'a>(obj: &'a Value, names: &[&str]) -> &'a str {
    names
        .iter()
        .find_map(|n| obj.get(*n).and_then(Value::as_str))
        .map(str::trim)
        .unwrap_or("")
}

fn parse_plan_object(obj: &Value) -> Option<PlanOp> {
    let kind = op_kind(field(obj, &["op", "action", "type"]))?;
    match kind {
        OpKind::Add | OpKind::Delete => {
            let text = field(obj, &["text", "value", "content"]);
            if text.is_empty() {
                return None;
            }
            Some(match kind {
                OpKind::Add => PlanOp::Add(text.to_string()),
                _ => PlanOp::Delete(text.to_string()),
            })
        }
        OpKind::Change => {
            let from = field(obj, &["from", "old"]);
            let to = field(obj, &["to", "new", "text"]);
            (!from.is_empty() && !to.is_empty()).then(|| PlanOp::Change {
                from: from.to_string(),
                to: to.to_string(),
            })
        }
    }
}

/// Parse the `plan_update` field of a persona reply.
///
/// Accepts an array of strings/objects, a single object, or a newline
/// separated string with optional `-`/`*` bullets.
pub fn parse_plan_ops(value: &Value) -> Vec<PlanOp> {
    match value {
        Value::Array(items) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => parse_plan_op(s),
                Value::Object(_) => parse_plan_object(item),
                _ => None,
            })
            .collect(),
        Value::Object(_) => parse_plan_object(value).into_iter().collect(),
        Value::String(s) => s
            .lines()
            .map(|l| l.trim().trim_start_matches(['-', '*']).trim())
            .filter_map(parse_plan_op)
            .collect(),
        _ => Vec::new(),
    }
}

fn strip_prefix(line: &str) -> &str {
    match LINE_PREFIX_RE.captures(line) {
        Some(caps) => caps.get(1).map_or("", |m| m.as_str()).trim(),
        None => line.trim(),
    }
}

fn matches_line(line: &str, query: &str) -> bool {
    !query.is_empty() && strip_prefix(line).to_lowercase().contains(&query.to_lowercase())
}

fn has_item(lines: &[String], text: &str) -> bool {
    lines.iter().any(|l| strip_prefix(l) == text.trim())
}

/// Apply `ops` to document `content`. Returns the new content and a
/// description of each op that changed something.
///
/// Re-applying the same ops is a no-op: an item already present is not
/// added twice.
pub fn apply_plan_ops(content: &str, ops: &[PlanOp], timestamp: &str) -> (String, Vec<String>) {
    let mut lines: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();
    let mut applied = Vec::new();
    let format_line = |text: &str| format!("- [{timestamp}] {text}");

    for op in ops {
        match op {
            PlanOp::Add(text) => {
                if has_item(&lines, text) {
                    continue;
                }
                lines.push(format_line(text));
                applied.push(op.to_string());
            }
            PlanOp::Delete(text) => {
                let before = lines.len();
                lines.retain(|l| !matches_line(l, text));
                if lines.len() != before {
                    applied.push(op.to_string());
                }
            }
            PlanOp::Change { from, to } => {
                match lines.iter().position(|l| matches_line(l, from)) {
                    Some(idx) => lines[idx] = format_line(to),
                    None if has_item(&lines, to) => continue,
                    None => lines.push(format_line(to)),
                }
                applied.push(op.to_string());
            }
        }
    }

    let rendered = if lines.is_empty() {
        String::new()
    } else {
        format!("{}\n", lines.join("\n"))
    };
    (rendered, applied)
}

/// Planning documents for both personas plus the experience log.
#[derive(Debug, Clone)]
pub struct PlanningDocs {
    plans: PerPersona<PathBuf>,
    experience: PathBuf,
}

impl PlanningDocs {
    pub fn new(plans: PerPersona<PathBuf>, experience: PathBuf) -> Self {
        Self { plans, experience }
    }

    pub fn plan_path(&self, persona: Persona) -> &Path {
        &self.plans[persona]
    }

    pub fn read_plan(&self, persona: Persona) -> Result<String, PersistenceError> {
        Ok(persistence::read_text(&self.plans[persona])?.trim().to_string())
    }

    /// Apply ops to a persona's document; returns the applied descriptions.
    pub fn apply(
        &self,
        persona: Persona,
        ops: &[PlanOp],
        at: DateTime<Utc>,
    ) -> Result<Vec<String>, PersistenceError> {
        if ops.is_empty() {
            return Ok(Vec::new());
        }
        let path = &self.plans[persona];
        let current = persistence::read_text(path)?;
        let (updated, applied) = apply_plan_ops(&current, ops, &format_utc8(at));
        if !applied.is_empty() {
            persistence::write_atomic(path, &updated)?;
        }
        Ok(applied)
    }

    /// Clear both planning documents (session end).
    pub fn reset(&self) -> Result<(), PersistenceError> {
        for persona in Persona::ALL {
            persistence::write_atomic(&self.plans[persona], "")?;
        }
        Ok(())
    }

    /// Tail of the experience log for prompt injection.
    pub fn read_experience(&self, max_chars: usize) -> Result<String, PersistenceError> {
        let all = persistence::read_text(&self.experience)?;
        Ok(tail_chars(&all, max_chars).to_string())
    }

    /// Append a session's notes and summary to the experience log.
    pub fn append_experience(
        &self,
        session_id: u64,
        topic: &str,
        notes: &PerPersona<Vec<String>>,
        summary: &[String],
        at: DateTime<Utc>,
    ) -> Result<(), PersistenceError> {
        let topic = if topic.trim().is_empty() { "(待定)" } else { topic.trim() };
        let mut lines = vec![format!(
            "## [{}] Debate {session_id} | Topic: {topic}",
            format_utc8(at)
        )];
        let mut any = false;
        for (persona, items) in notes.iter() {
            if items.is_empty() {
                continue;
            }
            any = true;
            lines.push(format!("- {persona}: {}", items.join("；")));
        }
        if !any {
            lines.push("- (无经验总结)".to_string());
        }
        if !summary.is_empty() {
            lines.push(String::new());
            lines.push("### 强化学习统计".to_string());
            lines.extend(summary.iter().map(|s| format!("- {s}")));
        }
        persistence::append_text(&self.experience, &format!("{}\n\n", lines.join("\n")))
    }
}
