//! Conversation transcript: an append-only text file with a parseable header
//! per entry, plus the bounded tail used as model context.
//!
//! Entry layout:
//!
//! ```text
//! [2026-01-01 08:00:00 UTC+8] P1 (Round 3)
//! Topic: 城市应限制私家车出行以改善环境？
//! Stage: 攻辩阶段-正方二辩提问
//! <body>
//!
//! ```

use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use chrono::{DateTime, Utc};
use regex::Regex;
use tracing::info;

use crate::persistence::{self, PersistenceError};
use crate::persona::Persona;
use crate::text::{format_utc8, safe_slug, tail_chars};

const EMPTY_BODY: &str = "(空)";
const PENDING_TOPIC: &str = "(待定)";

static HEADER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\[([^\]]+)\] (P1|P2|A|B) \(Round (\d+)\)$").expect("HEADER_RE regex should compile")
});

static SEPARATOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^=== Round \d+ \| Topic: .* ===$").expect("SEPARATOR_RE regex should compile")
});

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationEntry {
    pub timestamp: String,
    pub persona: Persona,
    pub round: u64,
    pub topic: String,
    pub stage: Option<String>,
    pub body: String,
}

impl ConversationEntry {
    pub fn new(
        persona: Persona,
        round: u64,
        topic: &str,
        stage: Option<&str>,
        body: &str,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            timestamp: format_utc8(at),
            persona,
            round,
            topic: topic.trim().to_string(),
            stage: stage.map(str::to_string),
            body: body.trim().to_string(),
        }
    }

    /// Render in transcript format, including the trailing blank line.
    pub fn render(&self) -> String {
        let topic = if self.topic.is_empty() {
            PENDING_TOPIC
        } else {
            &self.topic
        };
        let body = if self.body.is_empty() {
            EMPTY_BODY
        } else {
            &self.body
        };
        let stage = self
            .stage
            .as_deref()
            .filter(|s| !s.is_empty())
            .map(|s| format!("Stage: {s}\n"))
            .unwrap_or_default();
        format!(
            "[{}] {} (Round {})\nTopic: {}\n{}{}\n\n",
            self.timestamp, self.persona, self.round, topic, stage, body
        )
    }
}

/// Separator written before each round's entries.
pub fn round_separator(round: u64, topic: &str) -> String {
    let topic = if topic.trim().is_empty() {
        PENDING_TOPIC
    } else {
        topic.trim()
    };
    format!("\n=== Round {round} | Topic: {topic} ===\n")
}

fn finish(slot: Option<(ConversationEntry, Vec<&str>)>, out: &mut Vec<ConversationEntry>) {
    if let Some((mut entry, body)) = slot {
        entry.body = body.join("\n").trim().to_string();
        out.push(entry);
    }
}

/// Parse transcript text back into entries. Separator lines are skipped.
pub fn parse_transcript(text: &str) -> Vec<ConversationEntry> {
    let mut entries = Vec::new();
    let mut current: Option<(ConversationEntry, Vec<&str>)> = None;

    for line in text.lines() {
        if let Some(caps) = HEADER_RE.captures(line) {
            finish(current.take(), &mut entries);
            let persona = Persona::from_tag(&caps[2]).unwrap_or(Persona::P1);
            let round = caps[3].parse().unwrap_or(0);
            current = Some((
                ConversationEntry {
                    timestamp: caps[1].to_string(),
                    persona,
                    round,
                    topic: String::new(),
                    stage: None,
                    body: String::new(),
                },
                Vec::new(),
            ));
            continue;
        }
        if SEPARATOR_RE.is_match(line.trim()) {
            finish(current.take(), &mut entries);
            continue;
        }
        let Some((entry, body)) = current.as_mut() else {
            continue;
        };
        if body.is_empty() && entry.topic.is_empty() {
            if let Some(topic) = line.strip_prefix("Topic: ") {
                entry.topic = topic.trim().to_string();
                continue;
            }
        }
        if body.is_empty() && entry.stage.is_none() {
            if let Some(stage) = line.strip_prefix("Stage: ") {
                entry.stage = Some(stage.trim().to_string());
                continue;
            }
        }
        body.push(line);
    }
    finish(current, &mut entries);
    entries
}

/// Append `addition` to `base` and keep the last `max_chars` characters.
///
/// `max_chars == 0` disables trimming.
pub fn append_and_trim(base: &str, addition: &str, max_chars: usize) -> String {
    let separator = if !base.is_empty() && !base.ends_with('\n') {
        "\n"
    } else {
        ""
    };
    let combined = format!("{base}{separator}{addition}");
    if max_chars == 0 {
        return combined;
    }
    tail_chars(&combined, max_chars).to_string()
}

/// The on-disk transcript file.
#[derive(Debug, Clone)]
pub struct ConversationLog {
    path: PathBuf,
}

impl ConversationLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn read_all(&self) -> Result<String, PersistenceError> {
        persistence::read_text(&self.path)
    }

    /// The last `max_chars` characters of the transcript.
    pub fn tail(&self, max_chars: usize) -> Result<String, PersistenceError> {
        let all = self.read_all()?;
        Ok(tail_chars(&all, max_chars).to_string())
    }

    pub fn append_raw(&self, text: &str) -> Result<(), PersistenceError> {
        persistence::append_text(&self.path, text)
    }

    pub fn append(&self, entry: &ConversationEntry) -> Result<(), PersistenceError> {
        self.append_raw(&entry.render())
    }

    pub fn entries(&self) -> Result<Vec<ConversationEntry>, PersistenceError> {
        Ok(parse_transcript(&self.read_all()?))
    }

    /// Copy the transcript into `archive_dir` and truncate it.
    ///
    /// Returns `None` when the transcript is empty.
    pub fn archive(
        &self,
        archive_dir: &Path,
        session_id: u64,
        topic: &str,
        at: DateTime<Utc>,
    ) -> Result<Option<PathBuf>, PersistenceError> {
        let content = self.read_all()?;
        if content.trim().is_empty() {
            return Ok(None);
        }
        let stamp = at.format("%Y-%m-%dT%H-%M-%S");
        let name = format!(
            "debate_{session_id}_{stamp}_{}.log",
            safe_slug(topic, 50)
        );
        let target = archive_dir.join(name);
        persistence::write_atomic(&target, &content)?;
        persistence::write_atomic(&self.path, "")?;
        info!(session_id, path = %target.display(), "Archived transcript");
        Ok(Some(target))
    }
}
