//! Shallow text heuristics shared by the classifier, policy and parsers.
//!
//! Everything here is character-based (not byte-based) so CJK text can be
//! sliced without splitting code points.

use std::collections::HashSet;
use std::sync::LazyLock;

use chrono::{DateTime, Duration, Utc};
use regex::Regex;

/// Maximum number of distinct bigrams considered by [`text_similarity`].
const MAX_NGRAMS: usize = 400;

static NON_WORD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[^\p{Han}A-Za-z0-9]").expect("NON_WORD_RE regex should compile")
});

/// Timestamp in the transcript's display zone (UTC+8).
pub fn format_utc8(at: DateTime<Utc>) -> String {
    let shifted = at + Duration::hours(8);
    format!("{} UTC+8", shifted.format("%Y-%m-%d %H:%M:%S"))
}

/// Calendar date in UTC+8, used for journal file names.
pub fn date_utc8(at: DateTime<Utc>) -> String {
    (at + Duration::hours(8)).format("%Y-%m-%d").to_string()
}

pub fn now_utc8() -> String {
    format_utc8(Utc::now())
}

/// Number of characters (not bytes).
pub fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Keep at most `max_chars` leading characters.
pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

/// Like [`truncate_chars`] but marks the cut with `...`.
pub fn snippet(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if char_len(trimmed) <= max_chars {
        return trimmed.to_string();
    }
    let keep = max_chars.saturating_sub(3);
    format!("{}...", truncate_chars(trimmed, keep))
}

/// The last `max_chars` characters of `text`.
pub fn tail_chars(text: &str, max_chars: usize) -> &str {
    let total = char_len(text);
    if max_chars == 0 || total <= max_chars {
        return text;
    }
    let skip = total - max_chars;
    match text.char_indices().nth(skip) {
        Some((idx, _)) => &text[idx..],
        None => "",
    }
}

/// Split on anything that is not Han, ASCII letter or digit and keep tokens of
/// at least two characters.
pub fn extract_keywords(text: &str, max: usize) -> Vec<String> {
    NON_WORD_RE
        .replace_all(text, " ")
        .split_whitespace()
        .filter(|token| char_len(token) >= 2)
        .take(max)
        .map(str::to_string)
        .collect()
}

/// How many of `keywords` occur as substrings of `text`.
pub fn count_hits<S: AsRef<str>>(text: &str, keywords: &[S]) -> usize {
    if text.is_empty() {
        return 0;
    }
    keywords
        .iter()
        .filter(|kw| {
            let kw = kw.as_ref();
            !kw.is_empty() && text.contains(kw)
        })
        .count()
}

/// Whether the text contains an ASCII or full-width question mark.
pub fn has_question_mark(text: &str) -> bool {
    text.contains('?') || text.contains('？')
}

/// Whether the text ends with a question mark.
pub fn ends_with_question(text: &str) -> bool {
    text.trim_end().ends_with(['?', '？'])
}

/// Extract the first JSON object from model output.
///
/// Tries the whole string first, then the span from the first `{` to the last
/// `}` so that prose or code fences around the object are tolerated.
pub fn extract_json_object(raw: &str) -> Option<serde_json::Value> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(value @ serde_json::Value::Object(_)) = serde_json::from_str(raw) {
        return Some(value);
    }
    let start = raw.find('{')?;
    let end = raw.rfind('}')?;
    if end <= start {
        return None;
    }
    match serde_json::from_str(&raw[start..=end]) {
        Ok(value @ serde_json::Value::Object(_)) => Some(value),
        _ => None,
    }
}

fn normalize_for_similarity(text: &str) -> Vec<char> {
    text.chars()
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_alphanumeric())
        .collect()
}

fn bigrams(text: &str) -> HashSet<(char, char)> {
    let chars = normalize_for_similarity(text);
    let mut grams = HashSet::new();
    for pair in chars.windows(2) {
        grams.insert((pair[0], pair[1]));
        if grams.len() >= MAX_NGRAMS {
            break;
        }
    }
    grams
}

/// Jaccard similarity of character bigrams, in `[0, 1]`.
pub fn text_similarity(a: &str, b: &str) -> f64 {
    let ga = bigrams(a);
    let gb = bigrams(b);
    if ga.is_empty() || gb.is_empty() {
        return 0.0;
    }
    let intersection = ga.intersection(&gb).count();
    let union = ga.len() + gb.len() - intersection;
    if union == 0 {
        return 0.0;
    }
    intersection as f64 / union as f64
}

/// File-name-safe slug (keeps Han, ASCII word chars and `-`).
pub fn safe_slug(text: &str, max_chars: usize) -> String {
    let slug: String = text
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' || ('\u{4e00}'..='\u{9fa5}').contains(&c)
            {
                c
            } else {
                '_'
            }
        })
        .take(max_chars)
        .collect();
    if slug.is_empty() {
        "untitled".to_string()
    } else {
        slug
    }
}
