//! Persona skill profiles.
//!
//! Skills are soft traits in `[0.05, 0.95]` that bias state transitions and
//! reward shaping in [`crate::dynamics`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::persona::{PerPersona, Persona};

pub const SKILL_MIN: f64 = 0.05;
pub const SKILL_MAX: f64 = 0.95;
const SKILL_FALLBACK: f64 = 0.6;

/// Clamp a skill value into the valid range; non-finite values fall back to 0.6.
pub fn clamp_skill(value: f64) -> f64 {
    if !value.is_finite() {
        return SKILL_FALLBACK;
    }
    value.clamp(SKILL_MIN, SKILL_MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SkillProfile {
    pub pressure_awareness: f64,
    pub commitment: f64,
    pub aggression: f64,
    pub recovery: f64,
    pub evidence_control: f64,
}

impl Default for SkillProfile {
    fn default() -> Self {
        Self {
            pressure_awareness: 0.6,
            commitment: 0.6,
            aggression: 0.6,
            recovery: 0.6,
            evidence_control: 0.5,
        }
    }
}

impl SkillProfile {
    /// Copy with every field clamped into `[0.05, 0.95]`.
    pub fn normalized(self) -> Self {
        Self {
            pressure_awareness: clamp_skill(self.pressure_awareness),
            commitment: clamp_skill(self.commitment),
            aggression: clamp_skill(self.aggression),
            recovery: clamp_skill(self.recovery),
            evidence_control: clamp_skill(self.evidence_control),
        }
    }
}

/// Parse a skills document.
///
/// Accepts `{"P1": {...}, "P2": {...}}` or the legacy `{"A": ..., "B": ...}`
/// layout; missing personas or fields take defaults.
pub fn parse_skills(raw: &str) -> Result<PerPersona<SkillProfile>, serde_json::Error> {
    let value: serde_json::Value = serde_json::from_str(raw)?;
    let mut skills = PerPersona::splat(SkillProfile::default());
    if let serde_json::Value::Object(map) = value {
        for (key, entry) in map {
            let Some(persona) = Persona::from_tag(&key) else {
                continue;
            };
            let profile: SkillProfile = serde_json::from_value(entry)?;
            skills[persona] = profile;
        }
    }
    Ok(skills.map(|_, s| s.normalized()))
}

/// Load skills from `path`, falling back to defaults when the file is absent
/// or unreadable.
pub fn load_skills(path: &Path) -> PerPersona<SkillProfile> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return PerPersona::splat(SkillProfile::default()),
    };
    match parse_skills(&raw) {
        Ok(skills) => skills,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Invalid skills file, using defaults");
            PerPersona::splat(SkillProfile::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clamp_skill() {
        assert_eq!(clamp_skill(1.5), SKILL_MAX);
        assert_eq!(clamp_skill(-1.0), SKILL_MIN);
        assert_eq!(clamp_skill(f64::NAN), 0.6);
    }

    #[test]
    fn test_parse_skills_legacy_and_partial() {
        let skills = parse_skills(r#"{"A": {"commitment": 0.99}, "B": {"recovery": 0.2}}"#).unwrap();
        assert_eq!(skills.p1.commitment, SKILL_MAX);
        assert_eq!(skills.p1.aggression, 0.6);
        assert_eq!(skills.p2.recovery, 0.2);
        assert_eq!(skills.p2.evidence_control, 0.5);
    }

    #[test]
    fn test_load_skills_missing_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let skills = load_skills(&dir.path().join("skills.json"));
        assert_eq!(skills.p1, SkillProfile::default());
    }

    #[test]
    fn test_load_skills_invalid_file_uses_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("skills.json");
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_skills(&path).p2, SkillProfile::default());
    }
}
