//! Debate participants and the two-slot container used for per-persona data.

use std::ops::{Index, IndexMut};

use serde::{Deserialize, Serialize};

/// One of the two scripted debate participants.
///
/// P1 argues the affirmative side, P2 the negative side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Persona {
    P1,
    P2,
}

impl Persona {
    /// Both personas in canonical order.
    pub const ALL: [Persona; 2] = [Persona::P1, Persona::P2];

    /// The other participant.
    pub fn opponent(self) -> Persona {
        match self {
            Self::P1 => Self::P2,
            Self::P2 => Self::P1,
        }
    }

    /// Stable tag used in transcripts and state files.
    pub fn tag(self) -> &'static str {
        match self {
            Self::P1 => "P1",
            Self::P2 => "P2",
        }
    }

    /// Debate side label shown to the model.
    pub fn side(self) -> &'static str {
        match self {
            Self::P1 => "正方",
            Self::P2 => "反方",
        }
    }

    /// Parse a persona tag. Accepts the legacy `A`/`B` tags as well.
    pub fn from_tag(tag: &str) -> Option<Persona> {
        match tag.trim() {
            "P1" | "p1" | "A" | "a" => Some(Self::P1),
            "P2" | "p2" | "B" | "b" => Some(Self::P2),
            _ => None,
        }
    }
}

impl std::fmt::Display for Persona {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.tag())
    }
}

/// A value held once for each persona.
///
/// Serializes as `{"P1": ..., "P2": ...}` so state files stay readable.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerPersona<T> {
    #[serde(rename = "P1")]
    pub p1: T,
    #[serde(rename = "P2")]
    pub p2: T,
}

impl<T> PerPersona<T> {
    pub fn new(p1: T, p2: T) -> Self {
        Self { p1, p2 }
    }

    /// Build both slots from a constructor that receives the persona.
    pub fn from_fn(mut f: impl FnMut(Persona) -> T) -> Self {
        Self {
            p1: f(Persona::P1),
            p2: f(Persona::P2),
        }
    }

    pub fn get(&self, persona: Persona) -> &T {
        match persona {
            Persona::P1 => &self.p1,
            Persona::P2 => &self.p2,
        }
    }

    pub fn get_mut(&mut self, persona: Persona) -> &mut T {
        match persona {
            Persona::P1 => &mut self.p1,
            Persona::P2 => &mut self.p2,
        }
    }

    pub fn map<U>(&self, mut f: impl FnMut(Persona, &T) -> U) -> PerPersona<U> {
        PerPersona {
            p1: f(Persona::P1, &self.p1),
            p2: f(Persona::P2, &self.p2),
        }
    }

    /// Iterate `(persona, value)` pairs in canonical order.
    pub fn iter(&self) -> impl Iterator<Item = (Persona, &T)> {
        [(Persona::P1, &self.p1), (Persona::P2, &self.p2)].into_iter()
    }
}

impl<T: Clone> PerPersona<T> {
    pub fn splat(value: T) -> Self {
        Self {
            p1: value.clone(),
            p2: value,
        }
    }
}

impl<T> Index<Persona> for PerPersona<T> {
    type Output = T;

    fn index(&self, persona: Persona) -> &T {
        self.get(persona)
    }
}

impl<T> IndexMut<Persona> for PerPersona<T> {
    fn index_mut(&mut self, persona: Persona) -> &mut T {
        self.get_mut(persona)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_opponent_is_involution() {
        for p in Persona::ALL {
            assert_ne!(p, p.opponent());
            assert_eq!(p, p.opponent().opponent());
        }
    }

    #[test]
    fn test_from_tag_accepts_legacy_letters() {
        assert_eq!(Persona::from_tag("A"), Some(Persona::P1));
        assert_eq!(Persona::from_tag(" P2 "), Some(Persona::P2));
        assert_eq!(Persona::from_tag("tie"), None);
    }

    #[test]
    fn test_per_persona_serializes_with_tags() {
        let pair = PerPersona::new(1u32, 2u32);
        let json = serde_json::to_string(&pair).unwrap();
        assert_eq!(json, r#"{"P1":1,"P2":2}"#);
        let back: PerPersona<u32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back[Persona::P2], 2);
    }

    #[test]
    fn test_index_mut() {
        let mut pair = PerPersona::splat(0u32);
        pair[Persona::P2] += 5;
        assert_eq!(pair.p2, 5);
        assert_eq!(pair.p1, 0);
    }
}
