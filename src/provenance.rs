//! Provenance and overwrite precedence
//!
//! Every piece of shared ontology metadata remembers who produced it and who
//! last touched it. Writers consult [`ProvenanceGuard`] before persisting so a
//! machine-inferred value can never clobber a human edit.

use crate::error::AppError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Who produced a value.
///
/// Variants are declared lowest precedence first so the derived `Ord`
/// is the overwrite ladder: `Manual > Mcp > Inferred > Unknown`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Provenance {
    #[default]
    Unknown,
    Inferred,
    Mcp,
    Manual,
}

impl Provenance {
    pub fn as_str(&self) -> &'static str {
        match self {
            Provenance::Unknown => "",
            Provenance::Inferred => "inferred",
            Provenance::Mcp => "mcp",
            Provenance::Manual => "manual",
        }
    }

    /// Numeric rung on the precedence ladder
    pub fn precedence(&self) -> u8 {
        match self {
            Provenance::Unknown => 0,
            Provenance::Inferred => 1,
            Provenance::Mcp => 2,
            Provenance::Manual => 3,
        }
    }

    /// Source that currently owns a value: the last updater if any, else the creator
    pub fn effective(created_by: Provenance, updated_by: Option<Provenance>) -> Provenance {
        match updated_by {
            Some(updated) if updated != Provenance::Unknown => updated,
            _ => created_by,
        }
    }

    /// Whether `self` as a modifier may overwrite a value owned by `effective`
    pub fn can_modify(&self, effective: Provenance) -> bool {
        self.precedence() >= effective.precedence()
    }
}

impl FromStr for Provenance {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.trim().to_ascii_lowercase().as_str() {
            "manual" => Provenance::Manual,
            "mcp" => Provenance::Mcp,
            "inferred" => Provenance::Inferred,
            _ => Provenance::Unknown,
        })
    }
}

impl From<String> for Provenance {
    fn from(s: String) -> Self {
        s.parse().unwrap_or_default()
    }
}

impl From<Provenance> for String {
    fn from(p: Provenance) -> Self {
        p.as_str().to_string()
    }
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Unknown => write!(f, "unknown"),
            other => write!(f, "{}", other.as_str()),
        }
    }
}

/// Gate consulted by every writer of entity/relationship metadata
pub struct ProvenanceGuard;

impl ProvenanceGuard {
    /// Reject the write with [`AppError::PrecedenceViolation`] if `modifier`
    /// ranks below the element's effective source
    pub fn check(
        what: &str,
        created_by: Provenance,
        updated_by: Option<Provenance>,
        modifier: Provenance,
    ) -> Result<(), AppError> {
        let effective = Provenance::effective(created_by, updated_by);
        if modifier.can_modify(effective) {
            return Ok(());
        }
        Err(AppError::PrecedenceViolation(format!(
            "{} was last written by {} and cannot be changed by {}",
            what, effective, modifier
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL: [Provenance; 4] = [
        Provenance::Unknown,
        Provenance::Inferred,
        Provenance::Mcp,
        Provenance::Manual,
    ];

    #[test]
    fn test_precedence_ladder() {
        assert_eq!(Provenance::Manual.precedence(), 3);
        assert_eq!(Provenance::Mcp.precedence(), 2);
        assert_eq!(Provenance::Inferred.precedence(), 1);
        assert_eq!(Provenance::Unknown.precedence(), 0);
        assert!(Provenance::Manual > Provenance::Mcp);
        assert!(Provenance::Mcp > Provenance::Inferred);
        assert!(Provenance::Inferred > Provenance::Unknown);
    }

    #[test]
    fn test_can_modify_is_monotonic_in_precedence() {
        for effective in ALL {
            for modifier in ALL {
                assert_eq!(
                    modifier.can_modify(effective),
                    modifier.precedence() >= effective.precedence(),
                    "{} over {}",
                    modifier,
                    effective
                );
            }
        }
    }

    #[test]
    fn test_manual_always_wins() {
        for effective in ALL {
            assert!(Provenance::Manual.can_modify(effective));
        }
    }

    #[test]
    fn test_unknown_owner_accepts_any_modifier() {
        for modifier in [Provenance::Inferred, Provenance::Mcp, Provenance::Manual] {
            assert!(modifier.can_modify(Provenance::Unknown));
        }
    }

    #[test]
    fn test_effective_source_prefers_updater() {
        assert_eq!(
            Provenance::effective(Provenance::Inferred, Some(Provenance::Manual)),
            Provenance::Manual
        );
        assert_eq!(
            Provenance::effective(Provenance::Manual, None),
            Provenance::Manual
        );
        // An empty updater tag falls back to the creator
        assert_eq!(
            Provenance::effective(Provenance::Mcp, Some(Provenance::Unknown)),
            Provenance::Mcp
        );
    }

    #[test]
    fn test_parse_tags() {
        assert_eq!("manual".parse::<Provenance>().unwrap(), Provenance::Manual);
        assert_eq!("MCP".parse::<Provenance>().unwrap(), Provenance::Mcp);
        assert_eq!("inferred".parse::<Provenance>().unwrap(), Provenance::Inferred);
        assert_eq!("".parse::<Provenance>().unwrap(), Provenance::Unknown);
        assert_eq!("robot".parse::<Provenance>().unwrap(), Provenance::Unknown);
    }

    #[test]
    fn test_guard_rejects_lower_modifier() {
        let err = ProvenanceGuard::check(
            "entity Order",
            Provenance::Inferred,
            Some(Provenance::Manual),
            Provenance::Mcp,
        )
        .unwrap_err();
        assert!(matches!(err, AppError::PrecedenceViolation(_)));

        assert!(ProvenanceGuard::check(
            "entity Order",
            Provenance::Manual,
            None,
            Provenance::Manual
        )
        .is_ok());
    }

    #[test]
    fn test_serde_roundtrip_uses_tags() {
        let json = serde_json::to_string(&Provenance::Mcp).unwrap();
        assert_eq!(json, "\"mcp\"");
        let parsed: Provenance = serde_json::from_str("\"\"").unwrap();
        assert_eq!(parsed, Provenance::Unknown);
    }
}
