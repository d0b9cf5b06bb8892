//! Permission tiers.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// How much of the host an extension may reach.
///
/// Tiers are ordered: `Limited < Partial < Full`. Each tier's capability
/// graph contains every service of the tiers below it.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum PermissionLevel {
    /// Settings access and toasts only.
    #[default]
    Limited,
    /// Adds scoped style injection and markup parsing.
    Partial,
    /// Adds cross-extension introspection and the rendering toolkit.
    Full,
}

impl PermissionLevel {
    /// All tiers in ascending order.
    pub const ALL: [Self; 3] = [Self::Limited, Self::Partial, Self::Full];

    /// The lowercase name used in persisted state.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Limited => "limited",
            Self::Partial => "partial",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for PermissionLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PermissionLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "limited" => Ok(Self::Limited),
            "partial" => Ok(Self::Partial),
            "full" => Ok(Self::Full),
            other => Err(format!(
                "unknown permission level '{other}' (expected limited, partial or full)"
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tiers_are_ordered() {
        assert!(PermissionLevel::Limited < PermissionLevel::Partial);
        assert!(PermissionLevel::Partial < PermissionLevel::Full);
        assert_eq!(PermissionLevel::default(), PermissionLevel::Limited);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("FULL".parse::<PermissionLevel>(), Ok(PermissionLevel::Full));
        assert_eq!(
            " partial ".parse::<PermissionLevel>(),
            Ok(PermissionLevel::Partial)
        );
        assert!("admin".parse::<PermissionLevel>().is_err());
    }

    #[test]
    fn serializes_lowercase() {
        let json = serde_json::to_string(&PermissionLevel::Partial).unwrap();
        assert_eq!(json, "\"partial\"");
    }
}
