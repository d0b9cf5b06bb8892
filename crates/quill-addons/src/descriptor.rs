//! Addon identity and descriptor types.

use std::fmt;
use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AddonError, AddonResult};

/// Unique, stable, human-readable addon identifier.
///
/// Addon IDs are strings like `"word-count"` or `"solarized-dark"`. They must
/// be non-empty and contain only lowercase alphanumeric characters and
/// hyphens.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct AddonId(String);

/// Deserialize with validation so crafted manifests cannot smuggle path
/// separators into ids.
impl<'de> Deserialize<'de> for AddonId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl AddonId {
    /// Create a new `AddonId`, validating the format.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty or contains invalid characters.
    pub fn new(id: impl Into<String>) -> AddonResult<Self> {
        let id = id.into();
        Self::validate(&id)?;
        Ok(Self(id))
    }

    /// Create an `AddonId` without validation (for tests and internal use).
    #[must_use]
    pub fn from_static(id: &str) -> Self {
        Self(id.to_string())
    }

    /// Get the inner string value.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn validate(id: &str) -> AddonResult<()> {
        if id.is_empty() {
            return Err(AddonError::InvalidId("addon id must not be empty".into()));
        }
        if !id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-')
        {
            return Err(AddonError::InvalidId(format!(
                "addon id must contain only lowercase alphanumeric characters and hyphens, got: {id}"
            )));
        }
        if id.starts_with('-') || id.ends_with('-') {
            return Err(AddonError::InvalidId(format!(
                "addon id must not start or end with a hyphen, got: {id}"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for AddonId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for AddonId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Whether an addon is executable or declarative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddonKind {
    /// A script with optional lifecycle hooks.
    Plugin,
    /// A stylesheet with user-overridable variables.
    Theme,
}

impl fmt::Display for AddonKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plugin => f.write_str("plugin"),
            Self::Theme => f.write_str("theme"),
        }
    }
}

/// A style variable a theme declares as user-overridable.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StyleVariable {
    /// Custom property name including the leading `--`.
    pub name: String,
    /// Value shipped by the theme.
    pub default: String,
    /// Shown next to the value in settings surfaces.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Immutable metadata for one plugin or theme.
///
/// Created by discovery and replaced wholesale when the addon is reloaded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddonDescriptor {
    /// Stable identifier.
    pub id: AddonId,
    /// Human-readable display name.
    pub name: String,
    /// Author shown in listings.
    #[serde(default)]
    pub author: String,
    /// Semantic version string.
    pub version: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Link to the addon's source repository.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,
    /// Link to the addon's website.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    /// Location of the plugin script or theme stylesheet.
    pub location: PathBuf,
    /// Plugin or theme.
    pub kind: AddonKind,
    /// Overridable variables (themes only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variables: Vec<StyleVariable>,
}

impl AddonDescriptor {
    /// Look up a declared style variable by name.
    #[must_use]
    pub fn variable(&self, name: &str) -> Option<&StyleVariable> {
        self.variables.iter().find(|v| v.name == name)
    }

    /// Whether a changed file (relative to the addon root directory) belongs
    /// to this addon.
    ///
    /// The path must lie inside this addon's directory; bare files at the
    /// root never match.
    #[must_use]
    pub fn matches_changed_file(&self, changed: &Path) -> bool {
        let Some(dir_name) = self.location.parent().and_then(Path::file_name) else {
            return false;
        };
        let mut components = changed.components();
        let first = components.next();
        components.next().is_some()
            && matches!(first, Some(Component::Normal(name)) if name == dir_name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn theme() -> AddonDescriptor {
        AddonDescriptor {
            id: AddonId::from_static("dusk"),
            name: "Dusk".into(),
            author: "Quill".into(),
            version: "1.0.0".into(),
            description: String::new(),
            source_url: None,
            website: None,
            location: PathBuf::from("/home/u/.quill/themes/dusk/theme.css"),
            kind: AddonKind::Theme,
            variables: vec![StyleVariable {
                name: "--accent".into(),
                default: "#f80".into(),
                description: None,
            }],
        }
    }

    #[test]
    fn test_valid_addon_ids() {
        assert!(AddonId::new("word-count").is_ok());
        assert!(AddonId::new("theme2").is_ok());
        assert!(AddonId::new("a").is_ok());
    }

    #[test]
    fn test_invalid_addon_ids() {
        assert!(AddonId::new("").is_err());
        assert!(AddonId::new("WordCount").is_err());
        assert!(AddonId::new("word count").is_err());
        assert!(AddonId::new("../etc").is_err());
        assert!(AddonId::new("-lead").is_err());
        assert!(AddonId::new("trail-").is_err());
    }

    #[test]
    fn test_addon_id_rejected_on_deserialize() {
        assert!(serde_json::from_str::<AddonId>("\"ok-id\"").is_ok());
        assert!(serde_json::from_str::<AddonId>("\"Not/Ok\"").is_err());
    }

    #[test]
    fn changed_file_matching() {
        let d = theme();
        assert!(d.matches_changed_file(Path::new("dusk/theme.css")));
        assert!(!d.matches_changed_file(Path::new("theme.css")));
        assert!(d.matches_changed_file(Path::new("dusk/addon.toml")));
        assert!(d.matches_changed_file(Path::new("dusk/assets/extra.css")));
        assert!(!d.matches_changed_file(Path::new("dusk")));
        assert!(!d.matches_changed_file(Path::new("dawn/theme.css")));
        assert!(!d.matches_changed_file(Path::new("other.css")));
        assert!(!d.matches_changed_file(Path::new("")));
    }

    #[test]
    fn variable_lookup() {
        let d = theme();
        assert_eq!(d.variable("--accent").unwrap().default, "#f80");
        assert!(d.variable("--missing").is_none());
    }
}
