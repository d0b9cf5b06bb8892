//! Addon manifest discovery.
//!
//! Each addon lives in its own sub-directory of the plugins or themes
//! directory and is described by an `addon.toml`:
//!
//! ```toml
//! id = "word-count"
//! name = "Word Count"
//! version = "1.0.0"
//! author = "Quill"
//! entry = "main.rhai"          # defaults to main.rhai / theme.css
//!
//! [[variables]]                # themes only
//! name = "--accent"
//! default = "#f80"
//! ```
//!
//! Broken manifests are logged and skipped; they never prevent the other
//! addons in the directory from loading.

use std::collections::HashSet;
use std::path::{Component, Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::descriptor::{AddonDescriptor, AddonId, AddonKind, StyleVariable};
use crate::error::{AddonError, AddonResult};

/// Manifest file name inside each addon directory.
pub const MANIFEST_FILE_NAME: &str = "addon.toml";

/// Script file a plugin manifest points at when it names no `entry`.
pub const DEFAULT_PLUGIN_ENTRY: &str = "main.rhai";

/// Stylesheet a theme manifest points at when it names no `entry`.
pub const DEFAULT_THEME_ENTRY: &str = "theme.css";

/// On-disk `addon.toml` contents.
#[derive(Debug, Clone, Deserialize)]
pub struct AddonManifest {
    /// Addon id. Defaults to the directory name.
    #[serde(default)]
    pub id: Option<AddonId>,
    /// Display name.
    pub name: String,
    /// Semantic version.
    pub version: String,
    /// Author.
    #[serde(default)]
    pub author: String,
    /// Free-text description.
    #[serde(default)]
    pub description: String,
    /// Source repository link.
    #[serde(default)]
    pub source_url: Option<String>,
    /// Website link.
    #[serde(default)]
    pub website: Option<String>,
    /// Script or stylesheet file, relative to the addon directory.
    #[serde(default)]
    pub entry: Option<PathBuf>,
    /// Overridable style variables (themes only).
    #[serde(default)]
    pub variables: Vec<StyleVariable>,
}

impl AddonManifest {
    /// Turn the manifest of the addon in `addon_dir` into a descriptor.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::ManifestParseError`] if the id cannot be derived
    /// or the entry escapes the addon directory.
    pub fn into_descriptor(self, addon_dir: &Path, kind: AddonKind) -> AddonResult<AddonDescriptor> {
        let manifest_path = addon_dir.join(MANIFEST_FILE_NAME);
        let invalid = |message: String| AddonError::ManifestParseError {
            path: manifest_path.clone(),
            message,
        };

        let id = match self.id {
            Some(id) => id,
            None => {
                let dir_name = addon_dir
                    .file_name()
                    .and_then(|n| n.to_str())
                    .unwrap_or_default();
                AddonId::new(dir_name).map_err(|e| invalid(e.to_string()))?
            },
        };

        let entry = self.entry.unwrap_or_else(|| {
            PathBuf::from(match kind {
                AddonKind::Plugin => DEFAULT_PLUGIN_ENTRY,
                AddonKind::Theme => DEFAULT_THEME_ENTRY,
            })
        });
        if !entry
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(invalid(format!(
                "entry must be a relative path inside the addon directory, got {}",
                entry.display()
            )));
        }

        if kind == AddonKind::Plugin && !self.variables.is_empty() {
            warn!(addon_id = %id, "Plugin manifest declares style variables, ignoring them");
        }
        let variables = match kind {
            AddonKind::Theme => self.variables,
            AddonKind::Plugin => Vec::new(),
        };
        if let Some(bad) = variables.iter().find(|v| !v.name.starts_with("--")) {
            return Err(invalid(format!(
                "style variable names must start with '--', got {}",
                bad.name
            )));
        }

        Ok(AddonDescriptor {
            id,
            name: self.name,
            author: self.author,
            version: self.version,
            description: self.description,
            source_url: self.source_url,
            website: self.website,
            location: addon_dir.join(entry),
            kind,
            variables,
        })
    }
}

/// Load all addon descriptors of one kind from `dir`.
///
/// A missing directory yields no addons.
///
/// # Errors
///
/// Returns [`AddonError::EnumerateFailed`] if `dir` exists but cannot be
/// read.
pub fn discover(dir: &Path, kind: AddonKind) -> AddonResult<Vec<AddonDescriptor>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %dir.display(), "Addon directory does not exist");
            return Ok(Vec::new());
        },
        Err(e) => {
            return Err(AddonError::EnumerateFailed {
                path: dir.to_path_buf(),
                message: e.to_string(),
            });
        },
    };

    // Sorted so the first of several duplicate ids wins deterministically.
    let mut addon_dirs: Vec<PathBuf> = entries.filter_map(|e| e.ok().map(|e| e.path())).collect();
    addon_dirs.sort();

    let mut descriptors = Vec::new();
    let mut seen = HashSet::new();
    for addon_dir in addon_dirs {
        if !addon_dir.is_dir() {
            continue;
        }
        let manifest_path = addon_dir.join(MANIFEST_FILE_NAME);
        if !manifest_path.exists() {
            continue;
        }

        let descriptor = load_manifest(&manifest_path)
            .and_then(|manifest| manifest.into_descriptor(&addon_dir, kind));
        match descriptor {
            Ok(descriptor) => {
                if !seen.insert(descriptor.id.clone()) {
                    warn!(
                        path = %manifest_path.display(),
                        addon_id = %descriptor.id,
                        "Duplicate addon id, skipping"
                    );
                    continue;
                }
                debug!(path = %manifest_path.display(), addon_id = %descriptor.id, "Loaded addon manifest");
                descriptors.push(descriptor);
            },
            Err(e) => {
                warn!(path = %manifest_path.display(), error = %e, "Failed to load addon manifest");
            },
        }
    }

    descriptors.sort_by(|a, b| a.id.cmp(&b.id));
    info!(path = %dir.display(), %kind, count = descriptors.len(), "Discovered addons");
    Ok(descriptors)
}

/// Load a single manifest from a TOML file.
///
/// # Errors
///
/// Returns [`AddonError::ManifestParseError`] if the file cannot be read or
/// parsed.
pub fn load_manifest(path: &Path) -> AddonResult<AddonManifest> {
    let content = std::fs::read_to_string(path).map_err(|e| AddonError::ManifestParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    toml::from_str(&content).map_err(|e| AddonError::ManifestParseError {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}
