//! Persisted addon state and its write-through store.
//!
//! [`AddonState`] is the document written through [`AddonFs::save_state`].
//! [`StateStore`] holds it in memory and writes it back after every
//! mutation. Saves are serialized, retried once on failure, and a failed
//! save leaves the store dirty so the next write carries the change.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::descriptor::AddonId;
use crate::error::AddonResult;
use crate::host::AddonFs;
use crate::permission::PermissionLevel;

/// Per-extension settings bag.
pub type SettingsBag = BTreeMap<String, Value>;

/// The persisted record of enablement, permissions, settings and overrides.
///
/// The schema is additive: every field defaults to empty, and
/// [`AddonState::from_value`] accepts documents of any shape.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AddonState {
    /// Plugins that were started when the state was last written.
    #[serde(default)]
    pub enabled_plugins: Vec<AddonId>,
    /// Themes that were enabled when the state was last written.
    #[serde(default)]
    pub enabled_themes: Vec<AddonId>,
    /// Permission tier per extension. Absent means `limited`.
    #[serde(default)]
    pub permissions: BTreeMap<AddonId, PermissionLevel>,
    /// Settings per extension.
    #[serde(default)]
    pub settings: BTreeMap<AddonId, SettingsBag>,
    /// Style-variable overrides per theme.
    #[serde(default)]
    pub css_variables: BTreeMap<AddonId, BTreeMap<String, String>>,
}

impl AddonState {
    /// Build state from a stored document of unknown shape.
    ///
    /// Missing or malformed fields default to empty; malformed entries inside
    /// a field are dropped individually. Camel-case field names written by
    /// older hosts are accepted.
    #[must_use]
    pub fn from_value(value: Value) -> Self {
        let mut obj = match value {
            Value::Object(obj) => obj,
            Value::Null => return Self::default(),
            other => {
                warn!(kind = %json_kind(&other), "Addon state is not an object, using defaults");
                return Self::default();
            },
        };

        Self {
            enabled_plugins: id_list(take_field(&mut obj, "enabled_plugins", "enabledPlugins")),
            enabled_themes: id_list(take_field(&mut obj, "enabled_themes", "enabledThemes")),
            permissions: id_map(take_field(&mut obj, "permissions", "permissions"), |v| {
                v.as_str().and_then(|s| s.parse().ok())
            }),
            settings: id_map(take_field(&mut obj, "settings", "settings"), |v| match v {
                Value::Object(map) => Some(map.into_iter().collect()),
                _ => None,
            }),
            css_variables: id_map(take_field(&mut obj, "css_variables", "cssVariables"), |v| {
                match v {
                    Value::Object(map) => Some(
                        map.into_iter()
                            .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                            .collect(),
                    ),
                    _ => None,
                }
            }),
        }
    }

    /// Whether a plugin is in the enabled list.
    #[must_use]
    pub fn is_plugin_enabled(&self, id: &AddonId) -> bool {
        self.enabled_plugins.contains(id)
    }

    /// Whether a theme is in the enabled list.
    #[must_use]
    pub fn is_theme_enabled(&self, id: &AddonId) -> bool {
        self.enabled_themes.contains(id)
    }

    /// Add a plugin to the enabled list. Returns `false` if already present.
    pub fn enable_plugin(&mut self, id: &AddonId) -> bool {
        push_unique(&mut self.enabled_plugins, id)
    }

    /// Remove a plugin from the enabled list. Returns `false` if absent.
    pub fn disable_plugin(&mut self, id: &AddonId) -> bool {
        remove_all(&mut self.enabled_plugins, id)
    }

    /// Add a theme to the enabled list. Returns `false` if already present.
    pub fn enable_theme(&mut self, id: &AddonId) -> bool {
        push_unique(&mut self.enabled_themes, id)
    }

    /// Remove a theme from the enabled list. Returns `false` if absent.
    pub fn disable_theme(&mut self, id: &AddonId) -> bool {
        remove_all(&mut self.enabled_themes, id)
    }

    /// The tier an extension runs at.
    #[must_use]
    pub fn permission(&self, id: &AddonId) -> PermissionLevel {
        self.permissions.get(id).copied().unwrap_or_default()
    }

    /// A single setting value.
    #[must_use]
    pub fn setting(&self, id: &AddonId, key: &str) -> Option<&Value> {
        self.settings.get(id).and_then(|bag| bag.get(key))
    }

    /// Store a setting value.
    pub fn set_setting(&mut self, id: &AddonId, key: impl Into<String>, value: Value) {
        self.settings
            .entry(id.clone())
            .or_default()
            .insert(key.into(), value);
    }

    /// Overrides recorded for a theme.
    #[must_use]
    pub fn css_overrides(&self, id: &AddonId) -> BTreeMap<String, String> {
        self.css_variables.get(id).cloned().unwrap_or_default()
    }

    /// Record a style-variable override.
    pub fn set_css_override(
        &mut self,
        id: &AddonId,
        name: impl Into<String>,
        value: impl Into<String>,
    ) {
        self.css_variables
            .entry(id.clone())
            .or_default()
            .insert(name.into(), value.into());
    }

    /// Drop a style-variable override. Returns `false` if none was recorded.
    pub fn remove_css_override(&mut self, id: &AddonId, name: &str) -> bool {
        let Some(overrides) = self.css_variables.get_mut(id) else {
            return false;
        };
        let removed = overrides.remove(name).is_some();
        if overrides.is_empty() {
            self.css_variables.remove(id);
        }
        removed
    }
}

fn push_unique(list: &mut Vec<AddonId>, id: &AddonId) -> bool {
    if list.contains(id) {
        return false;
    }
    list.push(id.clone());
    true
}

fn remove_all(list: &mut Vec<AddonId>, id: &AddonId) -> bool {
    let before = list.len();
    list.retain(|e| e != id);
    list.len() != before
}

fn take_field(obj: &mut Map<String, Value>, name: &str, alias: &str) -> Option<Value> {
    obj.remove(name).or_else(|| obj.remove(alias))
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn parse_id(raw: &str) -> Option<AddonId> {
    match AddonId::new(raw) {
        Ok(id) => Some(id),
        Err(e) => {
            warn!(id = raw, error = %e, "Dropping malformed addon id from state");
            None
        },
    }
}

fn id_list(value: Option<Value>) -> Vec<AddonId> {
    let Some(Value::Array(items)) = value else {
        return Vec::new();
    };
    let mut ids = Vec::with_capacity(items.len());
    for item in items {
        if let Some(id) = item.as_str().and_then(parse_id)
            && !ids.contains(&id)
        {
            ids.push(id);
        }
    }
    ids
}

fn id_map<T>(value: Option<Value>, convert: impl Fn(Value) -> Option<T>) -> BTreeMap<AddonId, T> {
    let Some(Value::Object(entries)) = value else {
        return BTreeMap::new();
    };
    entries
        .into_iter()
        .filter_map(|(k, v)| Some((parse_id(&k)?, convert(v)?)))
        .collect()
}

/// In-memory addon state with write-through persistence.
pub struct StateStore {
    state: RwLock<AddonState>,
    dirty: AtomicBool,
    /// Serializes saves so an older snapshot never lands after a newer one.
    write_lock: tokio::sync::Mutex<()>,
    fs: Arc<dyn AddonFs>,
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("dirty", &self.is_dirty())
            .finish_non_exhaustive()
    }
}

impl StateStore {
    /// Load persisted state, falling back to defaults if it cannot be read.
    pub async fn load(fs: Arc<dyn AddonFs>) -> Self {
        let state = match fs.load_state().await {
            Ok(value) => AddonState::from_value(value),
            Err(e) => {
                warn!(error = %e, "Failed to load addon state, using defaults");
                AddonState::default()
            },
        };
        debug!(
            enabled_plugins = state.enabled_plugins.len(),
            enabled_themes = state.enabled_themes.len(),
            "Loaded addon state"
        );
        Self::with_state(fs, state)
    }

    /// Wrap an already-built state.
    #[must_use]
    pub fn with_state(fs: Arc<dyn AddonFs>, state: AddonState) -> Self {
        Self {
            state: RwLock::new(state),
            dirty: AtomicBool::new(false),
            write_lock: tokio::sync::Mutex::new(()),
            fs,
        }
    }

    /// Clone of the current state.
    #[must_use]
    pub fn snapshot(&self) -> AddonState {
        self.read(Clone::clone)
    }

    /// Read the state under the lock.
    pub fn read<R>(&self, f: impl FnOnce(&AddonState) -> R) -> R {
        let guard = self.state.read().unwrap_or_else(PoisonError::into_inner);
        f(&guard)
    }

    /// Mutate in memory only and mark the store dirty.
    ///
    /// Used from synchronous script calls; the caller must [`flush`](Self::flush)
    /// once it is back in async context.
    pub fn apply<R>(&self, f: impl FnOnce(&mut AddonState) -> R) -> R {
        let result = {
            let mut guard = self.state.write().unwrap_or_else(PoisonError::into_inner);
            f(&mut guard)
        };
        self.dirty.store(true, Ordering::SeqCst);
        result
    }

    /// Mutate and write through before returning.
    ///
    /// A persistence failure is logged and leaves the store dirty; the
    /// in-memory change is kept either way.
    pub async fn update<R>(&self, f: impl FnOnce(&mut AddonState) -> R) -> R {
        let result = self.apply(f);
        // Failure is already logged and retried on the next write.
        let _ = self.flush().await;
        result
    }

    /// Whether in-memory changes have not been persisted yet.
    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Persist pending changes, retrying once.
    ///
    /// # Errors
    ///
    /// Returns the second failure if both attempts fail. The store stays
    /// dirty in that case.
    pub async fn flush(&self) -> AddonResult<()> {
        let _write = self.write_lock.lock().await;
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = self.snapshot();

        let first = match self.fs.save_state(&snapshot).await {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        warn!(error = %first, "Saving addon state failed, retrying once");

        match self.fs.save_state(&snapshot).await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.dirty.store(true, Ordering::SeqCst);
                warn!(
                    error = %e,
                    "Saving addon state failed again; keeping in-memory state for the next write"
                );
                Err(e)
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn id(s: &str) -> AddonId {
        AddonId::from_static(s)
    }

    #[test]
    fn from_value_defaults_missing_fields() {
        let state = AddonState::from_value(json!({ "enabled_plugins": ["a"] }));
        assert_eq!(state.enabled_plugins, vec![id("a")]);
        assert!(state.enabled_themes.is_empty());
        assert!(state.permissions.is_empty());
        assert!(state.settings.is_empty());
        assert!(state.css_variables.is_empty());
    }

    #[test]
    fn from_value_tolerates_malformed_shapes() {
        let state = AddonState::from_value(json!({
            "enabled_plugins": "not-a-list",
            "enabled_themes": ["ok", 42, "Bad Id", "ok"],
            "permissions": { "a": "full", "b": "root", "c": 7 },
            "settings": { "a": { "k": 1 }, "b": [1, 2] },
            "css_variables": { "t": { "--x": "red", "--y": 3 } },
            "future_field": true
        }));
        assert!(state.enabled_plugins.is_empty());
        assert_eq!(state.enabled_themes, vec![id("ok")]);
        assert_eq!(state.permissions.len(), 1);
        assert_eq!(state.permission(&id("a")), PermissionLevel::Full);
        assert_eq!(state.permission(&id("b")), PermissionLevel::Limited);
        assert_eq!(state.setting(&id("a"), "k"), Some(&json!(1)));
        assert!(!state.settings.contains_key(&id("b")));
        let overrides = state.css_overrides(&id("t"));
        assert_eq!(overrides.len(), 1);
        assert_eq!(overrides["--x"], "red");
    }

    #[test]
    fn from_value_accepts_camel_case() {
        let state = AddonState::from_value(json!({
            "enabledPlugins": ["p"],
            "cssVariables": { "t": { "--a": "1px" } }
        }));
        assert_eq!(state.enabled_plugins, vec![id("p")]);
        assert_eq!(state.css_overrides(&id("t"))["--a"], "1px");
    }

    #[test]
    fn from_value_non_object_is_default() {
        assert_eq!(AddonState::from_value(json!([1, 2])), AddonState::default());
        assert_eq!(AddonState::from_value(Value::Null), AddonState::default());
    }

    #[test]
    fn enable_lists_are_idempotent() {
        let mut state = AddonState::default();
        assert!(state.enable_plugin(&id("a")));
        assert!(!state.enable_plugin(&id("a")));
        assert_eq!(state.enabled_plugins.len(), 1);
        assert!(state.disable_plugin(&id("a")));
        assert!(!state.disable_plugin(&id("a")));
    }

    #[test]
    fn css_override_removal_prunes_empty_maps() {
        let mut state = AddonState::default();
        state.set_css_override(&id("t"), "--a", "red");
        assert!(state.remove_css_override(&id("t"), "--a"));
        assert!(state.css_variables.is_empty());
        assert!(!state.remove_css_override(&id("t"), "--a"));
    }

    #[test]
    fn state_round_trips_through_from_value() {
        let mut state = AddonState::default();
        state.enable_plugin(&id("p"));
        state.enable_theme(&id("t"));
        state.permissions.insert(id("p"), PermissionLevel::Partial);
        state.set_setting(&id("p"), "count", json!(3));
        state.set_css_override(&id("t"), "--bg", "#000");
        let value = serde_json::to_value(&state).unwrap();
        assert_eq!(AddonState::from_value(value), state);
    }
}
