//! Plugin manager.
//!
//! Loads plugin scripts, runs their lifecycle hooks, and records the outcome
//! on a per-plugin entry. A plugin that fails to read, compile or evaluate
//! stays listed with its error; it never takes other plugins down with it.
//!
//! Lifecycle per id: `unloaded -> loaded -> started <-> stopped`, with reload
//! going back to `loaded` from any state. Operations on one id are serialized
//! by an in-flight claim; contending start/stop calls return `false` and a
//! contending reload is coalesced into the one already running.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard, Weak};
use std::time::Duration;

use rhai::Dynamic;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::{
    Capability, CapabilityContext, CapabilityGraph, OwnedStyles, PluginDirectory, PluginSummary,
};
use crate::descriptor::{AddonDescriptor, AddonId};
use crate::error::{AddonError, AddonResult};
use crate::guard::{InFlight, ReloadOutcome};
use crate::host::{AddonFs, RenderSurface, read_within};
use crate::permission::PermissionLevel;
use crate::script::{
    Exports, SETTINGS_HOOK, SETTINGS_PANEL_HOOK, START_HOOK, STOP_HOOK, ScriptLimits, ScriptUnit,
    UnitCell,
};
use crate::state::StateStore;

/// Input control a settings entry asks the host to render.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettingKind {
    /// Free text.
    #[default]
    Text,
    /// Numeric input.
    Number,
    /// On/off switch.
    Toggle,
    /// One of `options`.
    Select,
}

/// One entry of a plugin's settings definition list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SettingDef {
    /// Key in the plugin's settings bag.
    pub key: String,
    /// Label shown next to the control.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// Control kind.
    #[serde(default, alias = "type")]
    pub kind: SettingKind,
    /// Value used when the bag has no entry for `key`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Help text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Choices for [`SettingKind::Select`].
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub options: Vec<String>,
}

/// Snapshot of a plugin's runtime record.
#[derive(Debug, Clone, PartialEq)]
pub struct PluginInstance {
    /// Descriptor the plugin was loaded from.
    pub descriptor: AddonDescriptor,
    /// Functions the script defines. Empty when loading failed.
    pub exports: Exports,
    /// Tier the plugin was loaded with.
    pub permission: PermissionLevel,
    /// Services installed for the plugin. Empty when loading failed.
    pub capabilities: Vec<Capability>,
    /// Whether the script compiled and its top level ran.
    pub loaded: bool,
    /// Whether the `start` hook has run successfully and `stop` has not.
    pub started: bool,
    /// Most recent load or hook failure.
    pub error: Option<String>,
}

impl PluginInstance {
    /// Plugin id.
    #[must_use]
    pub fn id(&self) -> &AddonId {
        &self.descriptor.id
    }
}

struct PluginEntry {
    descriptor: AddonDescriptor,
    level: PermissionLevel,
    unit: Option<Arc<ScriptUnit>>,
    styles: OwnedStyles,
    started: bool,
    error: Option<String>,
}

impl PluginEntry {
    fn snapshot(&self) -> PluginInstance {
        PluginInstance {
            descriptor: self.descriptor.clone(),
            exports: self.unit.as_ref().map(|u| u.exports()).unwrap_or_default(),
            permission: self.level,
            capabilities: self
                .unit
                .as_ref()
                .map(|u| u.members().to_vec())
                .unwrap_or_default(),
            loaded: self.unit.is_some(),
            started: self.started,
            error: self.error.clone(),
        }
    }

    fn summary(&self) -> PluginSummary {
        PluginSummary {
            id: self.descriptor.id.clone(),
            name: self.descriptor.name.clone(),
            version: self.descriptor.version.clone(),
            author: self.descriptor.author.clone(),
            description: self.descriptor.description.clone(),
            started: self.started,
            permission: self.level,
        }
    }
}

struct PluginsInner {
    fs: Arc<dyn AddonFs>,
    store: Arc<StateStore>,
    surface: Arc<dyn RenderSurface>,
    limits: ScriptLimits,
    load_timeout: Duration,
    entries: RwLock<BTreeMap<AddonId, PluginEntry>>,
    in_flight: InFlight,
}

impl PluginsInner {
    fn entries(&self) -> RwLockReadGuard<'_, BTreeMap<AddonId, PluginEntry>> {
        self.entries.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<AddonId, PluginEntry>> {
        self.entries.write().unwrap_or_else(PoisonError::into_inner)
    }
}

/// The `plugins` service sees the manager through a weak reference so that
/// plugin engines do not keep the manager alive.
struct DirectoryView(Weak<PluginsInner>);

impl PluginDirectory for DirectoryView {
    fn describe(&self, id: &AddonId) -> Option<PluginSummary> {
        let inner = self.0.upgrade()?;
        let entries = inner.entries();
        entries.get(id).map(PluginEntry::summary)
    }

    fn describe_all(&self) -> Vec<PluginSummary> {
        let Some(inner) = self.0.upgrade() else {
            return Vec::new();
        };
        let entries = inner.entries();
        entries.values().map(PluginEntry::summary).collect()
    }

    fn is_enabled(&self, id: &AddonId) -> bool {
        self.0
            .upgrade()
            .is_some_and(|inner| inner.store.read(|s| s.is_plugin_enabled(id)))
    }
}

/// Loads, starts, stops and reloads plugin scripts.
///
/// Cheap to clone; clones share the same plugin table.
#[derive(Clone)]
pub struct PluginManager {
    inner: Arc<PluginsInner>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginManager")
            .field("plugins", &self.inner.entries().len())
            .finish_non_exhaustive()
    }
}

impl PluginManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(
        fs: Arc<dyn AddonFs>,
        store: Arc<StateStore>,
        surface: Arc<dyn RenderSurface>,
        limits: ScriptLimits,
        load_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(PluginsInner {
                fs,
                store,
                surface,
                limits,
                load_timeout,
                entries: RwLock::new(BTreeMap::new()),
                in_flight: InFlight::new(),
            }),
        }
    }

    /// Load (or replace) a plugin from its descriptor.
    ///
    /// Read, compile and evaluation failures are recorded on the returned
    /// instance rather than returned as errors.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::Busy`] if another operation on the plugin is in
    /// flight.
    pub async fn load_plugin(&self, descriptor: AddonDescriptor) -> AddonResult<PluginInstance> {
        let id = descriptor.id.clone();
        let Some(_claim) = self.inner.in_flight.try_claim(&id) else {
            return Err(AddonError::Busy(id));
        };
        let previous = self.inner.entries_mut().remove(&id);
        let was_started = previous.as_ref().is_some_and(|p| p.started);
        if let Some(previous) = previous {
            let running = previous.unit.as_ref().filter(|_| previous.started);
            self.teardown(&id, running, &previous.styles);
        }
        if was_started {
            self.inner.store.update(|s| s.disable_plugin(&id)).await;
        }
        Ok(self.load_unclaimed(descriptor).await)
    }

    async fn load_unclaimed(&self, descriptor: AddonDescriptor) -> PluginInstance {
        let id = descriptor.id.clone();
        let level = self.inner.store.read(|s| s.permission(&id));
        let styles = OwnedStyles::default();

        let loaded = match read_within(
            &descriptor.location,
            self.inner.load_timeout,
            self.inner.fs.read_plugin_source(&descriptor.location),
        )
        .await
        {
            Ok(source) => self.compile(&descriptor, level, &styles, &source),
            Err(e) => Err(e),
        };

        let (unit, error) = match loaded {
            Ok(unit) => {
                info!(plugin_id = %id, permission = %level, "Loaded plugin");
                (Some(unit), None)
            },
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Failed to load plugin");
                for handle in styles.drain() {
                    self.inner.surface.remove_style(&handle);
                }
                (None, Some(e.to_string()))
            },
        };

        let entry = PluginEntry {
            descriptor,
            level,
            unit,
            styles,
            started: false,
            error,
        };
        let snapshot = entry.snapshot();
        self.inner.entries_mut().insert(id, entry);
        self.flush_script_writes().await;
        snapshot
    }

    fn compile(
        &self,
        descriptor: &AddonDescriptor,
        level: PermissionLevel,
        styles: &OwnedStyles,
        source: &str,
    ) -> AddonResult<Arc<ScriptUnit>> {
        let ctx = CapabilityContext {
            descriptor: descriptor.clone(),
            level,
            store: Arc::clone(&self.inner.store),
            surface: Arc::clone(&self.inner.surface),
            directory: Arc::new(DirectoryView(Arc::downgrade(&self.inner))),
            unit: UnitCell::default(),
            styles: styles.clone(),
        };
        let graph = CapabilityGraph::build(&ctx);
        ScriptUnit::load(&descriptor.id, source, graph, self.inner.limits, &ctx.unit)
    }

    /// Scripts write settings from synchronous hooks; persist those writes.
    async fn flush_script_writes(&self) {
        if self.inner.store.is_dirty() {
            // Failures are logged by the store and retried on the next write.
            let _ = self.inner.store.flush().await;
        }
    }

    /// Run the stop hook of a running unit and drop the plugin's injected
    /// styles. Returns the hook failure, if any.
    fn teardown(
        &self,
        id: &AddonId,
        running: Option<&Arc<ScriptUnit>>,
        styles: &OwnedStyles,
    ) -> Option<String> {
        let mut failure = None;
        if let Some(unit) = running
            && unit.exports().stop
            && let Err(e) = unit.call_hook(STOP_HOOK)
        {
            warn!(plugin_id = %id, error = %e, "Plugin stop hook failed");
            failure = Some(e.to_string());
        }
        for handle in styles.drain() {
            self.inner.surface.remove_style(&handle);
        }
        failure
    }

    /// Start a loaded plugin.
    ///
    /// Returns `false` if the plugin is unknown, already started, failed to
    /// load, busy, or its `start` hook failed (the failure is recorded on the
    /// instance).
    pub async fn start_plugin(&self, id: &AddonId) -> bool {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(plugin_id = %id, "Start skipped, plugin busy");
            return false;
        };
        self.start_unclaimed(id).await
    }

    async fn start_unclaimed(&self, id: &AddonId) -> bool {
        let unit = {
            let entries = self.inner.entries();
            match entries.get(id) {
                Some(entry) if !entry.started => entry.unit.clone(),
                _ => None,
            }
        };
        let Some(unit) = unit else {
            return false;
        };

        let outcome = if unit.exports().start {
            unit.call_hook(START_HOOK).map(drop)
        } else {
            Ok(())
        };

        let started = {
            let mut entries = self.inner.entries_mut();
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            match outcome {
                Ok(()) => {
                    entry.started = true;
                    entry.error = None;
                    true
                },
                Err(e) => {
                    warn!(plugin_id = %id, error = %e, "Plugin failed to start");
                    entry.error = Some(e.to_string());
                    false
                },
            }
        };

        if started {
            info!(plugin_id = %id, "Started plugin");
            self.inner.store.update(|s| s.enable_plugin(id)).await;
        } else {
            self.flush_script_writes().await;
        }
        started
    }

    /// Stop a started plugin.
    ///
    /// A failing `stop` hook is logged and recorded but the plugin is still
    /// marked stopped. Returns `false` if the plugin is unknown, not started
    /// or busy.
    pub async fn stop_plugin(&self, id: &AddonId) -> bool {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(plugin_id = %id, "Stop skipped, plugin busy");
            return false;
        };
        self.stop_unclaimed(id).await
    }

    async fn stop_unclaimed(&self, id: &AddonId) -> bool {
        let Some(failure) = self.stop_in_memory(id) else {
            return false;
        };
        if let Some(message) = failure
            && let Some(entry) = self.inner.entries_mut().get_mut(id)
        {
            entry.error = Some(message);
        }
        info!(plugin_id = %id, "Stopped plugin");
        self.inner.store.update(|s| s.disable_plugin(id)).await;
        true
    }

    /// Tear down a started plugin without touching persisted state.
    ///
    /// `None` if the plugin is not started; otherwise the hook failure.
    fn stop_in_memory(&self, id: &AddonId) -> Option<Option<String>> {
        let (unit, styles) = {
            let entries = self.inner.entries();
            let entry = entries.get(id).filter(|e| e.started)?;
            (entry.unit.clone(), entry.styles.clone())
        };
        let failure = self.teardown(id, unit.as_ref(), &styles);
        if let Some(entry) = self.inner.entries_mut().get_mut(id) {
            entry.started = false;
        }
        Some(failure)
    }

    /// Re-read a plugin from disk and restart it if it was running.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::NotFound`] if the plugin is neither loaded nor
    /// present on disk.
    pub async fn reload_plugin(&self, id: &AddonId) -> AddonResult<ReloadOutcome> {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(plugin_id = %id, "Reload coalesced into the one in flight");
            return Ok(ReloadOutcome::Coalesced);
        };

        let (was_started, previous) = {
            let entries = self.inner.entries();
            match entries.get(id) {
                Some(entry) => (entry.started, Some(entry.descriptor.clone())),
                None => (false, None),
            }
        };
        // Enablement stays persisted across the restart and is cleared
        // below only if the restart fails.
        if was_started {
            self.stop_in_memory(id);
        }
        let discarded = self.inner.entries_mut().remove(id);
        if let Some(entry) = discarded {
            self.teardown(id, None, &entry.styles);
        }

        let descriptor = match self.inner.fs.list_plugins().await {
            Ok(list) => list.into_iter().find(|d| &d.id == id),
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin enumeration failed during reload, reusing previous descriptor");
                previous.clone()
            },
        };
        let Some(descriptor) = descriptor else {
            if previous.is_some() {
                info!(plugin_id = %id, "Plugin removed from disk, unloaded");
                return Ok(ReloadOutcome::Removed);
            }
            return Err(AddonError::NotFound(id.clone()));
        };

        self.load_unclaimed(descriptor).await;
        let started = was_started && self.start_unclaimed(id).await;
        if was_started && !started {
            self.inner.store.update(|s| s.disable_plugin(id)).await;
        }
        info!(plugin_id = %id, started, "Reloaded plugin");
        Ok(ReloadOutcome::Reloaded { active: started })
    }

    /// Snapshot of one plugin.
    #[must_use]
    pub fn plugin(&self, id: &AddonId) -> Option<PluginInstance> {
        self.inner.entries().get(id).map(PluginEntry::snapshot)
    }

    /// Snapshots of every loaded plugin, ordered by id.
    #[must_use]
    pub fn plugins(&self) -> Vec<PluginInstance> {
        self.inner
            .entries()
            .values()
            .map(PluginEntry::snapshot)
            .collect()
    }

    /// Descriptors of every loaded plugin.
    #[must_use]
    pub fn descriptors(&self) -> Vec<AddonDescriptor> {
        self.inner
            .entries()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Whether the plugin is in the persisted enabled list.
    #[must_use]
    pub fn is_enabled(&self, id: &AddonId) -> bool {
        self.inner.store.read(|s| s.is_plugin_enabled(id))
    }

    /// Persisted tier for a plugin (`limited` when unset).
    #[must_use]
    pub fn permission(&self, id: &AddonId) -> PermissionLevel {
        self.inner.store.read(|s| s.permission(id))
    }

    /// Persist a new tier. Takes effect the next time the plugin is loaded.
    pub async fn set_permission(&self, id: &AddonId, level: PermissionLevel) {
        info!(plugin_id = %id, permission = %level, "Plugin permission changed");
        self.inner
            .store
            .update(|s| s.permissions.insert(id.clone(), level))
            .await;
    }

    /// One setting from a plugin's bag.
    #[must_use]
    pub fn setting(&self, id: &AddonId, key: &str) -> Option<Value> {
        self.inner.store.read(|s| s.setting(id, key).cloned())
    }

    /// Write one setting into a plugin's bag.
    pub async fn set_setting(&self, id: &AddonId, key: &str, value: Value) {
        self.inner
            .store
            .update(|s| s.set_setting(id, key, value))
            .await;
    }

    fn loaded_unit(&self, id: &AddonId) -> Option<Arc<ScriptUnit>> {
        self.inner.entries().get(id).and_then(|e| e.unit.clone())
    }

    async fn call_provider(&self, id: &AddonId, hook: &str) -> Option<Dynamic> {
        let unit = self.loaded_unit(id)?;
        let result = unit.call_hook(hook);
        self.flush_script_writes().await;
        match result {
            Ok(value) if value.is_unit() => None,
            Ok(value) => Some(value),
            Err(e) => {
                warn!(plugin_id = %id, hook, error = %e, "Plugin provider failed");
                None
            },
        }
    }

    /// Markup for the plugin's settings panel, if it provides one.
    pub async fn settings_panel(&self, id: &AddonId) -> Option<String> {
        if !self.loaded_unit(id)?.exports().settings_panel {
            return None;
        }
        let value = self.call_provider(id, SETTINGS_PANEL_HOOK).await?;
        Some(match value.into_string() {
            Ok(markup) => markup,
            Err(type_name) => {
                debug!(plugin_id = %id, type_name, "Settings panel returned a non-string");
                return None;
            },
        })
    }

    /// The plugin's settings definition list. Empty when the plugin defines
    /// none or the definition cannot be read.
    pub async fn settings_def(&self, id: &AddonId) -> Vec<SettingDef> {
        let has_settings = self
            .loaded_unit(id)
            .is_some_and(|unit| unit.exports().settings);
        if !has_settings {
            return Vec::new();
        }
        let Some(value) = self.call_provider(id, SETTINGS_HOOK).await else {
            return Vec::new();
        };
        match rhai::serde::from_dynamic::<Vec<SettingDef>>(&value) {
            Ok(defs) => defs,
            Err(e) => {
                warn!(plugin_id = %id, error = %e, "Plugin settings definition is malformed");
                Vec::new()
            },
        }
    }

    /// Stop every started plugin without changing the persisted enabled
    /// list, so enablement is replayed on the next launch.
    pub async fn shutdown(&self) {
        let started: Vec<AddonId> = self
            .inner
            .entries()
            .values()
            .filter(|e| e.started)
            .map(|e| e.descriptor.id.clone())
            .collect();
        for id in started {
            let Some(_claim) = self.inner.in_flight.try_claim(&id) else {
                warn!(plugin_id = %id, "Plugin busy during shutdown, skipping stop hook");
                continue;
            };
            self.stop_in_memory(&id);
        }
        self.flush_script_writes().await;
        debug!("Plugin manager shut down");
    }
}
