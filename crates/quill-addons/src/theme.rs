//! Theme manager.
//!
//! Themes are stylesheets with a declared list of overridable custom
//! properties. Enabling a theme reads its stylesheet, substitutes persisted
//! overrides for declared variables, and injects the result keyed
//! `quill-theme-<id>`. Changing a variable on an enabled theme updates the
//! injected block in place.

use std::collections::BTreeMap;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::descriptor::{AddonDescriptor, AddonId};
use crate::error::{AddonError, AddonResult};
use crate::guard::{InFlight, ReloadOutcome};
use crate::host::{AddonFs, RenderSurface, StyleHandle, read_within};
use crate::state::StateStore;
use crate::stylesheet::apply_overrides;

/// Style key a theme's injected block is registered under.
#[must_use]
pub fn theme_style_key(id: &AddonId) -> String {
    format!("quill-theme-{id}")
}

/// A declared variable with its effective value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StyleVariableView {
    /// Custom property name.
    pub name: String,
    /// Value the theme ships.
    pub default: String,
    /// Effective value: the persisted override, or the default.
    pub value: String,
    /// Whether `value` comes from an override.
    pub overridden: bool,
    /// Description from the theme's manifest.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

struct ThemeEntry {
    descriptor: AddonDescriptor,
    handle: Option<StyleHandle>,
}

struct ThemesInner {
    fs: Arc<dyn AddonFs>,
    store: Arc<StateStore>,
    surface: Arc<dyn RenderSurface>,
    load_timeout: Duration,
    entries: RwLock<BTreeMap<AddonId, ThemeEntry>>,
    in_flight: InFlight,
}

/// Registers, injects and removes themes.
///
/// Cheap to clone; clones share the same theme table.
#[derive(Clone)]
pub struct ThemeManager {
    inner: Arc<ThemesInner>,
}

impl std::fmt::Debug for ThemeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThemeManager")
            .field("themes", &self.entries().len())
            .finish_non_exhaustive()
    }
}

impl ThemeManager {
    /// Create an empty manager.
    #[must_use]
    pub fn new(
        fs: Arc<dyn AddonFs>,
        store: Arc<StateStore>,
        surface: Arc<dyn RenderSurface>,
        load_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(ThemesInner {
                fs,
                store,
                surface,
                load_timeout,
                entries: RwLock::new(BTreeMap::new()),
                in_flight: InFlight::new(),
            }),
        }
    }

    fn entries(&self) -> RwLockReadGuard<'_, BTreeMap<AddonId, ThemeEntry>> {
        self.inner
            .entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn entries_mut(&self) -> RwLockWriteGuard<'_, BTreeMap<AddonId, ThemeEntry>> {
        self.inner
            .entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a theme. Nothing is injected until it is enabled.
    pub fn register_theme(&self, descriptor: AddonDescriptor) {
        let id = descriptor.id.clone();
        let mut entries = self.entries_mut();
        match entries.get_mut(&id) {
            Some(entry) => entry.descriptor = descriptor,
            None => {
                entries.insert(
                    id.clone(),
                    ThemeEntry {
                        descriptor,
                        handle: None,
                    },
                );
            },
        }
        debug!(theme_id = %id, "Registered theme");
    }

    /// Inject a theme with its overrides applied.
    ///
    /// Enabling an enabled theme re-injects it. Returns `false` with no side
    /// effect if the theme is unknown, busy, or its stylesheet cannot be read.
    pub async fn enable_theme(&self, id: &AddonId) -> bool {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(theme_id = %id, "Enable skipped, theme busy");
            return false;
        };
        self.enable_unclaimed(id).await
    }

    async fn enable_unclaimed(&self, id: &AddonId) -> bool {
        let Some(descriptor) = self.entries().get(id).map(|e| e.descriptor.clone()) else {
            return false;
        };

        let css = match read_within(
            &descriptor.location,
            self.inner.load_timeout,
            self.inner.fs.read_theme_stylesheet(&descriptor.location),
        )
        .await
        {
            Ok(css) => css,
            Err(e) => {
                warn!(theme_id = %id, error = %e, "Failed to read theme stylesheet");
                return false;
            },
        };

        let overrides = self.inner.store.read(|s| s.css_overrides(id));
        let css = apply_overrides(&css, &descriptor.variables, &overrides);

        let previous = {
            let mut entries = self.entries_mut();
            let Some(entry) = entries.get_mut(id) else {
                return false;
            };
            let handle = self.inner.surface.inject_style(&theme_style_key(id), &css);
            entry.handle.replace(handle)
        };
        if let Some(previous) = previous {
            self.inner.surface.remove_style(&previous);
        }

        info!(theme_id = %id, overrides = overrides.len(), "Enabled theme");
        self.inner.store.update(|s| s.enable_theme(id)).await;
        true
    }

    /// Remove a theme's injection and mark it disabled.
    ///
    /// Returns `true` for any known theme that is not busy.
    pub async fn disable_theme(&self, id: &AddonId) -> bool {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(theme_id = %id, "Disable skipped, theme busy");
            return false;
        };
        self.disable_unclaimed(id).await
    }

    async fn disable_unclaimed(&self, id: &AddonId) -> bool {
        if !self.entries().contains_key(id) {
            return false;
        }
        self.take_injection(id);
        info!(theme_id = %id, "Disabled theme");
        self.inner.store.update(|s| s.disable_theme(id)).await;
        true
    }

    /// Re-read a theme's descriptor and stylesheet, re-injecting it if it was
    /// enabled.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::NotFound`] if the theme is neither registered
    /// nor present on disk.
    pub async fn reload_theme(&self, id: &AddonId) -> AddonResult<ReloadOutcome> {
        let Some(_claim) = self.inner.in_flight.try_claim(id) else {
            debug!(theme_id = %id, "Reload coalesced into the one in flight");
            return Ok(ReloadOutcome::Coalesced);
        };

        let previous = self.entries().get(id).map(|e| e.descriptor.clone());
        // Tear the old injection down first so a failed re-read leaves
        // nothing stale on the surface.
        let was_enabled = self.take_injection(id);

        let descriptor = match self.inner.fs.list_themes().await {
            Ok(list) => list.into_iter().find(|d| &d.id == id),
            Err(e) => {
                warn!(theme_id = %id, error = %e, "Theme enumeration failed during reload, reusing previous descriptor");
                previous.clone()
            },
        };

        let Some(descriptor) = descriptor else {
            if previous.is_none() {
                return Err(AddonError::NotFound(id.clone()));
            }
            // Persisted enablement is kept so a reinstall comes back enabled.
            self.entries_mut().remove(id);
            info!(theme_id = %id, "Theme removed from disk, unregistered");
            return Ok(ReloadOutcome::Removed);
        };

        self.register_theme(descriptor);
        let active = was_enabled && self.enable_unclaimed(id).await;
        if was_enabled && !active {
            self.inner.store.update(|s| s.disable_theme(id)).await;
        }
        info!(theme_id = %id, active, "Reloaded theme");
        Ok(ReloadOutcome::Reloaded { active })
    }

    /// Remove a theme's injection without touching persisted state.
    ///
    /// Returns whether one was injected.
    fn take_injection(&self, id: &AddonId) -> bool {
        let handle = self.entries_mut().get_mut(id).and_then(|e| e.handle.take());
        match handle {
            Some(handle) => {
                self.inner.surface.remove_style(&handle);
                true
            },
            None => false,
        }
    }

    /// Persist a variable override and apply it live if the theme is
    /// enabled and declares the variable.
    ///
    /// Returns whether the injected block was updated.
    pub async fn set_css_variable(&self, id: &AddonId, name: &str, value: &str) -> bool {
        self.inner
            .store
            .update(|s| s.set_css_override(id, name, value))
            .await;
        self.set_live(id, name, value)
    }

    /// Drop a variable override, restoring the theme's default.
    ///
    /// Returns whether an override was recorded.
    pub async fn reset_css_variable(&self, id: &AddonId, name: &str) -> bool {
        let removed = self
            .inner
            .store
            .update(|s| s.remove_css_override(id, name))
            .await;
        let default = self
            .entries()
            .get(id)
            .and_then(|e| e.descriptor.variable(name).map(|v| v.default.clone()));
        if removed && let Some(default) = default {
            self.set_live(id, name, &default);
        }
        removed
    }

    fn set_live(&self, id: &AddonId, name: &str, value: &str) -> bool {
        let handle = {
            let entries = self.entries();
            entries
                .get(id)
                .filter(|e| e.descriptor.variable(name).is_some())
                .and_then(|e| e.handle.clone())
        };
        match handle {
            Some(handle) => {
                self.inner.surface.set_style_variable(&handle, name, value);
                debug!(theme_id = %id, variable = name, "Applied style variable live");
                true
            },
            None => false,
        }
    }

    /// Declared variables merged with persisted overrides.
    #[must_use]
    pub fn css_variables(&self, id: &AddonId) -> Vec<StyleVariableView> {
        let Some(descriptor) = self.entries().get(id).map(|e| e.descriptor.clone()) else {
            return Vec::new();
        };
        let overrides = self.inner.store.read(|s| s.css_overrides(id));
        descriptor
            .variables
            .into_iter()
            .map(|v| {
                let value = overrides.get(&v.name).cloned();
                StyleVariableView {
                    overridden: value.is_some(),
                    value: value.unwrap_or_else(|| v.default.clone()),
                    name: v.name,
                    default: v.default,
                    description: v.description,
                }
            })
            .collect()
    }

    /// Descriptors of every registered theme, ordered by id.
    #[must_use]
    pub fn themes(&self) -> Vec<AddonDescriptor> {
        self.entries()
            .values()
            .map(|e| e.descriptor.clone())
            .collect()
    }

    /// Descriptor of one registered theme.
    #[must_use]
    pub fn theme(&self, id: &AddonId) -> Option<AddonDescriptor> {
        self.entries().get(id).map(|e| e.descriptor.clone())
    }

    /// Whether the theme is in the persisted enabled list.
    #[must_use]
    pub fn is_enabled(&self, id: &AddonId) -> bool {
        self.inner.store.read(|s| s.is_theme_enabled(id))
    }

    /// Whether the theme is currently injected.
    #[must_use]
    pub fn is_applied(&self, id: &AddonId) -> bool {
        self.entries().get(id).is_some_and(|e| e.handle.is_some())
    }

    /// Remove every injection without changing persisted enablement.
    pub fn shutdown(&self) {
        let handles: Vec<StyleHandle> = self
            .entries_mut()
            .values_mut()
            .filter_map(|e| e.handle.take())
            .collect();
        for handle in &handles {
            self.inner.surface.remove_style(handle);
        }
        debug!(removed = handles.len(), "Theme manager shut down");
    }
}
