//! Capability graphs: the host services a plugin script can reach.
//!
//! Each service is a Rhai static module. A graph is built per plugin from its
//! permission tier, and every tier lists the services it constructs:
//!
//! | Service    | limited | partial | full |
//! |------------|---------|---------|------|
//! | `settings` | yes     | yes     | yes  |
//! | `notify`   | yes     | yes     | yes  |
//! | `ui`       |         | yes     | yes  |
//! | `plugins`  |         |         | yes  |
//! | `toolkit`  |         |         | yes  |
//!
//! Every plugin also gets an `addon` module holding its own descriptor
//! fields. Nothing else is registered with the engine, so a script calling
//! into a service outside its graph fails with "module not found", which the
//! script layer reports as [`AddonError::CapabilityUnavailable`].
//!
//! [`AddonError::CapabilityUnavailable`]: crate::error::AddonError::CapabilityUnavailable

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, Weak};

use rhai::{Array, Dynamic, Engine, EvalAltResult, INT, ImmutableString, Module};
use serde::Serialize;
use tracing::{debug, warn};

use crate::descriptor::{AddonDescriptor, AddonId};
use crate::host::{ElementId, RenderSurface, StyleHandle, ToastKind};
use crate::permission::PermissionLevel;
use crate::script::UnitCell;
use crate::state::StateStore;

type FnResult<T> = Result<T, Box<EvalAltResult>>;

/// A host service a plugin may be granted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Capability {
    /// Per-plugin settings bag.
    Settings,
    /// User notifications.
    Notify,
    /// Scoped styles, markup parsing and removal observers.
    Ui,
    /// Read-only view of other plugins.
    Plugins,
    /// Element construction on the rendered surface.
    Toolkit,
}

impl Capability {
    /// Every capability, in tier order.
    pub const ALL: [Self; 5] = [
        Self::Settings,
        Self::Notify,
        Self::Ui,
        Self::Plugins,
        Self::Toolkit,
    ];

    /// Module name scripts use to reach this service.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Settings => "settings",
            Self::Notify => "notify",
            Self::Ui => "ui",
            Self::Plugins => "plugins",
            Self::Toolkit => "toolkit",
        }
    }

    /// Services granted at `level`.
    #[must_use]
    pub fn granted(level: PermissionLevel) -> &'static [Self] {
        match level {
            PermissionLevel::Limited => &[Self::Settings, Self::Notify],
            PermissionLevel::Partial => &[Self::Settings, Self::Notify, Self::Ui],
            PermissionLevel::Full => &[
                Self::Settings,
                Self::Notify,
                Self::Ui,
                Self::Plugins,
                Self::Toolkit,
            ],
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the `plugins` service reports about one plugin.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PluginSummary {
    /// Plugin id.
    pub id: AddonId,
    /// Display name.
    pub name: String,
    /// Version string.
    pub version: String,
    /// Author.
    pub author: String,
    /// Description.
    pub description: String,
    /// Whether the plugin is currently started.
    pub started: bool,
    /// Tier the plugin was loaded with.
    pub permission: PermissionLevel,
}

/// Read-only plugin directory backing the `plugins` service.
pub trait PluginDirectory: Send + Sync {
    /// Summary of one plugin.
    fn describe(&self, id: &AddonId) -> Option<PluginSummary>;

    /// Summaries of every loaded plugin.
    fn describe_all(&self) -> Vec<PluginSummary>;

    /// Whether a plugin is in the persisted enabled list.
    fn is_enabled(&self, id: &AddonId) -> bool;
}

/// Style blocks a plugin injected through the `ui` service.
///
/// The plugin manager removes whatever is left when the plugin stops.
#[derive(Debug, Default, Clone)]
pub struct OwnedStyles {
    handles: Arc<Mutex<Vec<StyleHandle>>>,
}

impl OwnedStyles {
    fn push(&self, handle: StyleHandle) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handle);
    }

    fn forget(&self, handle: &StyleHandle) {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|h| h != handle);
    }

    /// Take every recorded handle.
    pub fn drain(&self) -> Vec<StyleHandle> {
        std::mem::take(&mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

/// Everything a service may need, bound to one plugin.
#[derive(Clone)]
pub(crate) struct CapabilityContext {
    pub(crate) descriptor: AddonDescriptor,
    pub(crate) level: PermissionLevel,
    pub(crate) store: Arc<StateStore>,
    pub(crate) surface: Arc<dyn RenderSurface>,
    pub(crate) directory: Arc<dyn PluginDirectory>,
    pub(crate) unit: UnitCell,
    pub(crate) styles: OwnedStyles,
}

/// The services installed into one plugin's engine.
pub struct CapabilityGraph {
    plugin_id: AddonId,
    level: PermissionLevel,
    services: Vec<(Capability, Module)>,
    addon: Module,
}

impl fmt::Debug for CapabilityGraph {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapabilityGraph")
            .field("plugin_id", &self.plugin_id)
            .field("level", &self.level)
            .field("members", &self.members())
            .finish_non_exhaustive()
    }
}

impl CapabilityGraph {
    /// Build the graph for `ctx.level`.
    pub(crate) fn build(ctx: &CapabilityContext) -> Self {
        let services: Vec<(Capability, Module)> = match ctx.level {
            PermissionLevel::Limited => vec![
                (Capability::Settings, settings_service(ctx)),
                (Capability::Notify, notify_service(ctx)),
            ],
            PermissionLevel::Partial => vec![
                (Capability::Settings, settings_service(ctx)),
                (Capability::Notify, notify_service(ctx)),
                (Capability::Ui, ui_service(ctx)),
            ],
            PermissionLevel::Full => vec![
                (Capability::Settings, settings_service(ctx)),
                (Capability::Notify, notify_service(ctx)),
                (Capability::Ui, ui_service(ctx)),
                (Capability::Plugins, plugins_service(ctx)),
                (Capability::Toolkit, toolkit_service(ctx)),
            ],
        };
        debug_assert_eq!(
            services.iter().map(|(c, _)| *c).collect::<Vec<_>>(),
            Capability::granted(ctx.level)
        );
        Self {
            plugin_id: ctx.descriptor.id.clone(),
            level: ctx.level,
            services,
            addon: addon_module(&ctx.descriptor, ctx.level),
        }
    }

    /// The tier this graph was built for.
    #[must_use]
    pub fn level(&self) -> PermissionLevel {
        self.level
    }

    /// Services present in the graph.
    #[must_use]
    pub fn members(&self) -> Vec<Capability> {
        self.services.iter().map(|(c, _)| *c).collect()
    }

    /// Register every service with `engine`.
    pub(crate) fn install(self, engine: &mut Engine) {
        for (capability, module) in self.services {
            engine.register_static_module(capability.as_str(), module.into());
        }
        engine.register_static_module("addon", self.addon.into());
    }
}

fn element_id(raw: INT) -> FnResult<ElementId> {
    u64::try_from(raw)
        .map(ElementId)
        .map_err(|_| format!("invalid element handle: {raw}").into())
}

fn element_handle(id: ElementId) -> FnResult<INT> {
    INT::try_from(id.0).map_err(|_| format!("element handle out of range: {id}").into())
}

// ---------------------------------------------------------------------------
// addon::{id, name, version, author, permission}
// ---------------------------------------------------------------------------

fn addon_module(descriptor: &AddonDescriptor, level: PermissionLevel) -> Module {
    let mut module = Module::new();
    module.set_var("id", descriptor.id.to_string());
    module.set_var("name", descriptor.name.clone());
    module.set_var("version", descriptor.version.clone());
    module.set_var("author", descriptor.author.clone());
    module.set_var("permission", level.as_str().to_string());
    module
}

// ---------------------------------------------------------------------------
// settings::get(key) / settings::set(key, value) / settings::keys()
// ---------------------------------------------------------------------------

fn settings_service(ctx: &CapabilityContext) -> Module {
    let mut module = Module::new();

    let (store, id) = (Arc::clone(&ctx.store), ctx.descriptor.id.clone());
    module.set_native_fn("get", move |key: ImmutableString| -> FnResult<Dynamic> {
        match store.read(|s| s.setting(&id, key.as_str()).cloned()) {
            Some(value) => rhai::serde::to_dynamic(value),
            None => Ok(Dynamic::UNIT),
        }
    });

    let (store, id) = (Arc::clone(&ctx.store), ctx.descriptor.id.clone());
    module.set_native_fn(
        "set",
        move |key: ImmutableString, value: Dynamic| -> FnResult<()> {
            let json: serde_json::Value = rhai::serde::from_dynamic(&value)?;
            store.apply(|s| s.set_setting(&id, key.as_str(), json));
            Ok(())
        },
    );

    let (store, id) = (Arc::clone(&ctx.store), ctx.descriptor.id.clone());
    module.set_native_fn("keys", move || -> FnResult<Array> {
        Ok(store.read(|s| {
            s.settings
                .get(&id)
                .map(|bag| bag.keys().cloned().map(Dynamic::from).collect())
                .unwrap_or_default()
        }))
    });

    module
}

// ---------------------------------------------------------------------------
// notify::toast(message [, kind])
// ---------------------------------------------------------------------------

fn notify_service(ctx: &CapabilityContext) -> Module {
    let mut module = Module::new();

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("toast", move |message: ImmutableString| -> FnResult<()> {
        surface.toast(message.as_str(), ToastKind::Info);
        Ok(())
    });

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn(
        "toast",
        move |message: ImmutableString, kind: ImmutableString| -> FnResult<()> {
            surface.toast(message.as_str(), ToastKind::from_name(kind.as_str()));
            Ok(())
        },
    );

    module
}

// ---------------------------------------------------------------------------
// ui::inject_style(css) / ui::remove_style(handle) / ui::parse_markup(html)
// ui::on_removed(element, hook)
// ---------------------------------------------------------------------------

fn ui_service(ctx: &CapabilityContext) -> Module {
    let mut module = Module::new();
    let key = format!("quill-plugin-{}", ctx.descriptor.id);

    let (surface, styles) = (Arc::clone(&ctx.surface), ctx.styles.clone());
    module.set_native_fn(
        "inject_style",
        move |css: ImmutableString| -> FnResult<ImmutableString> {
            let handle = surface.inject_style(&key, css.as_str());
            let text = ImmutableString::from(handle.0.as_str());
            styles.push(handle);
            Ok(text)
        },
    );

    let (surface, styles) = (Arc::clone(&ctx.surface), ctx.styles.clone());
    module.set_native_fn("remove_style", move |handle: ImmutableString| -> FnResult<()> {
        let handle = StyleHandle(handle.to_string());
        surface.remove_style(&handle);
        styles.forget(&handle);
        Ok(())
    });

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("parse_markup", move |fragment: ImmutableString| -> FnResult<INT> {
        let element = surface.parse_markup(fragment.as_str())?;
        element_handle(element)
    });

    let (surface, unit, plugin_id) = (
        Arc::clone(&ctx.surface),
        ctx.unit.clone(),
        ctx.descriptor.id.clone(),
    );
    module.set_native_fn(
        "on_removed",
        move |element: INT, hook: ImmutableString| -> FnResult<()> {
            let element = element_id(element)?;
            let unit = Arc::clone(&unit);
            let plugin_id = plugin_id.clone();
            surface.observe_removal(
                element,
                Box::new(move || {
                    let Some(unit) = unit.get().and_then(Weak::upgrade) else {
                        debug!(plugin_id = %plugin_id, hook = %hook, "Removal observer outlived its plugin");
                        return;
                    };
                    if let Err(e) = unit.call_hook(hook.as_str()) {
                        warn!(plugin_id = %plugin_id, hook = %hook, error = %e, "Removal observer failed");
                    }
                }),
            );
            Ok(())
        },
    );

    module
}

// ---------------------------------------------------------------------------
// plugins::get(id) / plugins::get_all() / plugins::is_enabled(id)
// ---------------------------------------------------------------------------

fn plugins_service(ctx: &CapabilityContext) -> Module {
    let mut module = Module::new();

    let directory = Arc::clone(&ctx.directory);
    module.set_native_fn("get", move |id: ImmutableString| -> FnResult<Dynamic> {
        match AddonId::new(id.as_str())
            .ok()
            .and_then(|id| directory.describe(&id))
        {
            Some(summary) => rhai::serde::to_dynamic(summary),
            None => Ok(Dynamic::UNIT),
        }
    });

    let directory = Arc::clone(&ctx.directory);
    module.set_native_fn("get_all", move || -> FnResult<Dynamic> {
        rhai::serde::to_dynamic(directory.describe_all())
    });

    let directory = Arc::clone(&ctx.directory);
    module.set_native_fn("is_enabled", move |id: ImmutableString| -> FnResult<bool> {
        Ok(AddonId::new(id.as_str()).is_ok_and(|id| directory.is_enabled(&id)))
    });

    module
}

// ---------------------------------------------------------------------------
// toolkit::create_element(tag) / set_attribute / set_text / append / mount / remove
// ---------------------------------------------------------------------------

fn toolkit_service(ctx: &CapabilityContext) -> Module {
    let mut module = Module::new();

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("create_element", move |tag: ImmutableString| -> FnResult<INT> {
        element_handle(surface.create_element(tag.as_str()))
    });

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn(
        "set_attribute",
        move |element: INT, name: ImmutableString, value: ImmutableString| -> FnResult<()> {
            surface.set_attribute(element_id(element)?, name.as_str(), value.as_str());
            Ok(())
        },
    );

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn(
        "set_text",
        move |element: INT, text: ImmutableString| -> FnResult<()> {
            surface.set_text(element_id(element)?, text.as_str());
            Ok(())
        },
    );

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("append", move |parent: INT, child: INT| -> FnResult<()> {
        surface.append_child(element_id(parent)?, element_id(child)?);
        Ok(())
    });

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("mount", move |element: INT| -> FnResult<()> {
        surface.mount(element_id(element)?);
        Ok(())
    });

    let surface = Arc::clone(&ctx.surface);
    module.set_native_fn("remove", move |element: INT| -> FnResult<()> {
        surface.remove_element(element_id(element)?);
        Ok(())
    });

    module
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;

    fn set(level: PermissionLevel) -> BTreeSet<Capability> {
        Capability::granted(level).iter().copied().collect()
    }

    #[test]
    fn tiers_are_strictly_nested() {
        let limited = set(PermissionLevel::Limited);
        let partial = set(PermissionLevel::Partial);
        let full = set(PermissionLevel::Full);
        assert!(limited.is_subset(&partial) && limited != partial);
        assert!(partial.is_subset(&full) && partial != full);
        assert_eq!(full.len(), Capability::ALL.len());
    }

    #[test]
    fn limited_excludes_host_introspection() {
        let limited = set(PermissionLevel::Limited);
        assert!(!limited.contains(&Capability::Plugins));
        assert!(!limited.contains(&Capability::Toolkit));
        assert!(!limited.contains(&Capability::Ui));
    }

    #[test]
    fn element_handles_reject_negative_ints() {
        assert!(element_id(-1).is_err());
        assert_eq!(element_id(7).unwrap(), ElementId(7));
    }
}
