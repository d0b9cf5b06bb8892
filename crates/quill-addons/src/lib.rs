//! Addon runtime for Quill.
//!
//! Loads untrusted plugin scripts and declarative themes at run time, runs
//! plugins against a capability surface chosen by their permission tier,
//! persists addon configuration, and reloads addons when their files change.
//!
//! - [`AddonSystem`]: explicit context with `init` / `shutdown`
//! - [`PluginManager`]: load, start, stop and reload plugin scripts
//! - [`ThemeManager`]: inject themes with user variable overrides
//! - [`StateStore`]: persisted enablement, tiers, settings and overrides
//! - [`CapabilityGraph`]: per-tier host services a script may call
//! - [`AddonFs`] / [`RenderSurface`]: collaborator traits the host provides
//! - [`DiskAddonFs`], [`MemoryAddonFs`], [`MemorySurface`], [`LogSurface`]:
//!   ready-made collaborators
//!
//! # Permission tiers
//!
//! | Tier | Namespaces |
//! |------|------------|
//! | `limited` | `addon`, `settings`, `notify` |
//! | `partial` | + `ui` |
//! | `full` | + `plugins`, `toolkit` |
//!
//! A call into a namespace outside the plugin's tier fails with
//! [`AddonError::CapabilityUnavailable`] naming the namespace.

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]

pub mod capability;
pub mod config;
pub mod descriptor;
pub mod error;
pub mod fs;
mod guard;
pub mod host;
pub mod memory;
pub mod permission;
pub mod plugin;
pub mod script;
pub mod state;
pub mod stylesheet;
pub mod surface;
pub mod system;
pub mod theme;

pub use capability::{Capability, CapabilityGraph, OwnedStyles, PluginDirectory, PluginSummary};
pub use config::{AddonConfig, ConfigError, ConfigResult};
pub use descriptor::{AddonDescriptor, AddonId, AddonKind, StyleVariable};
pub use error::{AddonError, AddonResult};
pub use fs::DiskAddonFs;
pub use guard::ReloadOutcome;
pub use host::{
    AddonChange, AddonFs, ChangeKind, ElementId, RemovalCallback, RenderSurface, StyleHandle,
    ToastKind,
};
pub use memory::{InjectedStyle, MemoryAddonFs, MemoryElement, MemorySurface};
pub use permission::PermissionLevel;
pub use plugin::{PluginInstance, PluginManager, SettingDef, SettingKind};
pub use script::{Exports, ScriptLimits};
pub use state::{AddonState, SettingsBag, StateStore};
pub use surface::LogSurface;
pub use system::{AddonHandles, AddonHost, AddonSystem};
pub use theme::{StyleVariableView, ThemeManager, theme_style_key};
