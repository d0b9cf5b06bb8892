//! Addon system context.
//!
//! [`AddonSystem`] wires the state store and both managers to the host's
//! collaborators. [`init`](AddonSystem::init) loads everything, replays the
//! persisted enablement and, when configured, routes watch events to
//! reloads; [`shutdown`](AddonSystem::shutdown) undoes it so the context
//! can be initialized again.

use std::path::{Component, Path};
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AddonConfig;
use crate::descriptor::{AddonDescriptor, AddonId, AddonKind};
use crate::error::AddonResult;
use crate::guard::ReloadOutcome;
use crate::host::{AddonChange, AddonFs, RenderSurface};
use crate::plugin::PluginManager;
use crate::state::StateStore;
use crate::theme::ThemeManager;

/// The collaborators a host supplies.
#[derive(Clone)]
pub struct AddonHost {
    /// Discovery, reads, persistence and change notifications.
    pub fs: Arc<dyn AddonFs>,
    /// The rendered surface.
    pub surface: Arc<dyn RenderSurface>,
}

impl std::fmt::Debug for AddonHost {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonHost").finish_non_exhaustive()
    }
}

/// Handles to an initialized system. Clones share state.
#[derive(Debug, Clone)]
pub struct AddonHandles {
    /// Plugin lifecycle and queries.
    pub plugins: PluginManager,
    /// Theme lifecycle and queries.
    pub themes: ThemeManager,
    /// The persisted state.
    pub store: Arc<StateStore>,
}

struct Running {
    handles: AddonHandles,
    dispatch_task: Option<JoinHandle<()>>,
}

/// Explicit addon runtime context with `init` / `shutdown`.
pub struct AddonSystem {
    host: AddonHost,
    config: AddonConfig,
    running: Mutex<Option<Running>>,
}

impl std::fmt::Debug for AddonSystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AddonSystem")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl AddonSystem {
    /// Create an uninitialized system.
    #[must_use]
    pub fn new(host: AddonHost, config: AddonConfig) -> Self {
        Self {
            host,
            config,
            running: Mutex::new(None),
        }
    }

    /// The configuration this system was created with.
    #[must_use]
    pub fn config(&self) -> &AddonConfig {
        &self.config
    }

    /// Load state and addons, replay enablement and start watching.
    ///
    /// Idempotent: a second or concurrent call returns the handles of the
    /// first. Individual addon failures are recorded on the addon, never
    /// returned.
    ///
    /// # Errors
    ///
    /// Returns [`AddonError::Config`](crate::AddonError::Config) if the
    /// configuration is invalid.
    pub async fn init(&self) -> AddonResult<AddonHandles> {
        let mut running = self.running.lock().await;
        if let Some(running) = running.as_ref() {
            debug!("Addon system already initialized");
            return Ok(running.handles.clone());
        }
        self.config.validate()?;

        let fs = Arc::clone(&self.host.fs);
        let surface = Arc::clone(&self.host.surface);
        let store = Arc::new(StateStore::load(Arc::clone(&fs)).await);
        let load_timeout = self.config.load_timeout();
        let handles = AddonHandles {
            plugins: PluginManager::new(
                Arc::clone(&fs),
                Arc::clone(&store),
                Arc::clone(&surface),
                self.config.script_limits(),
                load_timeout,
            ),
            themes: ThemeManager::new(Arc::clone(&fs), Arc::clone(&store), surface, load_timeout),
            store: Arc::clone(&store),
        };

        let plugins = list_or_empty(AddonKind::Plugin, fs.list_plugins().await);
        let themes = list_or_empty(AddonKind::Theme, fs.list_themes().await);
        for descriptor in plugins {
            let id = descriptor.id.clone();
            if let Err(e) = handles.plugins.load_plugin(descriptor).await {
                warn!(plugin_id = %id, error = %e, "Plugin not loaded");
            }
        }
        for descriptor in themes {
            handles.themes.register_theme(descriptor);
        }

        let persisted = store.snapshot();
        for id in &persisted.enabled_plugins {
            if handles.plugins.plugin(id).is_none() {
                debug!(plugin_id = %id, "Enabled plugin not installed, skipping");
                continue;
            }
            if !handles.plugins.start_plugin(id).await {
                warn!(plugin_id = %id, "Enabled plugin failed to start");
            }
        }
        for id in &persisted.enabled_themes {
            if handles.themes.theme(id).is_none() {
                debug!(theme_id = %id, "Enabled theme not installed, skipping");
                continue;
            }
            if !handles.themes.enable_theme(id).await {
                warn!(theme_id = %id, "Enabled theme failed to apply");
            }
        }

        let dispatch_task = if self.config.watch {
            match fs.start_watching().await {
                Ok(rx) => Some(tokio::spawn(dispatch_loop(handles.clone(), rx))),
                Err(e) => {
                    warn!(error = %e, "Failed to start addon watcher, live reload disabled");
                    None
                },
            }
        } else {
            None
        };

        info!(
            plugins = handles.plugins.plugins().len(),
            themes = handles.themes.themes().len(),
            watching = dispatch_task.is_some(),
            "Addon system initialized"
        );
        *running = Some(Running {
            handles: handles.clone(),
            dispatch_task,
        });
        Ok(handles)
    }

    /// Handles of the initialized system, if any.
    pub async fn handles(&self) -> Option<AddonHandles> {
        self.running.lock().await.as_ref().map(|r| r.handles.clone())
    }

    /// Stop watching, run plugin `stop` hooks and remove theme injections.
    ///
    /// Persisted enablement is left as is. No-op when not initialized.
    pub async fn shutdown(&self) {
        let Some(running) = self.running.lock().await.take() else {
            return;
        };
        if let Some(task) = running.dispatch_task {
            task.abort();
            self.host.fs.stop_watching().await;
        }
        running.handles.plugins.shutdown().await;
        running.handles.themes.shutdown();
        if running.handles.store.is_dirty() {
            // Logged by the store on failure.
            let _ = running.handles.store.flush().await;
        }
        info!("Addon system shut down");
    }

    /// Route a change notification to the matching reload.
    ///
    /// Returns `None` when the system is not initialized or the change
    /// cannot be attributed to an addon.
    pub async fn dispatch(&self, change: &AddonChange) -> Option<AddonResult<ReloadOutcome>> {
        let handles = self.handles().await?;
        dispatch_change(&handles, change).await
    }
}

fn list_or_empty(kind: AddonKind, listed: AddonResult<Vec<AddonDescriptor>>) -> Vec<AddonDescriptor> {
    listed.unwrap_or_else(|e| {
        warn!(%kind, error = %e, "Addon enumeration failed, treating as empty");
        Vec::new()
    })
}

async fn dispatch_loop(handles: AddonHandles, mut rx: mpsc::Receiver<AddonChange>) {
    while let Some(change) = rx.recv().await {
        dispatch_change(&handles, &change).await;
    }
    debug!("Addon change channel closed, dispatch stopped");
}

async fn dispatch_change(
    handles: &AddonHandles,
    change: &AddonChange,
) -> Option<AddonResult<ReloadOutcome>> {
    let known = match change.dir {
        AddonKind::Plugin => handles.plugins.descriptors(),
        AddonKind::Theme => handles.themes.themes(),
    };
    let id = known
        .iter()
        .find(|d| d.matches_changed_file(&change.path))
        .map(|d| d.id.clone())
        .or_else(|| id_from_path(&change.path));
    let Some(id) = id else {
        debug!(path = %change.path.display(), "Change does not belong to an addon");
        return None;
    };

    debug!(addon_id = %id, kind = ?change.kind, path = %change.path.display(), "Dispatching addon change");
    let outcome = match change.dir {
        AddonKind::Plugin => handles.plugins.reload_plugin(&id).await,
        AddonKind::Theme => handles.themes.reload_theme(&id).await,
    };
    match &outcome {
        Ok(outcome) => info!(addon_id = %id, ?outcome, "Live reload"),
        Err(e) => warn!(addon_id = %id, error = %e, "Live reload failed"),
    }
    Some(outcome)
}

/// Addon directories are named after their id; a change in a directory no
/// descriptor claims yet may be a newly installed addon.
fn id_from_path(path: &Path) -> Option<AddonId> {
    let mut components = path.components();
    let first = components.next()?;
    // A bare file at the root is not inside any addon directory.
    components.next()?;
    match first {
        Component::Normal(name) => AddonId::new(name.to_str()?).ok(),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_from_nested_path() {
        assert_eq!(
            id_from_path(Path::new("word-count/main.rhai")),
            Some(AddonId::from_static("word-count"))
        );
        assert_eq!(id_from_path(Path::new("stray.rhai")), None);
        assert_eq!(id_from_path(Path::new("Bad Dir/main.rhai")), None);
        assert_eq!(id_from_path(Path::new("")), None);
    }
}
