//! Disk-backed [`AddonFs`].
//!
//! Layout under the Quill home directory (paths come from
//! [`AddonConfig`]):
//!
//! ```text
//! plugins/<id>/addon.toml   plugins/<id>/main.rhai
//! themes/<id>/addon.toml    themes/<id>/theme.css
//! addons.json               persisted AddonState
//! ```

pub mod discovery;
#[cfg(feature = "watch")]
pub mod watcher;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::AddonConfig;
use crate::descriptor::{AddonDescriptor, AddonKind};
use crate::error::{AddonError, AddonResult};
use crate::host::{AddonChange, AddonFs};
use crate::state::AddonState;

/// [`AddonFs`] over the plugin and theme directories on disk.
#[derive(Debug)]
pub struct DiskAddonFs {
    plugins_dir: PathBuf,
    themes_dir: PathBuf,
    state_file: PathBuf,
    debounce: Duration,
    watch_task: Mutex<Option<JoinHandle<()>>>,
}

impl DiskAddonFs {
    /// Build from resolved configuration.
    #[must_use]
    pub fn from_config(config: &AddonConfig) -> Self {
        Self::new(
            config.plugins_dir.clone(),
            config.themes_dir.clone(),
            config.state_file.clone(),
            config.debounce(),
        )
    }

    /// Build from explicit paths.
    #[must_use]
    pub fn new(plugins_dir: PathBuf, themes_dir: PathBuf, state_file: PathBuf, debounce: Duration) -> Self {
        Self {
            plugins_dir,
            themes_dir,
            state_file,
            debounce,
            watch_task: Mutex::new(None),
        }
    }

    /// Directory scanned for plugins.
    #[must_use]
    pub fn plugins_dir(&self) -> &Path {
        &self.plugins_dir
    }

    /// Directory scanned for themes.
    #[must_use]
    pub fn themes_dir(&self) -> &Path {
        &self.themes_dir
    }

    /// Path of the persisted state document.
    #[must_use]
    pub fn state_file(&self) -> &Path {
        &self.state_file
    }

    async fn discover(dir: &Path, kind: AddonKind) -> AddonResult<Vec<AddonDescriptor>> {
        let dir = dir.to_path_buf();
        tokio::task::spawn_blocking(move || discovery::discover(&dir, kind))
            .await
            .map_err(|e| AddonError::Io(std::io::Error::other(e)))?
    }

    async fn read_text(location: &Path) -> AddonResult<String> {
        tokio::fs::read_to_string(location)
            .await
            .map_err(|e| AddonError::ReadFailed {
                path: location.to_path_buf(),
                message: e.to_string(),
            })
    }

    fn take_watch_task(&self) -> Option<JoinHandle<()>> {
        self.watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

/// Write `state` to `path` through a temp file in the same directory, then
/// rename it into place.
fn write_state_atomic(path: &Path, state: &AddonState) -> AddonResult<()> {
    let persist_err = |what: &str, e: &dyn std::fmt::Display| {
        AddonError::PersistFailed(format!("{what} {}: {e}", path.display()))
    };

    let body = serde_json::to_vec_pretty(state).map_err(|e| persist_err("failed to serialize", &e))?;

    let parent = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(parent).map_err(|e| persist_err("failed to create parent of", &e))?;

    let mut tmp = tempfile::NamedTempFile::new_in(parent)
        .map_err(|e| persist_err("failed to create temp file for", &e))?;
    tmp.write_all(&body)
        .map_err(|e| persist_err("failed to write temp file for", &e))?;
    tmp.as_file()
        .sync_all()
        .map_err(|e| persist_err("failed to sync temp file for", &e))?;
    tmp.persist(path)
        .map_err(|e| persist_err("failed to rename temp file onto", &e.error))?;

    debug!(path = %path.display(), "Saved addon state");
    Ok(())
}

#[async_trait]
impl AddonFs for DiskAddonFs {
    async fn list_plugins(&self) -> AddonResult<Vec<AddonDescriptor>> {
        Self::discover(&self.plugins_dir, AddonKind::Plugin).await
    }

    async fn list_themes(&self) -> AddonResult<Vec<AddonDescriptor>> {
        Self::discover(&self.themes_dir, AddonKind::Theme).await
    }

    async fn read_plugin_source(&self, location: &Path) -> AddonResult<String> {
        Self::read_text(location).await
    }

    async fn read_theme_stylesheet(&self, location: &Path) -> AddonResult<String> {
        Self::read_text(location).await
    }

    async fn load_state(&self) -> AddonResult<serde_json::Value> {
        let content = match tokio::fs::read_to_string(&self.state_file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.state_file.display(), "No addon state file yet");
                return Ok(serde_json::Value::Null);
            },
            Err(e) => {
                return Err(AddonError::ReadFailed {
                    path: self.state_file.clone(),
                    message: e.to_string(),
                });
            },
        };
        serde_json::from_str(&content).map_err(|e| AddonError::ReadFailed {
            path: self.state_file.clone(),
            message: format!("invalid JSON: {e}"),
        })
    }

    async fn save_state(&self, state: &AddonState) -> AddonResult<()> {
        let path = self.state_file.clone();
        let state = state.clone();
        tokio::task::spawn_blocking(move || write_state_atomic(&path, &state))
            .await
            .map_err(|e| AddonError::PersistFailed(e.to_string()))?
    }

    #[cfg(feature = "watch")]
    async fn start_watching(&self) -> AddonResult<mpsc::Receiver<AddonChange>> {
        let (watcher, rx) = watcher::AddonWatcher::new(
            vec![
                (AddonKind::Plugin, self.plugins_dir.clone()),
                (AddonKind::Theme, self.themes_dir.clone()),
            ],
            self.debounce,
        )?;
        let task = tokio::spawn(watcher.run());
        let previous = self
            .watch_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(task);
        if let Some(previous) = previous {
            previous.abort();
            debug!("Replaced running addon watcher");
        }
        info!(debounce_ms = self.debounce.as_millis(), "Addon watcher started");
        Ok(rx)
    }

    #[cfg(not(feature = "watch"))]
    async fn start_watching(&self) -> AddonResult<mpsc::Receiver<AddonChange>> {
        Err(AddonError::Watcher(
            "built without the `watch` feature".to_string(),
        ))
    }

    async fn stop_watching(&self) {
        if let Some(task) = self.take_watch_task() {
            task.abort();
            info!("Addon watcher stopped");
        }
    }
}

impl Drop for DiskAddonFs {
    fn drop(&mut self) {
        if let Some(task) = self.take_watch_task() {
            warn!("DiskAddonFs dropped while watching, aborting watcher");
            task.abort();
        }
    }
}
