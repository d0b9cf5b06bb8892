//! Collaborator traits the runtime is wired against.
//!
//! The runtime never touches the disk or the rendered surface directly:
//! [`AddonFs`] covers discovery, source reads, state persistence and change
//! notifications, and [`RenderSurface`] covers everything extensions and
//! themes may do to the UI.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::descriptor::{AddonDescriptor, AddonKind};
use crate::error::{AddonError, AddonResult};
use crate::state::AddonState;

/// What happened to a watched file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// File created.
    Created,
    /// File contents or metadata changed.
    Modified,
    /// File deleted.
    Removed,
}

/// A change notification for a file in one of the addon directories.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddonChange {
    /// Which addon directory the file lives in.
    pub dir: AddonKind,
    /// Kind of change.
    pub kind: ChangeKind,
    /// Path of the changed file relative to the addon directory.
    pub path: PathBuf,
}

/// File-system and file-watch collaborator.
///
/// Every method may fail; failures are returned as catchable errors and the
/// runtime contains them per addon.
#[async_trait]
pub trait AddonFs: Send + Sync {
    /// Enumerate plugin descriptors.
    async fn list_plugins(&self) -> AddonResult<Vec<AddonDescriptor>>;

    /// Enumerate theme descriptors.
    async fn list_themes(&self) -> AddonResult<Vec<AddonDescriptor>>;

    /// Read a plugin's script text.
    async fn read_plugin_source(&self, location: &Path) -> AddonResult<String>;

    /// Read a theme's stylesheet text.
    async fn read_theme_stylesheet(&self, location: &Path) -> AddonResult<String>;

    /// Load the persisted state document in whatever shape it was stored.
    ///
    /// A missing document is `Value::Null`, not an error.
    async fn load_state(&self) -> AddonResult<serde_json::Value>;

    /// Overwrite the persisted state document.
    async fn save_state(&self, state: &AddonState) -> AddonResult<()>;

    /// Begin emitting change notifications for the addon directories.
    async fn start_watching(&self) -> AddonResult<mpsc::Receiver<AddonChange>>;

    /// Stop emitting change notifications. Idempotent.
    async fn stop_watching(&self);
}

/// Await an addon read, failing with [`AddonError::ReadTimeout`] after
/// `timeout`. A zero timeout disables the bound.
pub(crate) async fn read_within<F>(location: &Path, timeout: Duration, read: F) -> AddonResult<String>
where
    F: Future<Output = AddonResult<String>>,
{
    if timeout.is_zero() {
        return read.await;
    }
    tokio::time::timeout(timeout, read)
        .await
        .map_err(|_| AddonError::ReadTimeout {
            path: location.to_path_buf(),
            timeout,
        })?
}

/// Handle to a style block injected into the rendered surface.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StyleHandle(pub String);

impl fmt::Display for StyleHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an element created on the rendered surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ElementId(pub u64);

impl fmt::Display for ElementId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "el-{}", self.0)
    }
}

/// Severity of a toast notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ToastKind {
    /// Neutral message.
    #[default]
    Info,
    /// Operation succeeded.
    Success,
    /// Something may need attention.
    Warning,
    /// Operation failed.
    Error,
}

impl ToastKind {
    /// Parse a kind name as passed by scripts. Unknown names are `Info`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "success" => Self::Success,
            "warning" | "warn" => Self::Warning,
            "error" => Self::Error,
            _ => Self::Info,
        }
    }
}

/// Callback invoked when an observed element leaves the surface.
pub type RemovalCallback = Box<dyn FnOnce() + Send + 'static>;

/// The rendered surface owned by the UI.
///
/// Calls are synchronous: the runtime invokes them between its own awaits,
/// and plugin scripts invoke them from inside hooks.
pub trait RenderSurface: Send + Sync {
    /// Attach a style block. `key` is stable per addon so hosts can
    /// de-duplicate; the returned handle identifies this injection.
    fn inject_style(&self, key: &str, css: &str) -> StyleHandle;

    /// Remove a previously injected style block. Unknown handles are ignored.
    fn remove_style(&self, handle: &StyleHandle);

    /// Set a single custom property on an injected block without re-injecting.
    fn set_style_variable(&self, handle: &StyleHandle, name: &str, value: &str);

    /// Parse a markup fragment into a detached element.
    ///
    /// # Errors
    ///
    /// Returns a message if the fragment cannot be parsed.
    fn parse_markup(&self, fragment: &str) -> Result<ElementId, String>;

    /// Run `callback` once when `element` is removed from the surface.
    fn observe_removal(&self, element: ElementId, callback: RemovalCallback);

    /// Show a user notification.
    fn toast(&self, message: &str, kind: ToastKind);

    /// Create a detached element.
    fn create_element(&self, tag: &str) -> ElementId;

    /// Set an attribute on an element.
    fn set_attribute(&self, element: ElementId, name: &str, value: &str);

    /// Replace an element's text content.
    fn set_text(&self, element: ElementId, text: &str);

    /// Append `child` to `parent`.
    fn append_child(&self, parent: ElementId, child: ElementId);

    /// Attach a detached element to the surface root.
    fn mount(&self, element: ElementId);

    /// Remove an element (and fire its removal observers).
    fn remove_element(&self, element: ElementId);
}
