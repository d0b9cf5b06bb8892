//! In-memory collaborators.
//!
//! [`MemoryAddonFs`] and [`MemorySurface`] implement the host traits without
//! touching the disk or a real UI. Headless hosts use them directly; tests use
//! their fault-injection knobs (failing saves, slow reads, scripted change
//! events).

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::descriptor::{AddonDescriptor, AddonId, AddonKind, StyleVariable};
use crate::error::{AddonError, AddonResult};
use crate::host::{
    AddonChange, AddonFs, ElementId, RemovalCallback, RenderSurface, StyleHandle, ToastKind,
};
use crate::state::AddonState;

/// Root every in-memory descriptor location lives under.
pub const MEMORY_ROOT: &str = "/memory";

#[derive(Default)]
struct FsInner {
    plugins: Vec<AddonDescriptor>,
    themes: Vec<AddonDescriptor>,
    files: HashMap<PathBuf, String>,
    state: Value,
    saves: u64,
    failing_saves: u32,
    listing_fails: bool,
    read_delay: Option<Duration>,
    source_reads: u64,
    watch_tx: Option<mpsc::Sender<AddonChange>>,
}

/// An [`AddonFs`] backed by maps.
#[derive(Default)]
pub struct MemoryAddonFs {
    inner: Mutex<FsInner>,
}

impl std::fmt::Debug for MemoryAddonFs {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemoryAddonFs")
            .field("plugins", &inner.plugins.len())
            .field("themes", &inner.themes.len())
            .field("saves", &inner.saves)
            .finish_non_exhaustive()
    }
}

fn descriptor(id: &AddonId, kind: AddonKind, file: &str) -> AddonDescriptor {
    let dir = match kind {
        AddonKind::Plugin => "plugins",
        AddonKind::Theme => "themes",
    };
    AddonDescriptor {
        id: id.clone(),
        name: id.to_string(),
        author: String::new(),
        version: "0.1.0".into(),
        description: String::new(),
        source_url: None,
        website: None,
        location: Path::new(MEMORY_ROOT).join(dir).join(id.as_str()).join(file),
        kind,
        variables: Vec::new(),
    }
}

fn upsert(list: &mut Vec<AddonDescriptor>, descriptor: AddonDescriptor) {
    list.retain(|d| d.id != descriptor.id);
    list.push(descriptor);
}

impl MemoryAddonFs {
    /// Create an empty file system.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, FsInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Add (or replace) a plugin with a generated descriptor.
    pub fn add_plugin(&self, id: &str, source: &str) -> AddonDescriptor {
        let d = descriptor(&AddonId::from_static(id), AddonKind::Plugin, "main.rhai");
        self.add_plugin_descriptor(d.clone(), source);
        d
    }

    /// Add (or replace) a plugin with an explicit descriptor.
    pub fn add_plugin_descriptor(&self, descriptor: AddonDescriptor, source: &str) {
        let mut inner = self.lock();
        inner
            .files
            .insert(descriptor.location.clone(), source.to_string());
        upsert(&mut inner.plugins, descriptor);
    }

    /// Add (or replace) a theme declaring `variables` as `(name, default)`.
    pub fn add_theme(&self, id: &str, css: &str, variables: &[(&str, &str)]) -> AddonDescriptor {
        let mut d = descriptor(&AddonId::from_static(id), AddonKind::Theme, "theme.css");
        d.variables = variables
            .iter()
            .map(|(name, default)| StyleVariable {
                name: (*name).to_string(),
                default: (*default).to_string(),
                description: None,
            })
            .collect();
        let mut inner = self.lock();
        inner.files.insert(d.location.clone(), css.to_string());
        upsert(&mut inner.themes, d.clone());
        d
    }

    /// Remove an addon's descriptor (its files stay readable).
    pub fn remove_addon(&self, id: &str) {
        let mut inner = self.lock();
        inner.plugins.retain(|d| d.id.as_str() != id);
        inner.themes.retain(|d| d.id.as_str() != id);
    }

    /// Overwrite a file's contents.
    pub fn write_file(&self, location: &Path, text: &str) {
        self.lock()
            .files
            .insert(location.to_path_buf(), text.to_string());
    }

    /// Replace the stored state document.
    pub fn set_state(&self, value: Value) {
        self.lock().state = value;
    }

    /// The stored state document.
    #[must_use]
    pub fn state(&self) -> Value {
        self.lock().state.clone()
    }

    /// The stored state document, parsed.
    #[must_use]
    pub fn saved_state(&self) -> AddonState {
        AddonState::from_value(self.state())
    }

    /// Number of successful saves.
    #[must_use]
    pub fn save_count(&self) -> u64 {
        self.lock().saves
    }

    /// Number of plugin source reads served.
    #[must_use]
    pub fn source_reads(&self) -> u64 {
        self.lock().source_reads
    }

    /// Make the next `n` saves fail.
    pub fn fail_next_saves(&self, n: u32) {
        self.lock().failing_saves = n;
    }

    /// Make descriptor enumeration fail.
    pub fn set_listing_fails(&self, fails: bool) {
        self.lock().listing_fails = fails;
    }

    /// Delay every source and stylesheet read.
    pub fn set_read_delay(&self, delay: Option<Duration>) {
        self.lock().read_delay = delay;
    }

    /// Whether a watch channel is open.
    #[must_use]
    pub fn is_watching(&self) -> bool {
        self.lock().watch_tx.is_some()
    }

    /// Deliver a change event to the current watcher.
    ///
    /// Returns `false` if nothing is watching.
    pub async fn emit(&self, change: AddonChange) -> bool {
        let tx = self.lock().watch_tx.clone();
        match tx {
            Some(tx) => tx.send(change).await.is_ok(),
            None => false,
        }
    }

    fn listing(&self, kind: AddonKind) -> AddonResult<Vec<AddonDescriptor>> {
        let inner = self.lock();
        if inner.listing_fails {
            return Err(AddonError::EnumerateFailed {
                path: PathBuf::from(MEMORY_ROOT),
                message: "listing disabled".into(),
            });
        }
        Ok(match kind {
            AddonKind::Plugin => inner.plugins.clone(),
            AddonKind::Theme => inner.themes.clone(),
        })
    }

    async fn read(&self, location: &Path, count: bool) -> AddonResult<String> {
        let delay = self.lock().read_delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        let mut inner = self.lock();
        if count {
            inner.source_reads = inner.source_reads.saturating_add(1);
        }
        inner
            .files
            .get(location)
            .cloned()
            .ok_or_else(|| AddonError::ReadFailed {
                path: location.to_path_buf(),
                message: "no such file".into(),
            })
    }
}

#[async_trait]
impl AddonFs for MemoryAddonFs {
    async fn list_plugins(&self) -> AddonResult<Vec<AddonDescriptor>> {
        self.listing(AddonKind::Plugin)
    }

    async fn list_themes(&self) -> AddonResult<Vec<AddonDescriptor>> {
        self.listing(AddonKind::Theme)
    }

    async fn read_plugin_source(&self, location: &Path) -> AddonResult<String> {
        self.read(location, true).await
    }

    async fn read_theme_stylesheet(&self, location: &Path) -> AddonResult<String> {
        self.read(location, false).await
    }

    async fn load_state(&self) -> AddonResult<Value> {
        Ok(self.state())
    }

    async fn save_state(&self, state: &AddonState) -> AddonResult<()> {
        let value =
            serde_json::to_value(state).map_err(|e| AddonError::PersistFailed(e.to_string()))?;
        let mut inner = self.lock();
        if inner.failing_saves > 0 {
            inner.failing_saves = inner.failing_saves.saturating_sub(1);
            return Err(AddonError::PersistFailed("injected save failure".into()));
        }
        inner.state = value;
        inner.saves = inner.saves.saturating_add(1);
        Ok(())
    }

    async fn start_watching(&self) -> AddonResult<mpsc::Receiver<AddonChange>> {
        let (tx, rx) = mpsc::channel(64);
        self.lock().watch_tx = Some(tx);
        Ok(rx)
    }

    async fn stop_watching(&self) {
        self.lock().watch_tx = None;
    }
}

/// A style block currently attached to a [`MemorySurface`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InjectedStyle {
    /// Handle returned by `inject_style`.
    pub handle: StyleHandle,
    /// Stable key the injector passed.
    pub key: String,
    /// Injected stylesheet text.
    pub css: String,
    /// Variables set live on this block after injection.
    pub variables: BTreeMap<String, String>,
}

/// An element created on a [`MemorySurface`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryElement {
    /// Tag name.
    pub tag: String,
    /// Attributes set so far.
    pub attributes: BTreeMap<String, String>,
    /// Text content (or the source markup for parsed fragments).
    pub text: String,
    /// Children in append order.
    pub children: Vec<ElementId>,
    /// Whether the element is attached to the surface root.
    pub mounted: bool,
}

#[derive(Default)]
struct SurfaceInner {
    styles: Vec<InjectedStyle>,
    toasts: Vec<(String, ToastKind)>,
    elements: BTreeMap<ElementId, MemoryElement>,
    observers: HashMap<ElementId, Vec<RemovalCallback>>,
}

/// A [`RenderSurface`] that records everything done to it.
#[derive(Default)]
pub struct MemorySurface {
    inner: Mutex<SurfaceInner>,
    next_element: AtomicU64,
}

impl std::fmt::Debug for MemorySurface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.lock();
        f.debug_struct("MemorySurface")
            .field("styles", &inner.styles.len())
            .field("elements", &inner.elements.len())
            .finish_non_exhaustive()
    }
}

impl MemorySurface {
    /// Create an empty surface.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SurfaceInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn new_element(&self, element: MemoryElement) -> ElementId {
        let id = ElementId(self.next_element.fetch_add(1, Ordering::Relaxed));
        self.lock().elements.insert(id, element);
        id
    }

    /// Every attached style block, in injection order.
    #[must_use]
    pub fn styles(&self) -> Vec<InjectedStyle> {
        self.lock().styles.clone()
    }

    /// The attached style block injected under `key`, if any.
    #[must_use]
    pub fn style_for_key(&self, key: &str) -> Option<InjectedStyle> {
        self.lock().styles.iter().find(|s| s.key == key).cloned()
    }

    /// Toast messages shown so far.
    #[must_use]
    pub fn toasts(&self) -> Vec<String> {
        self.lock().toasts.iter().map(|(m, _)| m.clone()).collect()
    }

    /// Toasts with their kinds.
    #[must_use]
    pub fn toasts_with_kind(&self) -> Vec<(String, ToastKind)> {
        self.lock().toasts.clone()
    }

    /// Look up an element.
    #[must_use]
    pub fn element(&self, id: ElementId) -> Option<MemoryElement> {
        self.lock().elements.get(&id).cloned()
    }

    /// Elements attached to the surface root.
    #[must_use]
    pub fn mounted(&self) -> Vec<ElementId> {
        self.lock()
            .elements
            .iter()
            .filter(|(_, e)| e.mounted)
            .map(|(id, _)| *id)
            .collect()
    }
}

impl RenderSurface for MemorySurface {
    fn inject_style(&self, key: &str, css: &str) -> StyleHandle {
        let handle = StyleHandle(format!("{key}-{}", uuid::Uuid::new_v4()));
        self.lock().styles.push(InjectedStyle {
            handle: handle.clone(),
            key: key.to_string(),
            css: css.to_string(),
            variables: BTreeMap::new(),
        });
        handle
    }

    fn remove_style(&self, handle: &StyleHandle) {
        self.lock().styles.retain(|s| &s.handle != handle);
    }

    fn set_style_variable(&self, handle: &StyleHandle, name: &str, value: &str) {
        if let Some(style) = self.lock().styles.iter_mut().find(|s| &s.handle == handle) {
            style.variables.insert(name.to_string(), value.to_string());
        }
    }

    fn parse_markup(&self, fragment: &str) -> Result<ElementId, String> {
        let trimmed = fragment.trim();
        let Some(rest) = trimmed.strip_prefix('<') else {
            return Err(format!("markup must start with a tag: {trimmed:.40}"));
        };
        let tag: String = rest
            .chars()
            .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
            .collect();
        if tag.is_empty() || !trimmed.ends_with('>') {
            return Err(format!("malformed markup: {trimmed:.40}"));
        }
        Ok(self.new_element(MemoryElement {
            tag,
            text: trimmed.to_string(),
            ..MemoryElement::default()
        }))
    }

    fn observe_removal(&self, element: ElementId, callback: RemovalCallback) {
        self.lock()
            .observers
            .entry(element)
            .or_default()
            .push(callback);
    }

    fn toast(&self, message: &str, kind: ToastKind) {
        self.lock().toasts.push((message.to_string(), kind));
    }

    fn create_element(&self, tag: &str) -> ElementId {
        self.new_element(MemoryElement {
            tag: tag.to_string(),
            ..MemoryElement::default()
        })
    }

    fn set_attribute(&self, element: ElementId, name: &str, value: &str) {
        if let Some(e) = self.lock().elements.get_mut(&element) {
            e.attributes.insert(name.to_string(), value.to_string());
        }
    }

    fn set_text(&self, element: ElementId, text: &str) {
        if let Some(e) = self.lock().elements.get_mut(&element) {
            e.text = text.to_string();
        }
    }

    fn append_child(&self, parent: ElementId, child: ElementId) {
        if let Some(e) = self.lock().elements.get_mut(&parent) {
            e.children.push(child);
        }
    }

    fn mount(&self, element: ElementId) {
        if let Some(e) = self.lock().elements.get_mut(&element) {
            e.mounted = true;
        }
    }

    fn remove_element(&self, element: ElementId) {
        // Callbacks run after the lock is released; they may call back in.
        let callbacks = {
            let mut inner = self.lock();
            inner.elements.remove(&element);
            for e in inner.elements.values_mut() {
                e.children.retain(|c| *c != element);
            }
            inner.observers.remove(&element).unwrap_or_default()
        };
        for callback in callbacks {
            callback();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::AtomicBool;

    use super::*;

    #[test]
    fn removal_observers_fire_once() {
        let surface = MemorySurface::new();
        let el = surface.create_element("div");
        let fired = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&fired);
        surface.observe_removal(el, Box::new(move || flag.store(true, Ordering::SeqCst)));
        surface.remove_element(el);
        assert!(fired.load(Ordering::SeqCst));
        assert!(surface.element(el).is_none());
    }

    #[test]
    fn parse_markup_extracts_tag() {
        let surface = MemorySurface::new();
        let el = surface.parse_markup("<section class=\"x\">hi</section>").unwrap();
        assert_eq!(surface.element(el).unwrap().tag, "section");
        assert!(surface.parse_markup("plain text").is_err());
    }

    #[test]
    fn style_injection_and_removal() {
        let surface = MemorySurface::new();
        let handle = surface.inject_style("k", "a{}");
        surface.set_style_variable(&handle, "--x", "1");
        let style = surface.style_for_key("k").unwrap();
        assert_eq!(style.variables["--x"], "1");
        surface.remove_style(&handle);
        assert!(surface.styles().is_empty());
    }

    #[tokio::test]
    async fn save_failures_are_consumed() {
        let fs = MemoryAddonFs::new();
        fs.fail_next_saves(1);
        assert!(fs.save_state(&AddonState::default()).await.is_err());
        assert!(fs.save_state(&AddonState::default()).await.is_ok());
        assert_eq!(fs.save_count(), 1);
    }
}
