//! Headless render surface that reports through `tracing`.

use tracing::{debug, info, warn};

use crate::host::{ElementId, RemovalCallback, RenderSurface, StyleHandle, ToastKind};
use crate::memory::{InjectedStyle, MemorySurface};

/// A [`RenderSurface`] for hosts without a UI.
///
/// Keeps the same bookkeeping as [`MemorySurface`] so element handles and
/// removal observers behave, and logs every visible effect.
#[derive(Debug, Default)]
pub struct LogSurface {
    inner: MemorySurface,
}

impl LogSurface {
    /// Create an empty surface.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Style blocks currently attached.
    #[must_use]
    pub fn styles(&self) -> Vec<InjectedStyle> {
        self.inner.styles()
    }
}

impl RenderSurface for LogSurface {
    fn inject_style(&self, key: &str, css: &str) -> StyleHandle {
        let handle = self.inner.inject_style(key, css);
        info!(key, %handle, bytes = css.len(), "Injected style");
        handle
    }

    fn remove_style(&self, handle: &StyleHandle) {
        self.inner.remove_style(handle);
        info!(%handle, "Removed style");
    }

    fn set_style_variable(&self, handle: &StyleHandle, name: &str, value: &str) {
        self.inner.set_style_variable(handle, name, value);
        info!(%handle, variable = name, value, "Set style variable");
    }

    fn parse_markup(&self, fragment: &str) -> Result<ElementId, String> {
        let parsed = self.inner.parse_markup(fragment);
        match &parsed {
            Ok(element) => debug!(%element, "Parsed markup"),
            Err(e) => warn!(error = %e, "Rejected markup"),
        }
        parsed
    }

    fn observe_removal(&self, element: ElementId, callback: RemovalCallback) {
        self.inner.observe_removal(element, callback);
    }

    fn toast(&self, message: &str, kind: ToastKind) {
        self.inner.toast(message, kind);
        match kind {
            ToastKind::Error | ToastKind::Warning => warn!(?kind, "{message}"),
            ToastKind::Info | ToastKind::Success => info!(?kind, "{message}"),
        }
    }

    fn create_element(&self, tag: &str) -> ElementId {
        let element = self.inner.create_element(tag);
        debug!(%element, tag, "Created element");
        element
    }

    fn set_attribute(&self, element: ElementId, name: &str, value: &str) {
        self.inner.set_attribute(element, name, value);
    }

    fn set_text(&self, element: ElementId, text: &str) {
        self.inner.set_text(element, text);
    }

    fn append_child(&self, parent: ElementId, child: ElementId) {
        self.inner.append_child(parent, child);
    }

    fn mount(&self, element: ElementId) {
        self.inner.mount(element);
        info!(%element, "Mounted element");
    }

    fn remove_element(&self, element: ElementId) {
        self.inner.remove_element(element);
        debug!(%element, "Removed element");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_styles_like_memory_surface() {
        let surface = LogSurface::new();
        let handle = surface.inject_style("quill-theme-dusk", ":root {}");
        assert_eq!(surface.styles().len(), 1);
        surface.remove_style(&handle);
        assert!(surface.styles().is_empty());
    }
}
