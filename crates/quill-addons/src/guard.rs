//! Per-addon in-flight tracking.
//!
//! Lifecycle operations on the same addon must not interleave across await
//! points. Each operation claims the addon id for its duration; a second
//! claim while the first is held fails instead of waiting. A reload that
//! finds its addon claimed is dropped and reported as
//! [`ReloadOutcome::Coalesced`].

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use crate::descriptor::AddonId;

/// Result of reloading an addon.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadOutcome {
    /// The addon was re-read. `active` reports whether it is started
    /// (plugins) or injected (themes) afterwards.
    Reloaded {
        /// Whether the addon is running after the reload.
        active: bool,
    },
    /// Another operation on the addon was in flight; this request was dropped.
    Coalesced,
    /// The addon no longer exists on disk and was unloaded.
    Removed,
}

/// Set of addon ids with an operation in flight.
#[derive(Debug, Default, Clone)]
pub(crate) struct InFlight {
    ids: Arc<Mutex<HashSet<AddonId>>>,
}

impl InFlight {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Claim `id`. Returns `None` if another operation holds it.
    pub(crate) fn try_claim(&self, id: &AddonId) -> Option<InFlightGuard> {
        let mut ids = self.ids.lock().unwrap_or_else(PoisonError::into_inner);
        if !ids.insert(id.clone()) {
            return None;
        }
        Some(InFlightGuard {
            ids: Arc::clone(&self.ids),
            id: id.clone(),
        })
    }

    /// Whether `id` is currently claimed.
    #[cfg(test)]
    pub(crate) fn is_busy(&self, id: &AddonId) -> bool {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(id)
    }
}

/// Releases the claim on drop.
#[derive(Debug)]
pub(crate) struct InFlightGuard {
    ids: Arc<Mutex<HashSet<AddonId>>>,
    id: AddonId,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.ids
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.id);
    }
}
