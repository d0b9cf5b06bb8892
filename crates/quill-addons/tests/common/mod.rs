//! Shared fixtures for the addon runtime integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use quill_addons::{
    AddonConfig, AddonFs, AddonHost, AddonId, AddonSystem, MemoryAddonFs, MemorySurface,
    PluginManager, RenderSurface, ScriptLimits, StateStore, ThemeManager,
};

pub const LOAD_TIMEOUT: Duration = Duration::from_secs(2);

/// In-memory collaborators plus constructors for everything built on them.
pub struct Harness {
    pub fs: Arc<MemoryAddonFs>,
    pub surface: Arc<MemorySurface>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            fs: Arc::new(MemoryAddonFs::new()),
            surface: Arc::new(MemorySurface::new()),
        }
    }

    fn dyn_fs(&self) -> Arc<dyn AddonFs> {
        Arc::clone(&self.fs) as Arc<dyn AddonFs>
    }

    fn dyn_surface(&self) -> Arc<dyn RenderSurface> {
        Arc::clone(&self.surface) as Arc<dyn RenderSurface>
    }

    pub async fn store(&self) -> Arc<StateStore> {
        Arc::new(StateStore::load(self.dyn_fs()).await)
    }

    pub fn plugin_manager(&self, store: &Arc<StateStore>) -> PluginManager {
        PluginManager::new(
            self.dyn_fs(),
            Arc::clone(store),
            self.dyn_surface(),
            ScriptLimits::default(),
            LOAD_TIMEOUT,
        )
    }

    pub fn theme_manager(&self, store: &Arc<StateStore>) -> ThemeManager {
        ThemeManager::new(self.dyn_fs(), Arc::clone(store), self.dyn_surface(), LOAD_TIMEOUT)
    }

    pub fn system(&self, watch: bool) -> AddonSystem {
        let config = AddonConfig {
            watch,
            debounce_ms: 10,
            load_timeout_ms: 2_000,
            ..AddonConfig::default()
        };
        AddonSystem::new(
            AddonHost {
                fs: self.dyn_fs(),
                surface: self.dyn_surface(),
            },
            config,
        )
    }

    pub fn toast_count(&self, message: &str) -> usize {
        self.surface
            .toasts()
            .iter()
            .filter(|t| t.as_str() == message)
            .count()
    }
}

pub fn id(s: &str) -> AddonId {
    AddonId::new(s).unwrap()
}

/// Poll `check` until it holds or two seconds pass.
pub async fn eventually(mut check: impl FnMut() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
