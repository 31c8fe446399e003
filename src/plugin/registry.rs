use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::{info, warn};

use super::{AfterEffectsPlugin, FfmpegPlugin, PluginInfo, RenderPlugin};

/// Name-keyed set of renderer integrations.
///
/// Built explicitly at startup and shared by reference; there is no global
/// instance.
#[derive(Clone, Default)]
pub struct PluginRegistry {
    plugins: BTreeMap<String, Arc<dyn RenderPlugin>>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry preloaded with the built-in After Effects and FFmpeg plugins.
    pub fn with_builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(AfterEffectsPlugin::new()));
        registry.register(Arc::new(FfmpegPlugin::new()));
        registry
    }

    pub fn register(&mut self, plugin: Arc<dyn RenderPlugin>) {
        let name = plugin.name().to_string();
        if self.plugins.contains_key(&name) {
            warn!(plugin = %name, "Plugin already registered, replacing");
        }
        info!(plugin = %name, display_name = %plugin.display_name(), "Registered plugin");
        self.plugins.insert(name, plugin);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn RenderPlugin>> {
        self.plugins.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.plugins.contains_key(name)
    }

    /// Names of all registered plugins, sorted.
    pub fn names(&self) -> Vec<String> {
        self.plugins.keys().cloned().collect()
    }

    pub fn list(&self) -> Vec<PluginInfo> {
        self.plugins.values().map(|p| p.info()).collect()
    }
}

impl std::fmt::Debug for PluginRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PluginRegistry")
            .field("plugins", &self.names())
            .finish()
    }
}
