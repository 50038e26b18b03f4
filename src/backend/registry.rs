use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use crate::backend::contract::{BackendDescriptor, Credentials, ImageHostBackend};
use crate::backend::manifest;
use crate::backend::{catbox, imgur, pixhost};
use crate::errors::{AppError, AppResult};

#[derive(Default)]
struct RegistryInner {
    /// Built-in destinations in registration order.
    builtins: Vec<BackendDescriptor>,
    /// Destinations discovered from manifest files, keyed by name.
    plugins: HashMap<String, BackendDescriptor>,
}

/// All known upload destinations, built-in and discovered.
///
/// Lookups check built-ins before plugins, so a manifest cannot shadow a
/// built-in service. Among plugins, the last manifest loaded for a name
/// wins.
pub struct BackendRegistry {
    inner: RwLock<RegistryInner>,
    plugin_dir: Option<PathBuf>,
}

impl BackendRegistry {
    /// Registry with the built-in destinations and, when `plugin_dir` is
    /// given, any `*_plugin.json` manifests found there.
    pub fn new(plugin_dir: Option<&Path>) -> Self {
        let registry = Self {
            inner: RwLock::new(RegistryInner::default()),
            plugin_dir: plugin_dir.map(|p| p.to_path_buf()),
        };

        registry.register(catbox::descriptor());
        registry.register(imgur::descriptor());
        registry.register(pixhost::descriptor());

        if let Some(dir) = &registry.plugin_dir {
            let loaded = registry.load_plugins_from(&dir.clone());
            log::info!("Loaded {} plugin destination(s) from {}", loaded, dir.display());
        }

        registry
    }

    /// Registry with only the built-in destinations.
    pub fn builtin_only() -> Self {
        Self::new(None)
    }

    /// Add or replace a destination. Built-ins registered this way keep
    /// registration order; a duplicate name replaces the earlier entry.
    pub fn register(&self, descriptor: BackendDescriptor) {
        let mut inner = self.inner.write().unwrap();
        if let Some(existing) = inner.builtins.iter_mut().find(|d| d.name == descriptor.name) {
            *existing = descriptor;
        } else {
            inner.builtins.push(descriptor);
        }
    }

    fn load_plugins_from(&self, dir: &Path) -> usize {
        let mut discovered = HashMap::new();

        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("Cannot read plugin directory {}: {}", dir.display(), e);
                return 0;
            }
        };

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| n.to_string_lossy().ends_with("_plugin.json"))
                    .unwrap_or(false)
            })
            .collect();
        paths.sort();

        for path in paths {
            match manifest::load_manifest(&path) {
                Ok(descriptor) => {
                    if discovered.contains_key(&descriptor.name) {
                        log::warn!(
                            "Duplicate plugin name '{}' from {}, replacing earlier definition",
                            descriptor.name,
                            path.display()
                        );
                    }
                    log::debug!("Loaded plugin '{}' from {}", descriptor.name, path.display());
                    discovered.insert(descriptor.name.clone(), descriptor);
                }
                Err(e) => {
                    log::warn!("Skipping plugin manifest: {}", e);
                }
            }
        }

        let count = discovered.len();
        // Swap in the whole set at once so readers never see a half-loaded
        // plugin list.
        let mut inner = self.inner.write().unwrap();
        inner.plugins = discovered;
        count
    }

    /// Re-scan the plugin directory, replacing all plugin entries.
    pub fn reload_plugins(&self) -> usize {
        match self.plugin_dir.clone() {
            Some(dir) => self.load_plugins_from(&dir),
            None => 0,
        }
    }

    /// Destination names, built-ins first, plugins alphabetical after.
    pub fn list_destinations(&self) -> Vec<String> {
        let inner = self.inner.read().unwrap();
        let mut names: Vec<String> = inner.builtins.iter().map(|d| d.name.clone()).collect();
        let mut plugin_names: Vec<String> = inner
            .plugins
            .keys()
            .filter(|name| !names.contains(name))
            .cloned()
            .collect();
        plugin_names.sort();
        names.extend(plugin_names);
        names
    }

    pub fn has_destination(&self, name: &str) -> bool {
        let inner = self.inner.read().unwrap();
        inner.builtins.iter().any(|d| d.name == name) || inner.plugins.contains_key(name)
    }

    pub fn descriptor(&self, name: &str) -> AppResult<BackendDescriptor> {
        let inner = self.inner.read().unwrap();
        inner
            .builtins
            .iter()
            .find(|d| d.name == name)
            .or_else(|| inner.plugins.get(name))
            .cloned()
            .ok_or_else(|| AppError::unknown_destination(name))
    }

    /// Build a fresh backend instance for one task.
    pub fn instantiate(
        &self,
        name: &str,
        credentials: &Credentials,
        config: &serde_json::Value,
    ) -> AppResult<Box<dyn ImageHostBackend>> {
        let descriptor = self.descriptor(name)?;
        (descriptor.factory)(credentials, config)
    }

    /// Names of destinations that can create galleries.
    pub fn destinations_with_galleries(&self) -> Vec<String> {
        self.list_destinations()
            .into_iter()
            .filter(|name| {
                self.descriptor(name)
                    .map(|d| d.capabilities.supports_galleries)
                    .unwrap_or(false)
            })
            .collect()
    }
}
