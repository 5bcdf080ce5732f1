//! File-mtime-keyed memoization of introspection output.
//!
//! A cache entry is valid only while the tracked file set (entry module and
//! manifest) is unchanged and no tracked file has a newer mtime than the one
//! recorded when the descriptors were produced. This guarantees a hit can
//! never return descriptors for a function that is no longer in the source.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::SystemTime;
use tracing::{debug, info};

use super::{PluginDir, ToolDescriptor};

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub descriptors: Vec<ToolDescriptor>,
    pub file_mtimes: HashMap<String, SystemTime>,
    pub last_loaded: SystemTime,
}

/// Per-plugin cache statistics for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct PluginCacheStats {
    pub cached_tools: usize,
    pub last_loaded: String,
    pub tracked_files: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub total_cached_plugins: usize,
    pub plugins: BTreeMap<String, PluginCacheStats>,
}

/// In-memory introspection cache, keyed by plugin directory name.
/// Mutated only by the dynamic loader.
#[derive(Debug, Default)]
pub struct MetadataCache {
    entries: HashMap<String, CacheEntry>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the cached descriptors when the entry is still valid against
    /// the current on-disk state.
    pub fn lookup(&self, plugin: &PluginDir) -> Option<&[ToolDescriptor]> {
        let entry = self.entries.get(&plugin.name)?;
        let current = plugin.tracked_file_mtimes();

        if !entry_is_valid(&entry.file_mtimes, &current) {
            debug!("Cache entry for {} is stale", plugin.name);
            return None;
        }

        debug!("Cache hit for {}", plugin.name);
        Some(&entry.descriptors)
    }

    /// Replace the plugin's entry using the current file mtimes.
    pub fn update(&mut self, plugin: &PluginDir, descriptors: Vec<ToolDescriptor>) {
        info!(
            "Updated cache for {} with {} tools",
            plugin.name,
            descriptors.len()
        );
        self.entries.insert(
            plugin.name.clone(),
            CacheEntry {
                descriptors,
                file_mtimes: plugin.tracked_file_mtimes(),
                last_loaded: SystemTime::now(),
            },
        );
    }

    /// Drop the entry for one plugin. Returns whether an entry existed.
    pub fn invalidate(&mut self, plugin_name: &str) -> bool {
        let existed = self.entries.remove(plugin_name).is_some();
        if existed {
            info!("Invalidated cache for {}", plugin_name);
        }
        existed
    }

    /// Drop one entry or all entries. Returns how many were removed.
    pub fn clear(&mut self, plugin_name: Option<&str>) -> usize {
        match plugin_name {
            Some(name) => {
                if self.invalidate(name) {
                    1
                } else {
                    0
                }
            }
            None => {
                let count = self.entries.len();
                self.entries.clear();
                info!("Cleared cache for {} plugins", count);
                count
            }
        }
    }

    pub fn stats(&self) -> CacheStats {
        let plugins = self
            .entries
            .iter()
            .map(|(name, entry)| {
                let stamp: chrono::DateTime<chrono::Local> = entry.last_loaded.into();
                let mut tracked: Vec<String> = entry.file_mtimes.keys().cloned().collect();
                tracked.sort();
                (
                    name.clone(),
                    PluginCacheStats {
                        cached_tools: entry.descriptors.len(),
                        last_loaded: stamp.format("%Y-%m-%d %H:%M:%S").to_string(),
                        tracked_files: tracked,
                    },
                )
            })
            .collect();

        CacheStats {
            total_cached_plugins: self.entries.len(),
            plugins,
        }
    }

    #[cfg(test)]
    fn entry_mut(&mut self, plugin_name: &str) -> Option<&mut CacheEntry> {
        self.entries.get_mut(plugin_name)
    }
}

/// Validity rule: the tracked file set matches the current on-disk set and
/// no tracked file's current mtime exceeds the recorded one.
fn entry_is_valid(
    recorded: &HashMap<String, SystemTime>,
    current: &HashMap<String, SystemTime>,
) -> bool {
    if recorded.len() != current.len() {
        return false;
    }
    for (file_name, current_mtime) in current {
        match recorded.get(file_name) {
            Some(recorded_mtime) => {
                if current_mtime > recorded_mtime {
                    return false;
                }
            }
            None => return false,
        }
    }
    true
}
