//! Plugin discovery and registry reconciliation.
//!
//! `scan_and_load` enumerates plugin directories, consults the metadata
//! cache, and provisions + introspects on misses; `reconcile` aligns the
//! registry with the loaded set and records the diff. All registry
//! mutation funnels through the refresh mutex, making one refresh pass the
//! serialization point for the whole engine.

use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{error, info, warn};

use super::cache::{CacheStats, MetadataCache};
use super::changes::{ChangeSet, ChangeSummary, ChangeTracker};
use super::envs::EnvironmentManager;
use super::introspect::introspect_plugin;
use super::proxy::ToolProxy;
use super::workers::WorkerScripts;
use super::{plugin_directories, PluginDir, ToolDescriptor, TOOL_FILE};
use crate::config::ServerConfig;
use crate::error::{map_io_err, ToolHostError, ToolHostResult};
use crate::registry::{ToolHandler, ToolKind, ToolRegistry};

/// One successfully discovered tool: its descriptor plus the proxy bound
/// to the plugin's environment.
#[derive(Debug, Clone)]
pub struct LoadedTool {
    pub descriptor: ToolDescriptor,
    pub proxy: ToolProxy,
}

/// Per-plugin load failure. Other plugins are unaffected.
#[derive(Debug, Clone, Serialize)]
pub struct PluginError {
    pub plugin: String,
    pub error: String,
}

/// Result of one `scan_and_load` pass.
#[derive(Debug, Default)]
pub struct LoadReport {
    pub tools: HashMap<String, LoadedTool>,
    pub errors: Vec<PluginError>,
    pub cache_hits: usize,
    pub cache_misses: usize,
}

impl LoadReport {
    /// Plugins that failed this pass; their previously registered tools
    /// must survive reconciliation.
    pub fn failed_plugins(&self) -> HashSet<&str> {
        self.errors.iter().map(|e| e.plugin.as_str()).collect()
    }
}

/// Drives environment provisioning, introspection, caching, and registry
/// reconciliation for every plugin under the plugin root.
pub struct DynamicLoader {
    plugin_root: PathBuf,
    envs: EnvironmentManager,
    scripts: WorkerScripts,
    cache: Mutex<MetadataCache>,
    tracker: Mutex<ChangeTracker>,
    refresh_lock: tokio::sync::Mutex<()>,
    introspection_timeout: Duration,
    execution_timeout: Duration,
}

impl DynamicLoader {
    pub fn new(config: &ServerConfig) -> ToolHostResult<Self> {
        std::fs::create_dir_all(&config.plugin_root).map_err(map_io_err(&config.plugin_root))?;
        let scripts = WorkerScripts::materialize(&config.plugin_root)?;
        let envs = EnvironmentManager::new(Duration::from_secs(config.install_timeout_secs))?;
        Ok(Self::with_env_manager(config, envs, scripts))
    }

    /// Assemble a loader around an existing environment manager. Used by
    /// `new` and by tests that must not touch a real interpreter.
    pub fn with_env_manager(
        config: &ServerConfig,
        envs: EnvironmentManager,
        scripts: WorkerScripts,
    ) -> Self {
        Self {
            plugin_root: config.plugin_root.clone(),
            envs,
            scripts,
            cache: Mutex::new(MetadataCache::new()),
            tracker: Mutex::new(ChangeTracker::new(config.change_log_capacity)),
            refresh_lock: tokio::sync::Mutex::new(()),
            introspection_timeout: Duration::from_secs(config.introspection_timeout_secs),
            execution_timeout: Duration::from_secs(config.execution_timeout_secs),
        }
    }

    pub fn plugin_root(&self) -> &Path {
        &self.plugin_root
    }

    pub fn envs(&self) -> &EnvironmentManager {
        &self.envs
    }

    /// Resolve a plugin name to its directory, validating the name first.
    pub fn plugin_dir(&self, name: &str) -> ToolHostResult<PluginDir> {
        if !crate::is_valid_plugin_name(name) {
            return Err(ToolHostError::InvalidPluginName {
                name: name.to_string(),
            });
        }
        let path = self.plugin_root.join(name);
        if !path.is_dir() {
            return Err(ToolHostError::PluginNotFound {
                name: name.to_string(),
            });
        }
        Ok(PluginDir::new(name, path))
    }

    /// Enumerate plugin directories, optionally narrowed to one plugin,
    /// and produce proxies for every discoverable tool.
    pub async fn scan_and_load(&self, target: Option<&str>) -> ToolHostResult<LoadReport> {
        let mut report = LoadReport::default();

        let dirs: Vec<PluginDir> = plugin_directories(&self.plugin_root)?
            .into_iter()
            .filter(|dir| target.map_or(true, |t| t == dir.name))
            .collect();

        // Partition into cache hits and plugins needing a full load, then
        // load the misses concurrently so one stuck plugin cannot starve
        // the others.
        let mut pending = Vec::new();
        for dir in dirs {
            match self.try_cached(&dir) {
                Some(loaded) => {
                    report.cache_hits += 1;
                    info!(
                        "Cache HIT: {} tools from cache for {}",
                        loaded.len(),
                        dir.name
                    );
                    for tool in loaded {
                        report.tools.insert(tool.descriptor.name.clone(), tool);
                    }
                }
                None => pending.push(dir),
            }
        }

        let loads = pending.iter().map(|dir| self.load_plugin(dir));
        for (dir, result) in pending.iter().zip(futures::future::join_all(loads).await) {
            report.cache_misses += 1;
            info!("Cache MISS: loading tools from environment for {}", dir.name);
            match result {
                Ok(loaded) => {
                    for tool in loaded {
                        report.tools.insert(tool.descriptor.name.clone(), tool);
                    }
                }
                Err(e) => {
                    error!("Error loading tools from {}: {}", dir.name, e);
                    report.errors.push(PluginError {
                        plugin: dir.name.clone(),
                        error: e.to_string(),
                    });
                }
            }
        }

        info!(
            "Tool loading summary: {} tools, {} errors, {} cache hits, {} cache misses",
            report.tools.len(),
            report.errors.len(),
            report.cache_hits,
            report.cache_misses
        );
        Ok(report)
    }

    /// Synchronize the registry with a load report.
    ///
    /// Loaded tools are removed and re-added so the registry adopts the
    /// current proxy and schema. Qualified names absent from the report are
    /// dropped; with a `scope`, only names under that plugin prefix.
    /// Plugins that failed this pass keep their registered tools until they
    /// load successfully again or an operator cleans them up.
    pub fn reconcile(
        &self,
        registry: &ToolRegistry,
        report: &LoadReport,
        scope: Option<&str>,
    ) -> ToolHostResult<ChangeSet> {
        let failed = report.failed_plugins();

        for (name, loaded) in &report.tools {
            if registry.contains(name)? {
                registry.remove(name)?;
            }
            registry.add(
                loaded.descriptor.clone(),
                ToolKind::Dynamic,
                proxy_handler(loaded.proxy.clone()),
            )?;
        }

        for name in registry.dynamic_names()? {
            if report.tools.contains_key(&name) {
                continue;
            }
            let Some(prefix) = crate::plugin_prefix(&name) else {
                continue;
            };
            if failed.contains(prefix) {
                warn!("Keeping '{}' despite load failure of '{}'", name, prefix);
                continue;
            }
            let in_scope = scope.map_or(true, |s| s == prefix);
            if in_scope {
                info!("Removing stale tool '{}'", name);
                registry.remove(&name)?;
            }
        }

        let snapshot = registry.snapshot()?;
        let diff = self
            .tracker
            .lock()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))?
            .record(snapshot);

        if !diff.is_empty() {
            info!(
                "Registry changed: {} added, {} removed, {} modified",
                diff.added.len(),
                diff.removed.len(),
                diff.modified.len()
            );
        }
        Ok(diff)
    }

    /// Scan and reconcile under the refresh mutex: the single serialization
    /// point for registry mutation, shared by the middleware and the
    /// refresh admin tool.
    pub async fn refresh(
        &self,
        registry: &ToolRegistry,
        target: Option<&str>,
    ) -> ToolHostResult<(ChangeSet, Vec<PluginError>)> {
        let _guard = self.refresh_lock.lock().await;
        let report = self.scan_and_load(target).await?;
        let diff = self.reconcile(registry, &report, target)?;
        Ok((diff, report.errors))
    }

    /// Cached descriptors turned into proxies, or None on a stale entry.
    /// A cache hit with a broken environment is treated as a miss so the
    /// load path recreates the interpreter.
    fn try_cached(&self, dir: &PluginDir) -> Option<Vec<LoadedTool>> {
        let cache = self.cache.lock().ok()?;
        let descriptors = cache.lookup(dir)?.to_vec();
        drop(cache);

        let interpreter = match self.envs.interpreter_path(dir) {
            Ok(path) => path,
            Err(e) => {
                warn!(
                    "Cached entry for {} unusable ({}); reloading",
                    dir.name, e
                );
                return None;
            }
        };

        self.build_proxies(dir, descriptors, &interpreter).ok()
    }

    /// Full load path: provision the environment, install dependencies,
    /// introspect, and update the cache.
    async fn load_plugin(&self, dir: &PluginDir) -> ToolHostResult<Vec<LoadedTool>> {
        if !dir.tool_file().exists() {
            return Err(ToolHostError::plugin_load(
                &dir.name,
                format!("No {} found in {}", TOOL_FILE, dir.path.display()),
            ));
        }

        self.envs
            .ensure(dir)
            .await
            .map_err(|e| ToolHostError::plugin_load(&dir.name, e.to_string()))?;

        let install = self.envs.install_requirements(dir).await?;
        if !install.success {
            return Err(ToolHostError::plugin_load(
                &dir.name,
                format!(
                    "{}: {}",
                    install.message,
                    install.stderr_lines.join("; ")
                ),
            ));
        }

        let interpreter = self
            .envs
            .interpreter_path(dir)
            .map_err(|e| ToolHostError::plugin_load(&dir.name, e.to_string()))?;

        let descriptors = introspect_plugin(
            &interpreter,
            &self.scripts.loader,
            dir,
            self.introspection_timeout,
        )
        .await?;

        if let Ok(mut cache) = self.cache.lock() {
            cache.update(dir, descriptors.clone());
        }

        self.build_proxies(dir, descriptors, &interpreter)
    }

    fn build_proxies(
        &self,
        dir: &PluginDir,
        descriptors: Vec<ToolDescriptor>,
        interpreter: &Path,
    ) -> ToolHostResult<Vec<LoadedTool>> {
        descriptors
            .into_iter()
            .map(|descriptor| {
                let proxy = ToolProxy::new(
                    descriptor.clone(),
                    &dir.path,
                    interpreter,
                    &self.scripts.executor,
                    self.execution_timeout,
                )?;
                Ok(LoadedTool { descriptor, proxy })
            })
            .collect()
    }

    pub fn cache_stats(&self) -> ToolHostResult<CacheStats> {
        Ok(self
            .cache
            .lock()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))?
            .stats())
    }

    pub fn invalidate_cache(&self, plugin_name: &str) -> ToolHostResult<bool> {
        Ok(self
            .cache
            .lock()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))?
            .invalidate(plugin_name))
    }

    pub fn clear_cache(&self, plugin_name: Option<&str>) -> ToolHostResult<usize> {
        Ok(self
            .cache
            .lock()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))?
            .clear(plugin_name))
    }

    /// Seed the cache with known descriptors. Exposed for tests.
    #[cfg(test)]
    pub fn seed_cache(&self, dir: &PluginDir, descriptors: Vec<ToolDescriptor>) {
        self.cache.lock().unwrap().update(dir, descriptors);
    }

    pub fn change_summary(&self) -> ToolHostResult<ChangeSummary> {
        Ok(self
            .tracker
            .lock()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))?
            .summary())
    }
}

/// Wrap a proxy in the registry's single-callable handler form. MCP
/// arguments arrive named, so they all travel as keyword arguments.
fn proxy_handler(proxy: ToolProxy) -> ToolHandler {
    Arc::new(move |kwargs| {
        let proxy = proxy.clone();
        Box::pin(async move { proxy.invoke(Vec::new(), kwargs).await })
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugins::workers::WorkerScripts;

    fn test_loader(root: &Path) -> DynamicLoader {
        let config = ServerConfig {
            plugin_root: root.to_path_buf(),
            ..ServerConfig::default()
        };
        let scripts = WorkerScripts::materialize(root).unwrap();
        // A fixed interpreter path: these tests never spawn it.
        let envs = EnvironmentManager::with_base_interpreter(
            PathBuf::from("python3"),
            Duration::from_secs(600),
        );
        DynamicLoader::with_env_manager(&config, envs, scripts)
    }

    fn descriptor(name: &str) -> ToolDescriptor {
        let (prefix, function) = name.split_once('-').unwrap_or(("", name));
        ToolDescriptor {
            name: name.to_string(),
            description: format!("Tool function {}", function),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            tags: Vec::new(),
            source_module: "tool.py".to_string(),
            function_name: function.to_string(),
            tool_name_prefix: prefix.to_string(),
        }
    }

    fn make_plugin(root: &Path, name: &str) -> PluginDir {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tool.py"), "def f():\n    pass\n").unwrap();
        PluginDir::new(name, dir)
    }

    /// Fake venv layout so `interpreter_path` resolves without spawning
    /// anything.
    fn make_fake_venv(plugin: &PluginDir) {
        let bin = plugin.venv_dir().join(if cfg!(windows) { "Scripts" } else { "bin" });
        std::fs::create_dir_all(&bin).unwrap();
        let python = bin.join(if cfg!(windows) { "python.exe" } else { "python" });
        std::fs::write(python, "").unwrap();
    }

    fn loaded_report(loader: &DynamicLoader, plugins: &[(&PluginDir, &[&str])]) -> LoadReport {
        let mut report = LoadReport::default();
        for (plugin, names) in plugins.iter().copied() {
            make_fake_venv(plugin);
            let interpreter = loader.envs().interpreter_path(plugin).unwrap();
            for name in names.iter().copied() {
                let tool = loader
                    .build_proxies(plugin, vec![descriptor(name)], &interpreter)
                    .unwrap()
                    .remove(0);
                report.tools.insert(name.to_string(), tool);
            }
        }
        report
    }

    #[tokio::test]
    async fn test_scan_records_error_for_missing_entry_file() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        std::fs::create_dir(root.path().join("broken")).unwrap();

        let report = loader.scan_and_load(None).await.unwrap();
        assert!(report.tools.is_empty());
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].plugin, "broken");
        assert!(report.errors[0].error.contains("tool.py"));
    }

    #[tokio::test]
    async fn test_scan_uses_cache_hits_without_reloading() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let plugin = make_plugin(root.path(), "calc");
        make_fake_venv(&plugin);
        loader.seed_cache(&plugin, vec![descriptor("calc-add")]);

        let report = loader.scan_and_load(None).await.unwrap();
        assert_eq!(report.cache_hits, 1);
        assert_eq!(report.cache_misses, 0);
        assert!(report.tools.contains_key("calc-add"));
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_scan_target_filters_to_one_plugin() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let calc = make_plugin(root.path(), "calc");
        let weather = make_plugin(root.path(), "weather");
        make_fake_venv(&calc);
        make_fake_venv(&weather);
        loader.seed_cache(&calc, vec![descriptor("calc-add")]);
        loader.seed_cache(&weather, vec![descriptor("weather-now")]);

        let report = loader.scan_and_load(Some("calc")).await.unwrap();
        assert_eq!(report.tools.len(), 1);
        assert!(report.tools.contains_key("calc-add"));
    }

    #[tokio::test]
    async fn test_reconcile_adds_and_removes() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let registry = ToolRegistry::new();
        let calc = make_plugin(root.path(), "calc");

        let report = loaded_report(&loader, &[(&calc, &["calc-add", "calc-sub"])]);
        let diff = loader.reconcile(&registry, &report, None).unwrap();
        assert_eq!(diff.added.len(), 2);
        assert!(registry.contains("calc-add").unwrap());

        // Drop calc-sub from the loaded set: a full reconcile removes it.
        let report = loaded_report(&loader, &[(&calc, &["calc-add"])]);
        let diff = loader.reconcile(&registry, &report, None).unwrap();
        assert_eq!(diff.removed, vec!["calc-sub"]);
        assert!(!registry.contains("calc-sub").unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let registry = ToolRegistry::new();
        let calc = make_plugin(root.path(), "calc");

        let report = loaded_report(&loader, &[(&calc, &["calc-add"])]);
        let first = loader.reconcile(&registry, &report, None).unwrap();
        assert!(!first.is_empty());

        let report = loaded_report(&loader, &[(&calc, &["calc-add"])]);
        let second = loader.reconcile(&registry, &report, None).unwrap();
        assert!(second.is_empty());
        assert_eq!(registry.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_scoped_reconcile_leaves_other_plugins_alone() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let registry = ToolRegistry::new();
        let calc = make_plugin(root.path(), "calc");
        let weather = make_plugin(root.path(), "weather");

        let report = loaded_report(
            &loader,
            &[(&calc, &["calc-add"]), (&weather, &["weather-now"])],
        );
        loader.reconcile(&registry, &report, None).unwrap();

        // Targeted refresh of calc discovered nothing for calc.
        let report = loaded_report(&loader, &[]);
        let diff = loader.reconcile(&registry, &report, Some("calc")).unwrap();
        assert_eq!(diff.removed, vec!["calc-add"]);
        assert!(registry.contains("weather-now").unwrap());
    }

    #[tokio::test]
    async fn test_failed_plugin_keeps_registered_tools() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let registry = ToolRegistry::new();
        let calc = make_plugin(root.path(), "calc");

        let report = loaded_report(&loader, &[(&calc, &["calc-add"])]);
        loader.reconcile(&registry, &report, None).unwrap();

        // Next pass: calc fails to load. Its tools survive.
        let mut report = loaded_report(&loader, &[]);
        report.errors.push(PluginError {
            plugin: "calc".to_string(),
            error: "import exploded".to_string(),
        });
        let diff = loader.reconcile(&registry, &report, None).unwrap();
        assert!(diff.is_empty());
        assert!(registry.contains("calc-add").unwrap());
    }

    #[tokio::test]
    async fn test_reconcile_never_touches_builtins() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        let registry = ToolRegistry::new();
        registry
            .add(
                descriptor("refresh_tools"),
                ToolKind::Builtin,
                crate::registry::value_handler(serde_json::Value::Null),
            )
            .unwrap();

        let report = loaded_report(&loader, &[]);
        loader.reconcile(&registry, &report, None).unwrap();
        assert!(registry.contains("refresh_tools").unwrap());
    }

    #[tokio::test]
    async fn test_plugin_dir_validates_name_and_existence() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        make_plugin(root.path(), "calc");

        assert!(loader.plugin_dir("calc").is_ok());
        assert!(matches!(
            loader.plugin_dir("_hidden"),
            Err(ToolHostError::InvalidPluginName { .. })
        ));
        assert!(matches!(
            loader.plugin_dir("ghost"),
            Err(ToolHostError::PluginNotFound { .. })
        ));
    }
}
