//! Request middleware pipeline.
//!
//! An ordered list of interceptors, each taking a context and a
//! continuation. The dynamic-refresh layer is one position in that chain:
//! it refreshes the registry (fully for `list_tools`, targeted for a
//! qualified `call_tool`) before forwarding, so replies always reflect
//! on-disk state as observed at the start of the request.

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::ToolHostResult;
use crate::plugins::loader::DynamicLoader;
use crate::plugins::ToolDescriptor;
use crate::registry::{ToolKind, ToolRegistry};

/// One inbound `call_tool` request.
#[derive(Debug, Clone)]
pub struct CallRequest {
    pub name: String,
    pub arguments: serde_json::Map<String, Value>,
}

/// A middleware interceptor. Default implementations forward unchanged.
#[async_trait]
pub trait ToolMiddleware: Send + Sync {
    async fn on_list_tools(
        &self,
        next: ListNext<'_>,
    ) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
        next.run().await
    }

    async fn on_call_tool<'a>(
        &self,
        request: &'a CallRequest,
        next: CallNext<'a>,
    ) -> ToolHostResult<Value> {
        next.run(request).await
    }
}

/// Continuation for the list path: the remaining interceptors, terminated
/// by the registry snapshot.
pub struct ListNext<'a> {
    rest: &'a [Arc<dyn ToolMiddleware>],
    registry: &'a ToolRegistry,
}

impl<'a> ListNext<'a> {
    pub fn run(self) -> BoxFuture<'a, ToolHostResult<Vec<(ToolDescriptor, ToolKind)>>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => {
                    head.on_list_tools(ListNext {
                        rest,
                        registry: self.registry,
                    })
                    .await
                }
                None => self.registry.list(),
            }
        })
    }
}

/// Continuation for the call path, terminated by registry dispatch.
pub struct CallNext<'a> {
    rest: &'a [Arc<dyn ToolMiddleware>],
    registry: &'a ToolRegistry,
}

impl<'a> CallNext<'a> {
    pub fn run(self, request: &'a CallRequest) -> BoxFuture<'a, ToolHostResult<Value>> {
        Box::pin(async move {
            match self.rest.split_first() {
                Some((head, rest)) => {
                    head.on_call_tool(
                        request,
                        CallNext {
                            rest,
                            registry: self.registry,
                        },
                    )
                    .await
                }
                None => {
                    self.registry
                        .call(&request.name, request.arguments.clone())
                        .await
                }
            }
        })
    }
}

/// Ordered middleware chain in front of the registry.
#[derive(Clone)]
pub struct MiddlewarePipeline {
    middlewares: Vec<Arc<dyn ToolMiddleware>>,
    registry: Arc<ToolRegistry>,
}

impl MiddlewarePipeline {
    pub fn new(registry: Arc<ToolRegistry>) -> Self {
        Self {
            middlewares: Vec::new(),
            registry,
        }
    }

    /// Append a middleware; earlier additions run further out.
    pub fn with(mut self, middleware: Arc<dyn ToolMiddleware>) -> Self {
        self.middlewares.push(middleware);
        self
    }

    pub async fn list_tools(&self) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
        ListNext {
            rest: &self.middlewares,
            registry: &self.registry,
        }
        .run()
        .await
    }

    pub async fn call_tool(&self, request: CallRequest) -> ToolHostResult<Value> {
        CallNext {
            rest: &self.middlewares,
            registry: &self.registry,
        }
        .run(&request)
        .await
    }
}

/// The core refresh layer: keeps the registry eventually consistent with
/// on-disk plugin state at well-defined points in request handling.
pub struct DynamicRefreshLayer {
    loader: Arc<DynamicLoader>,
    registry: Arc<ToolRegistry>,
}

impl DynamicRefreshLayer {
    pub fn new(loader: Arc<DynamicLoader>, registry: Arc<ToolRegistry>) -> Self {
        Self { loader, registry }
    }
}

#[async_trait]
impl ToolMiddleware for DynamicRefreshLayer {
    async fn on_list_tools(
        &self,
        next: ListNext<'_>,
    ) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
        if let Err(e) = self.loader.refresh(&self.registry, None).await {
            warn!("Full refresh before list_tools failed: {}", e);
        }
        next.run().await
    }

    async fn on_call_tool<'a>(
        &self,
        request: &'a CallRequest,
        next: CallNext<'a>,
    ) -> ToolHostResult<Value> {
        if let Some(prefix) = crate::plugin_prefix(&request.name) {
            // A failed targeted refresh falls through to the tool that is
            // already registered; a stale tool beats an unrelated reload
            // failure.
            if let Err(e) = self.loader.refresh(&self.registry, Some(prefix)).await {
                warn!(
                    "Targeted refresh for '{}' failed ({}); using registered tool",
                    prefix, e
                );
            }
        }

        let started = Instant::now();
        let result = next.run(request).await;
        match &result {
            Ok(value) => info!(
                "Tool '{}' completed in {:.2?}: {}",
                request.name,
                started.elapsed(),
                result_preview(value)
            ),
            Err(e) => warn!(
                "Tool '{}' failed in {:.2?}: {}",
                request.name,
                started.elapsed(),
                e
            ),
        }
        result
    }
}

/// Ambient request logging, ahead of the refresh layer.
pub struct RequestLogLayer;

#[async_trait]
impl ToolMiddleware for RequestLogLayer {
    async fn on_list_tools(
        &self,
        next: ListNext<'_>,
    ) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
        debug!("Handling list_tools");
        let tools = next.run().await?;
        debug!("list_tools returning {} tools", tools.len());
        Ok(tools)
    }

    async fn on_call_tool<'a>(
        &self,
        request: &'a CallRequest,
        next: CallNext<'a>,
    ) -> ToolHostResult<Value> {
        debug!("Handling call_tool '{}'", request.name);
        next.run(request).await
    }
}

/// Short, single-line preview of a result value for logs.
pub fn result_preview(value: &Value) -> String {
    const MAX_PREVIEW: usize = 120;

    let rendered = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let flattened: String = rendered
        .chars()
        .map(|c| if c == '\n' { ' ' } else { c })
        .collect();

    if flattened.chars().count() <= MAX_PREVIEW {
        flattened
    } else {
        let truncated: String = flattened.chars().take(MAX_PREVIEW).collect();
        format!("{}... (truncated)", truncated)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::error::ToolHostError;
    use crate::plugins::envs::EnvironmentManager;
    use crate::plugins::workers::WorkerScripts;
    use crate::plugins::PluginDir;
    use crate::registry::value_handler;
    use std::path::{Path, PathBuf};
    use std::sync::Mutex;
    use std::time::Duration;

    fn descriptor(name: &str) -> ToolDescriptor {
        let (prefix, function) = name.split_once('-').unwrap_or(("", name));
        ToolDescriptor {
            name: name.to_string(),
            description: "test".to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            tags: Vec::new(),
            source_module: "tool.py".to_string(),
            function_name: function.to_string(),
            tool_name_prefix: prefix.to_string(),
        }
    }

    struct RecordingLayer {
        label: &'static str,
        events: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl ToolMiddleware for RecordingLayer {
        async fn on_list_tools(
            &self,
            next: ListNext<'_>,
        ) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
            self.events.lock().unwrap().push(format!("{}:before", self.label));
            let result = next.run().await;
            self.events.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    fn test_loader(root: &Path) -> Arc<DynamicLoader> {
        let config = ServerConfig {
            plugin_root: root.to_path_buf(),
            ..ServerConfig::default()
        };
        let scripts = WorkerScripts::materialize(root).unwrap();
        let envs = EnvironmentManager::with_base_interpreter(
            PathBuf::from("python3"),
            Duration::from_secs(600),
        );
        Arc::new(DynamicLoader::with_env_manager(&config, envs, scripts))
    }

    fn seeded_plugin(root: &Path, loader: &DynamicLoader, name: &str, tool: &str) {
        let dir = root.join(name);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("tool.py"), "def f():\n    pass\n").unwrap();
        let plugin = PluginDir::new(name, &dir);
        let bin = plugin.venv_dir().join(if cfg!(windows) { "Scripts" } else { "bin" });
        std::fs::create_dir_all(&bin).unwrap();
        std::fs::write(
            bin.join(if cfg!(windows) { "python.exe" } else { "python" }),
            "",
        )
        .unwrap();
        loader.seed_cache(&plugin, vec![descriptor(tool)]);
    }

    #[tokio::test]
    async fn test_middlewares_run_in_order_around_the_registry() {
        let registry = Arc::new(ToolRegistry::new());
        registry
            .add(
                descriptor("ping"),
                ToolKind::Builtin,
                value_handler(Value::Null),
            )
            .unwrap();

        let events = Arc::new(Mutex::new(Vec::new()));
        let pipeline = MiddlewarePipeline::new(Arc::clone(&registry))
            .with(Arc::new(RecordingLayer {
                label: "outer",
                events: Arc::clone(&events),
            }))
            .with(Arc::new(RecordingLayer {
                label: "inner",
                events: Arc::clone(&events),
            }));

        let tools = pipeline.list_tools().await.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(
            *events.lock().unwrap(),
            vec!["outer:before", "inner:before", "inner:after", "outer:after"]
        );
    }

    #[tokio::test]
    async fn test_refresh_layer_discovers_tools_before_list() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());
        seeded_plugin(root.path(), &loader, "calc", "calc-add");

        let registry = Arc::new(ToolRegistry::new());
        let pipeline = MiddlewarePipeline::new(Arc::clone(&registry)).with(Arc::new(
            DynamicRefreshLayer::new(Arc::clone(&loader), Arc::clone(&registry)),
        ));

        assert!(!registry.contains("calc-add").unwrap());
        let tools = pipeline.list_tools().await.unwrap();
        assert!(tools.iter().any(|(d, _)| d.name == "calc-add"));
        assert!(registry.contains("calc-add").unwrap());
    }

    #[tokio::test]
    async fn test_unqualified_call_skips_refresh_and_dispatches() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());

        let registry = Arc::new(ToolRegistry::new());
        registry
            .add(
                descriptor("ping"),
                ToolKind::Builtin,
                value_handler(serde_json::json!("pong")),
            )
            .unwrap();

        let pipeline = MiddlewarePipeline::new(Arc::clone(&registry)).with(Arc::new(
            DynamicRefreshLayer::new(Arc::clone(&loader), Arc::clone(&registry)),
        ));

        let result = pipeline
            .call_tool(CallRequest {
                name: "ping".to_string(),
                arguments: serde_json::Map::new(),
            })
            .await
            .unwrap();
        assert_eq!(result, serde_json::json!("pong"));
    }

    #[tokio::test]
    async fn test_call_for_unknown_qualified_tool_reports_not_found() {
        let root = tempfile::tempdir().unwrap();
        let loader = test_loader(root.path());

        let registry = Arc::new(ToolRegistry::new());
        let pipeline = MiddlewarePipeline::new(Arc::clone(&registry)).with(Arc::new(
            DynamicRefreshLayer::new(Arc::clone(&loader), Arc::clone(&registry)),
        ));

        // The targeted refresh finds no such plugin; dispatch then fails
        // with a registry miss rather than a refresh error.
        let err = pipeline
            .call_tool(CallRequest {
                name: "ghost-run".to_string(),
                arguments: serde_json::Map::new(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ToolHostError::ToolNotFound { .. }));
    }

    #[test]
    fn test_result_preview_truncates_long_values() {
        let short = result_preview(&serde_json::json!({"ok": true}));
        assert_eq!(short, "{\"ok\":true}");

        let long = result_preview(&Value::String("x".repeat(500)));
        assert!(long.ends_with("... (truncated)"));
        assert!(long.chars().count() < 500);

        let multiline = result_preview(&Value::String("a\nb\nc".to_string()));
        assert_eq!(multiline, "a b c");
    }
}
