//! In-process tool registry.
//!
//! The outward RPC transport sees only this surface: `add`, `remove`,
//! `list`, `call`. Dynamic tools are mutated exclusively by the loader
//! under the refresh mutex; readers always get snapshots, never views of
//! in-place mutation.

use futures::future::BoxFuture;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::warn;

use crate::error::{ToolHostError, ToolHostResult};
use crate::plugins::changes::Snapshot;
use crate::plugins::ToolDescriptor;

/// A single boxed async callable bound to its invocation parameters.
pub type ToolHandler = Arc<
    dyn Fn(serde_json::Map<String, Value>) -> BoxFuture<'static, ToolHostResult<Value>>
        + Send
        + Sync,
>;

/// Where a registered tool came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ToolKind {
    /// Administrative tools provided by the server itself.
    Builtin,
    /// Tools discovered from plugin directories; names are qualified.
    Dynamic,
    /// Opaque handles imported from remote servers at startup.
    Mirrored,
}

#[derive(Clone)]
pub struct RegisteredTool {
    pub descriptor: ToolDescriptor,
    pub kind: ToolKind,
    pub handler: ToolHandler,
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: RwLock<HashMap<String, RegisteredTool>>,
}

impl std::fmt::Debug for RegisteredTool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredTool")
            .field("name", &self.descriptor.name)
            .field("kind", &self.kind)
            .finish()
    }
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under its descriptor name, replacing any previous
    /// registration. Mirrored tools must not carry qualified names; local
    /// plugins own the qualified namespace.
    pub fn add(
        &self,
        descriptor: ToolDescriptor,
        kind: ToolKind,
        handler: ToolHandler,
    ) -> ToolHostResult<()> {
        if kind == ToolKind::Mirrored && crate::plugin_prefix(&descriptor.name).is_some() {
            warn!(
                "Rejecting mirrored tool '{}': qualified names are reserved for local plugins",
                descriptor.name
            );
            return Err(ToolHostError::invalid_argument(format!(
                "Mirrored tool name '{}' collides with the qualified namespace",
                descriptor.name
            )));
        }

        let mut tools = self.write_lock()?;
        tools.insert(
            descriptor.name.clone(),
            RegisteredTool {
                descriptor,
                kind,
                handler,
            },
        );
        Ok(())
    }

    /// Remove a tool by name. Returns whether it was registered.
    pub fn remove(&self, name: &str) -> ToolHostResult<bool> {
        Ok(self.write_lock()?.remove(name).is_some())
    }

    pub fn contains(&self, name: &str) -> ToolHostResult<bool> {
        Ok(self.read_lock()?.contains_key(name))
    }

    /// Snapshot of every registered tool, sorted by name.
    pub fn list(&self) -> ToolHostResult<Vec<(ToolDescriptor, ToolKind)>> {
        let tools = self.read_lock()?;
        let mut entries: Vec<(ToolDescriptor, ToolKind)> = tools
            .values()
            .map(|tool| (tool.descriptor.clone(), tool.kind))
            .collect();
        entries.sort_by(|a, b| a.0.name.cmp(&b.0.name));
        Ok(entries)
    }

    /// Snapshot of the dynamic (qualified) tools for the change tracker.
    pub fn snapshot(&self) -> ToolHostResult<Snapshot> {
        let tools = self.read_lock()?;
        Ok(tools
            .values()
            .filter(|tool| tool.kind == ToolKind::Dynamic)
            .map(|tool| (tool.descriptor.name.clone(), tool.descriptor.clone()))
            .collect())
    }

    /// Names of the registered dynamic tools.
    pub fn dynamic_names(&self) -> ToolHostResult<Vec<String>> {
        let tools = self.read_lock()?;
        Ok(tools
            .values()
            .filter(|tool| tool.kind == ToolKind::Dynamic)
            .map(|tool| tool.descriptor.name.clone())
            .collect())
    }

    /// Dispatch a call to the named tool's handler.
    pub async fn call(
        &self,
        name: &str,
        args: serde_json::Map<String, Value>,
    ) -> ToolHostResult<Value> {
        let handler = {
            let tools = self.read_lock()?;
            match tools.get(name) {
                Some(tool) => Arc::clone(&tool.handler),
                None => {
                    return Err(ToolHostError::ToolNotFound {
                        name: name.to_string(),
                    })
                }
            }
        };
        handler(args).await
    }

    fn read_lock(
        &self,
    ) -> ToolHostResult<std::sync::RwLockReadGuard<'_, HashMap<String, RegisteredTool>>> {
        self.tools
            .read()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))
    }

    fn write_lock(
        &self,
    ) -> ToolHostResult<std::sync::RwLockWriteGuard<'_, HashMap<String, RegisteredTool>>> {
        self.tools
            .write()
            .map_err(|e| ToolHostError::lock_error(e.to_string()))
    }
}

/// Handler returning a fixed JSON value; useful for builtins backed by
/// synchronous state and for tests.
pub fn value_handler(value: Value) -> ToolHandler {
    Arc::new(move |_args| {
        let value = value.clone();
        Box::pin(async move { Ok(value) })
    })
}
