//! Registry introspection tools: categorized listing, change history, and
//! on-demand refresh.

use rmcp::schemars;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;

use super::{builtin_descriptor, to_json};
use crate::error::ToolHostResult;
use crate::plugins::loader::DynamicLoader;
use crate::plugins::plugin_directories;
use crate::registry::{ToolKind, ToolRegistry};

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ListCurrentFunctionsParams {}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct GetToolChangesParams {}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct RefreshToolsParams {}

/// Categorized snapshot of the registry plus per-plugin environment info.
pub async fn list_current_functions(
    registry: &ToolRegistry,
    loader: &DynamicLoader,
) -> ToolHostResult<serde_json::Value> {
    let mut builtin = Vec::new();
    let mut dynamic = Vec::new();
    let mut mirrored = Vec::new();

    for (descriptor, kind) in registry.list()? {
        let entry = json!({
            "name": descriptor.name,
            "description": descriptor.description,
            "tags": descriptor.tags,
        });
        match kind {
            ToolKind::Builtin => builtin.push(entry),
            ToolKind::Dynamic => dynamic.push(entry),
            ToolKind::Mirrored => mirrored.push(entry),
        }
    }

    let mut environments = Vec::new();
    for plugin in plugin_directories(loader.plugin_root())? {
        environments.push(loader.envs().describe(&plugin).await);
    }

    Ok(json!({
        "total": builtin.len() + dynamic.len() + mirrored.len(),
        "builtin": builtin,
        "dynamic": dynamic,
        "mirrored": mirrored,
        "environments": environments,
    }))
}

pub fn register(
    registry: &Arc<ToolRegistry>,
    loader: &Arc<DynamicLoader>,
) -> ToolHostResult<()> {
    let r = Arc::clone(registry);
    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<ListCurrentFunctionsParams>(
            "list_current_functions",
            "Categorized snapshot of registered tools plus per-plugin environment info",
        ),
        ToolKind::Builtin,
        Arc::new(move |_args| {
            let r = Arc::clone(&r);
            let l = Arc::clone(&l);
            Box::pin(async move { list_current_functions(&r, &l).await })
        }),
    )?;

    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<GetToolChangesParams>(
            "get_tool_changes",
            "Summary of recent registry changes: counts, latest diffs, snapshot key sets",
        ),
        ToolKind::Builtin,
        Arc::new(move |_args| {
            let l = Arc::clone(&l);
            Box::pin(async move { to_json(&l.change_summary()?) })
        }),
    )?;

    let r = Arc::clone(registry);
    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<RefreshToolsParams>(
            "refresh_tools",
            "Full plugin scan and registry reconcile; returns the resulting change summary",
        ),
        ToolKind::Builtin,
        Arc::new(move |_args| {
            let r = Arc::clone(&r);
            let l = Arc::clone(&l);
            Box::pin(async move {
                let (changes, errors) = l.refresh(&r, None).await?;
                Ok(json!({
                    "changes": changes,
                    "errors": errors,
                    "cache": l.cache_stats()?,
                }))
            })
        }),
    )?;

    Ok(())
}
