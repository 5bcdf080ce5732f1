//! Environment inspection, diagnosis, and repair tools.

use rmcp::schemars;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use super::{builtin_descriptor, parse_params, to_json};
use crate::error::ToolHostResult;
use crate::plugins::loader::DynamicLoader;
use crate::plugins::plugin_directories;
use crate::registry::{ToolKind, ToolRegistry};

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct GetToolEnvInfoParams {
    #[schemars(description = "Plugin name; omit to report every plugin")]
    pub name: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct DiagnoseToolEnvParams {
    #[schemars(description = "Plugin name")]
    pub name: String,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct RepairToolEnvParams {
    #[schemars(description = "Plugin name")]
    pub name: String,

    #[schemars(description = "Destroy and recreate the environment first")]
    #[serde(default)]
    pub force: bool,
}

pub async fn get_tool_env_info(
    loader: &DynamicLoader,
    params: GetToolEnvInfoParams,
) -> ToolHostResult<serde_json::Value> {
    match params.name {
        Some(name) => {
            let plugin = loader.plugin_dir(&name)?;
            to_json(&loader.envs().describe(&plugin).await)
        }
        None => {
            let mut reports = Vec::new();
            for plugin in plugin_directories(loader.plugin_root())? {
                reports.push(loader.envs().describe(&plugin).await);
            }
            to_json(&reports)
        }
    }
}

pub async fn diagnose_tool_env(
    loader: &DynamicLoader,
    params: DiagnoseToolEnvParams,
) -> ToolHostResult<serde_json::Value> {
    let plugin = loader.plugin_dir(&params.name)?;
    to_json(&loader.envs().diagnose(&plugin).await)
}

pub async fn repair_tool_env(
    loader: &DynamicLoader,
    params: RepairToolEnvParams,
) -> ToolHostResult<serde_json::Value> {
    let plugin = loader.plugin_dir(&params.name)?;
    let report = loader.envs().repair(&plugin, params.force).await?;
    loader.invalidate_cache(&params.name)?;
    to_json(&report)
}

pub fn register(
    registry: &Arc<ToolRegistry>,
    loader: &Arc<DynamicLoader>,
) -> ToolHostResult<()> {
    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<GetToolEnvInfoParams>(
            "get_tool_env_info",
            "Report a plugin environment's structure: files, interpreter, installed packages",
        ),
        ToolKind::Builtin,
        Arc::new(move |args| {
            let l = Arc::clone(&l);
            Box::pin(async move {
                let params = parse_params::<GetToolEnvInfoParams>(args)?;
                get_tool_env_info(&l, params).await
            })
        }),
    )?;

    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<DiagnoseToolEnvParams>(
            "diagnose_tool_env",
            "Classify environment issues for a plugin and recommend fixes",
        ),
        ToolKind::Builtin,
        Arc::new(move |args| {
            let l = Arc::clone(&l);
            Box::pin(async move {
                let params = parse_params::<DiagnoseToolEnvParams>(args)?;
                diagnose_tool_env(&l, params).await
            })
        }),
    )?;

    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<RepairToolEnvParams>(
            "repair_tool_env",
            "Recreate a plugin environment and reinstall its requirements",
        ),
        ToolKind::Builtin,
        Arc::new(move |args| {
            let l = Arc::clone(&l);
            Box::pin(async move {
                let params = parse_params::<RepairToolEnvParams>(args)?;
                repair_tool_env(&l, params).await
            })
        }),
    )?;

    Ok(())
}
