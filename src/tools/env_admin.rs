//! Plugin creation and update tools.

use rmcp::schemars;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

use super::{builtin_descriptor, parse_params, to_json};
use crate::error::{map_io_err, ToolHostError, ToolHostResult};
use crate::plugins::envs::InstallReport;
use crate::plugins::loader::DynamicLoader;
use crate::plugins::{PluginDir, REQUIREMENTS_FILE, TOOL_FILE};
use crate::registry::{ToolKind, ToolRegistry};

const DEFAULT_TOOL_CODE: &str = r#"def example(message: str = "hello"):
    """Example tool function. Replace with your own."""
    return message
"#;

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct CreateToolEnvParams {
    #[schemars(description = "Plugin name; must match ^[A-Za-z][A-Za-z0-9_]*$")]
    pub name: String,

    #[schemars(description = "Dependency lines for requirements.txt")]
    #[serde(default)]
    pub requirements: Vec<String>,

    #[schemars(description = "Initial tool.py content; a template is used when omitted")]
    pub initial_code: Option<String>,
}

#[derive(Debug, Deserialize, Serialize, schemars::JsonSchema)]
pub struct UpdateToolEnvParams {
    #[schemars(description = "Plugin name")]
    pub name: String,

    #[schemars(description = "Replacement dependency lines for requirements.txt")]
    pub requirements: Option<Vec<String>>,

    #[schemars(description = "Replacement tool.py content")]
    pub code: Option<String>,

    #[schemars(description = "Uninstall user packages before reinstalling")]
    #[serde(default)]
    pub force_reinstall: bool,
}

#[derive(Debug, Serialize)]
pub struct CreateToolEnvReport {
    pub plugin: String,
    pub path: String,
    pub tool_file: String,
    pub requirements_file: String,
    pub venv_path: String,
    pub install: InstallReport,
}

#[derive(Debug, Serialize)]
pub struct UpdateToolEnvReport {
    pub plugin: String,
    pub changes: Vec<String>,
    pub install: InstallReport,
}

/// Create a plugin directory, seed its files, and provision its
/// environment. Fails when the name is invalid or the directory exists.
pub async fn create_tool_env(
    loader: &DynamicLoader,
    params: CreateToolEnvParams,
) -> ToolHostResult<CreateToolEnvReport> {
    if !crate::is_valid_plugin_name(&params.name) {
        return Err(ToolHostError::InvalidPluginName { name: params.name });
    }

    let path = loader.plugin_root().join(&params.name);
    if path.exists() {
        return Err(ToolHostError::invalid_argument(format!(
            "Plugin directory already exists: {}",
            path.display()
        )));
    }

    std::fs::create_dir_all(&path).map_err(map_io_err(&path))?;
    let plugin = PluginDir::new(&params.name, &path);

    let requirements_body = if params.requirements.is_empty() {
        String::new()
    } else {
        format!("{}\n", params.requirements.join("\n"))
    };
    std::fs::write(plugin.requirements_file(), requirements_body)
        .map_err(map_io_err(plugin.requirements_file()))?;

    let code = params.initial_code.as_deref().unwrap_or(DEFAULT_TOOL_CODE);
    std::fs::write(plugin.tool_file(), code).map_err(map_io_err(plugin.tool_file()))?;

    let venv_path = loader.envs().ensure(&plugin).await?;
    let install = loader.envs().install_requirements(&plugin).await?;

    info!("Created plugin '{}' at {}", params.name, path.display());
    Ok(CreateToolEnvReport {
        plugin: params.name,
        path: path.to_string_lossy().to_string(),
        tool_file: plugin.tool_file().to_string_lossy().to_string(),
        requirements_file: plugin.requirements_file().to_string_lossy().to_string(),
        venv_path: venv_path.to_string_lossy().to_string(),
        install,
    })
}

/// Update a plugin's manifest and code, optionally purging user packages
/// first, then reinstall. The plugin's cache entry is invalidated so the
/// next refresh re-introspects.
pub async fn update_tool_env(
    loader: &DynamicLoader,
    params: UpdateToolEnvParams,
) -> ToolHostResult<UpdateToolEnvReport> {
    let plugin = loader.plugin_dir(&params.name)?;
    let mut changes = Vec::new();

    if let Some(code) = &params.code {
        std::fs::write(plugin.tool_file(), code).map_err(map_io_err(plugin.tool_file()))?;
        changes.push(format!("Updated {}", TOOL_FILE));
    }

    if let Some(requirements) = &params.requirements {
        let body = if requirements.is_empty() {
            String::new()
        } else {
            format!("{}\n", requirements.join("\n"))
        };
        std::fs::write(plugin.requirements_file(), body)
            .map_err(map_io_err(plugin.requirements_file()))?;
        changes.push(format!("Updated {}", REQUIREMENTS_FILE));
    }

    loader.envs().ensure(&plugin).await?;

    if params.force_reinstall {
        let removed = loader.envs().uninstall_user_packages(&plugin).await?;
        changes.push(format!("Uninstalled {} user packages", removed.len()));
    }

    let install = loader.envs().install_requirements(&plugin).await?;
    changes.push(install.message.clone());

    loader.invalidate_cache(&params.name)?;
    changes.push("Invalidated metadata cache".to_string());

    Ok(UpdateToolEnvReport {
        plugin: params.name,
        changes,
        install,
    })
}

pub fn register(
    registry: &Arc<ToolRegistry>,
    loader: &Arc<DynamicLoader>,
) -> ToolHostResult<()> {
    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<CreateToolEnvParams>(
            "create_tool_env",
            "Create a new plugin directory with tool.py, requirements.txt, and an isolated environment",
        ),
        ToolKind::Builtin,
        Arc::new(move |args| {
            let l = Arc::clone(&l);
            Box::pin(async move {
                let params = parse_params::<CreateToolEnvParams>(args)?;
                let report = create_tool_env(&l, params).await?;
                to_json(&report)
            })
        }),
    )?;

    let l = Arc::clone(loader);
    registry.add(
        builtin_descriptor::<UpdateToolEnvParams>(
            "update_tool_env",
            "Update a plugin's code or requirements and reinstall its dependencies",
        ),
        ToolKind::Builtin,
        Arc::new(move |args| {
            let l = Arc::clone(&l);
            Box::pin(async move {
                let params = parse_params::<UpdateToolEnvParams>(args)?;
                let report = update_tool_env(&l, params).await?;
                to_json(&report)
            })
        }),
    )?;

    Ok(())
}
