//! Out-of-process plugin introspection.
//!
//! The server never loads plugin code into its own address space. A
//! one-shot worker runs inside the plugin's environment and prints one JSON
//! line: `{"tools": [...]}` on success or `{"error": ..., "traceback": ...}`
//! on failure. Anything else (non-zero exit, unparseable stdout) is a
//! plugin-level load error, never an invocation error.

use serde::Deserialize;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

use super::{PluginDir, ToolDescriptor};
use crate::error::{ToolHostError, ToolHostResult};

#[derive(Debug, Deserialize)]
struct IntrospectionOutput {
    #[serde(default)]
    tools: Option<Vec<ToolDescriptor>>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

/// Launch the introspection worker for one plugin and parse its output.
pub async fn introspect_plugin(
    interpreter: &Path,
    loader_script: &Path,
    plugin: &PluginDir,
    timeout: Duration,
) -> ToolHostResult<Vec<ToolDescriptor>> {
    debug!(
        "Introspecting {} with {}",
        plugin.name,
        interpreter.display()
    );

    let mut child = Command::new(interpreter)
        .arg(loader_script)
        .arg(plugin.tool_file())
        .arg(&plugin.name)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| ToolHostError::plugin_load(&plugin.name, e.to_string()))?;

    let output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(result) => result.map_err(|e| ToolHostError::plugin_load(&plugin.name, e.to_string()))?,
        Err(_) => {
            return Err(ToolHostError::plugin_load(
                &plugin.name,
                format!("Introspection timed out after {}s", timeout.as_secs()),
            ));
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    if !stderr.trim().is_empty() {
        warn!("[{}] introspection stderr: {}", plugin.name, stderr.trim());
    }

    if !output.status.success() {
        return Err(ToolHostError::plugin_load(
            &plugin.name,
            format!(
                "Introspection worker exited with {:?}: {}",
                output.status.code(),
                stderr.trim()
            ),
        ));
    }

    parse_introspection_output(&plugin.name, &stdout)
}

/// Parse the worker's single-line JSON contract.
pub fn parse_introspection_output(
    plugin_name: &str,
    stdout: &str,
) -> ToolHostResult<Vec<ToolDescriptor>> {
    let output: IntrospectionOutput = serde_json::from_str(stdout.trim()).map_err(|e| {
        ToolHostError::plugin_load(
            plugin_name,
            format!("Unparseable introspection output: {} (raw: {})", e, stdout.trim()),
        )
    })?;

    if let Some(error) = output.error {
        let message = match output.traceback {
            Some(traceback) => format!("{}\n{}", error, traceback),
            None => error,
        };
        return Err(ToolHostError::plugin_load(plugin_name, message));
    }

    output
        .tools
        .ok_or_else(|| ToolHostError::plugin_load(plugin_name, "Worker emitted neither tools nor error"))
}
