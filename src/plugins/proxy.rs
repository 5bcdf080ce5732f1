//! In-process tool proxies.
//!
//! A proxy is an immutable handle binding a descriptor to its plugin
//! directory, sandboxed interpreter, and function name. Invoking it spawns
//! a one-shot execution worker, marshals arguments in and the result out
//! across the process boundary, and enforces the execution time bound.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::debug;

use super::{ToolDescriptor, TOOL_FILE};
use crate::error::{ToolHostError, ToolHostResult};

#[derive(Debug, Serialize)]
struct WorkerParams<'a> {
    module_path: &'a str,
    function_name: &'a str,
    args: &'a [Value],
    kwargs: &'a serde_json::Map<String, Value>,
}

#[derive(Debug, Deserialize)]
struct WorkerOutput {
    success: bool,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    traceback: Option<String>,
}

/// Callable handle for one discovered tool. Freely replaceable when the
/// loader reconciles the registry.
#[derive(Debug, Clone)]
pub struct ToolProxy {
    descriptor: ToolDescriptor,
    plugin_dir: PathBuf,
    interpreter: PathBuf,
    executor_script: PathBuf,
    timeout: Duration,
}

impl ToolProxy {
    pub fn new(
        descriptor: ToolDescriptor,
        plugin_dir: &Path,
        interpreter: &Path,
        executor_script: &Path,
        timeout: Duration,
    ) -> ToolHostResult<Self> {
        let plugin_dir = plugin_dir
            .canonicalize()
            .map_err(|e| ToolHostError::io_error(e, Some(plugin_dir)))?;

        Ok(Self {
            descriptor,
            plugin_dir,
            interpreter: interpreter.to_path_buf(),
            executor_script: executor_script.to_path_buf(),
            timeout,
        })
    }

    pub fn descriptor(&self) -> &ToolDescriptor {
        &self.descriptor
    }

    pub fn tool_name(&self) -> &str {
        &self.descriptor.name
    }

    pub fn plugin_dir(&self) -> &Path {
        &self.plugin_dir
    }

    pub fn interpreter(&self) -> &Path {
        &self.interpreter
    }

    /// Invoke the bound function with positional and keyword arguments.
    pub async fn invoke(
        &self,
        args: Vec<Value>,
        kwargs: serde_json::Map<String, Value>,
    ) -> ToolHostResult<Value> {
        if !self.executor_script.exists() {
            return Err(ToolHostError::execution(
                self.tool_name(),
                format!(
                    "Tool execution script not found: {}",
                    self.executor_script.display()
                ),
                None,
            ));
        }

        let params = WorkerParams {
            // Relative to the worker's working directory, the plugin dir.
            module_path: TOOL_FILE,
            function_name: &self.descriptor.function_name,
            args: &args,
            kwargs: &kwargs,
        };
        let params_json = serde_json::to_string(&params)?;

        debug!(
            "Executing {} in {}",
            self.tool_name(),
            self.plugin_dir.display()
        );

        let child = Command::new(&self.interpreter)
            .arg(&self.executor_script)
            .arg(&params_json)
            .current_dir(&self.plugin_dir)
            .env("PYTHONPATH", &self.plugin_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ToolHostError::execution(self.tool_name(), e.to_string(), None)
            })?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result.map_err(|e| {
                ToolHostError::execution(self.tool_name(), e.to_string(), None)
            })?,
            // kill_on_drop reaps the worker when the future is dropped here.
            Err(_) => {
                return Err(ToolHostError::ExecutionTimeout {
                    tool: self.tool_name().to_string(),
                    seconds: self.timeout.as_secs(),
                });
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            debug!("[{}] worker stderr: {}", self.tool_name(), stderr.trim());
        }

        parse_execution_output(self.tool_name(), &stdout)
    }
}

/// Interpret the execution worker's stdout.
///
/// Valid JSON follows the `{"success": ...}` contract. Anything else is
/// passed through raw, so plugins that print diagnostics instead of
/// returning values remain observable.
pub fn parse_execution_output(tool_name: &str, stdout: &str) -> ToolHostResult<Value> {
    match serde_json::from_str::<WorkerOutput>(stdout.trim()) {
        Ok(output) => {
            if output.success {
                Ok(output.result.unwrap_or(Value::Null))
            } else {
                Err(ToolHostError::execution(
                    tool_name,
                    output.error.unwrap_or_else(|| "unknown error".to_string()),
                    output.traceback,
                ))
            }
        }
        Err(_) => Ok(Value::String(stdout.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_success_output() {
        let value =
            parse_execution_output("calc-add", r#"{"success": true, "result": 5}"#).unwrap();
        assert_eq!(value, serde_json::json!(5));
    }

    #[test]
    fn test_parse_null_result() {
        let value = parse_execution_output("calc-noop", r#"{"success": true}"#).unwrap();
        assert_eq!(value, Value::Null);
    }

    #[test]
    fn test_parse_failure_output() {
        let stdout = r#"{"success": false, "error": "division by zero", "traceback": "Traceback ..."}"#;
        let err = parse_execution_output("calc-div", stdout).unwrap_err();
        match err {
            ToolHostError::Execution {
                tool,
                error,
                traceback,
            } => {
                assert_eq!(tool, "calc-div");
                assert_eq!(error, "division by zero");
                assert!(traceback.unwrap().starts_with("Traceback"));
            }
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn test_parse_raw_output_passthrough() {
        let value = parse_execution_output("calc-debug", "printed diagnostics\n").unwrap();
        assert_eq!(value, Value::String("printed diagnostics\n".to_string()));
    }

    #[test]
    fn test_parse_raw_output_from_crashed_worker_still_passes_through() {
        // The contract never inspects the exit status: unparseable stdout
        // is returned raw regardless of how the worker died.
        let value = parse_execution_output("calc-crash", "segfault notice").unwrap();
        assert_eq!(value, Value::String("segfault notice".to_string()));
    }

    #[test]
    fn test_proxy_binds_absolute_plugin_dir() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("calc");
        std::fs::create_dir(&dir).unwrap();

        let descriptor = ToolDescriptor {
            name: "calc-add".to_string(),
            description: "Add".to_string(),
            input_schema: serde_json::json!({"type": "object", "properties": {}}),
            tags: Vec::new(),
            source_module: "tool.py".to_string(),
            function_name: "add".to_string(),
            tool_name_prefix: "calc".to_string(),
        };

        let proxy = ToolProxy::new(
            descriptor,
            &dir,
            Path::new("/usr/bin/python3"),
            Path::new("/srv/_workers/tool_executor.py"),
            Duration::from_secs(60),
        )
        .unwrap();

        assert!(proxy.plugin_dir().is_absolute());
        assert_eq!(proxy.tool_name(), "calc-add");
    }
}
