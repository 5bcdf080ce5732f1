use rmcp::model::ErrorCode;
use rmcp::Error as McpError;
use serde_json::json;
use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the toolhost server
#[derive(Error, Debug)]
pub enum ToolHostError {
    #[error("IO error: {source}")]
    Io {
        source: std::io::Error,
        path: Option<PathBuf>,
    },

    #[error("Failed to load plugin '{plugin}': {message}")]
    PluginLoad { plugin: String, message: String },

    #[error("Failed to create environment for plugin '{plugin}': {message}")]
    EnvCreation { plugin: String, message: String },

    #[error("Tool '{tool}' execution failed: {error}")]
    Execution {
        tool: String,
        error: String,
        traceback: Option<String>,
    },

    #[error("Tool '{tool}' execution timeout (>{seconds}s)")]
    ExecutionTimeout { tool: String, seconds: u64 },

    #[error("Invalid plugin name: {name}")]
    InvalidPluginName { name: String },

    #[error("Plugin directory not found: {name}")]
    PluginNotFound { name: String },

    #[error("Tool not registered: {name}")]
    ToolNotFound { name: String },

    #[error("Interpreter not available: {path}")]
    InterpreterMissing { path: PathBuf },

    #[error("Unparseable worker output: {message}")]
    WorkerOutput { message: String },

    #[error("Failed to acquire lock: {message}")]
    LockError { message: String },

    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    #[error("{0}")]
    Other(String),
}

impl ToolHostError {
    /// Create a new IO error with path context
    pub fn io_error(err: std::io::Error, path: Option<impl Into<PathBuf>>) -> Self {
        Self::Io {
            source: err,
            path: path.map(|p| p.into()),
        }
    }

    /// Create a new plugin load error
    pub fn plugin_load(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::PluginLoad {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a new environment creation error
    pub fn env_creation(plugin: impl Into<String>, message: impl Into<String>) -> Self {
        Self::EnvCreation {
            plugin: plugin.into(),
            message: message.into(),
        }
    }

    /// Create a new execution error
    pub fn execution(
        tool: impl Into<String>,
        error: impl Into<String>,
        traceback: Option<String>,
    ) -> Self {
        Self::Execution {
            tool: tool.into(),
            error: error.into(),
            traceback,
        }
    }

    /// Create a new lock error
    pub fn lock_error(message: impl Into<String>) -> Self {
        Self::LockError {
            message: message.into(),
        }
    }

    /// Create a new invalid argument error
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Create a new unparseable worker output error
    pub fn worker_output(message: impl Into<String>) -> Self {
        Self::WorkerOutput {
            message: message.into(),
        }
    }

    /// Create a new generic error
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other(message.into())
    }

    /// Convert to MCP error for tool responses
    pub fn to_mcp_error(&self) -> McpError {
        match self {
            ToolHostError::Io { source, path } => {
                let message = if let Some(path) = path {
                    format!("IO error: {} (path: {})", source, path.display())
                } else {
                    format!("IO error: {}", source)
                };

                McpError::new(
                    ErrorCode::INTERNAL_ERROR,
                    message,
                    Some(json!({
                        "error_type": "io_error",
                        "path": path.clone().map(|p| p.to_string_lossy().to_string()),
                        "details": source.to_string()
                    })),
                )
            }
            ToolHostError::PluginLoad { plugin, message } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Failed to load plugin '{}': {}", plugin, message),
                Some(json!({
                    "error_type": "plugin_load_error",
                    "plugin": plugin,
                    "details": message
                })),
            ),
            ToolHostError::EnvCreation { plugin, message } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Failed to create environment for '{}': {}", plugin, message),
                Some(json!({
                    "error_type": "env_creation_error",
                    "plugin": plugin,
                    "details": message
                })),
            ),
            ToolHostError::Execution {
                tool,
                error,
                traceback,
            } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Tool '{}' execution failed: {}", tool, error),
                Some(json!({
                    "error_type": "execution_error",
                    "tool": tool,
                    "details": error,
                    "traceback": traceback
                })),
            ),
            ToolHostError::ExecutionTimeout { tool, seconds } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Tool '{}' execution timeout (>{}s)", tool, seconds),
                Some(json!({
                    "error_type": "execution_timeout",
                    "tool": tool,
                    "timeout_seconds": seconds
                })),
            ),
            ToolHostError::InvalidPluginName { name } => McpError::new(
                ErrorCode::INVALID_PARAMS,
                format!("Invalid plugin name: {}", name),
                Some(json!({
                    "error_type": "invalid_plugin_name",
                    "name": name,
                    "details": "Plugin names must match ^[A-Za-z][A-Za-z0-9_]*$"
                })),
            ),
            ToolHostError::PluginNotFound { name } => McpError::new(
                ErrorCode::INVALID_PARAMS,
                format!("Plugin directory not found: {}", name),
                Some(json!({
                    "error_type": "plugin_not_found",
                    "name": name
                })),
            ),
            ToolHostError::ToolNotFound { name } => McpError::new(
                ErrorCode::INVALID_PARAMS,
                format!("Tool not registered: {}", name),
                Some(json!({
                    "error_type": "tool_not_found",
                    "name": name
                })),
            ),
            ToolHostError::InterpreterMissing { path } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Interpreter not available: {}", path.display()),
                Some(json!({
                    "error_type": "interpreter_missing",
                    "path": path.to_string_lossy()
                })),
            ),
            ToolHostError::WorkerOutput { message } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Unparseable worker output: {}", message),
                Some(json!({
                    "error_type": "worker_output_error",
                    "details": message
                })),
            ),
            ToolHostError::LockError { message } => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                format!("Failed to acquire lock: {}", message),
                Some(json!({
                    "error_type": "lock_error",
                    "details": message
                })),
            ),
            ToolHostError::InvalidArgument { message } => McpError::new(
                ErrorCode::INVALID_PARAMS,
                format!("Invalid argument: {}", message),
                Some(json!({
                    "error_type": "invalid_argument",
                    "details": message
                })),
            ),
            ToolHostError::Other(message) => McpError::new(
                ErrorCode::INTERNAL_ERROR,
                message.clone(),
                Some(json!({
                    "error_type": "other_error",
                    "details": message
                })),
            ),
        }
    }
}

impl From<std::io::Error> for ToolHostError {
    fn from(error: std::io::Error) -> Self {
        ToolHostError::io_error(error, None::<PathBuf>)
    }
}

impl From<serde_json::Error> for ToolHostError {
    fn from(error: serde_json::Error) -> Self {
        ToolHostError::worker_output(error.to_string())
    }
}

impl From<toml::de::Error> for ToolHostError {
    fn from(error: toml::de::Error) -> Self {
        ToolHostError::other(format!("Config parse error: {}", error))
    }
}

/// Result type alias using ToolHostError
pub type ToolHostResult<T> = Result<T, ToolHostError>;

/// Contextual error mapping function for IO operations
pub fn map_io_err<P: Into<PathBuf>>(path: P) -> impl FnOnce(std::io::Error) -> ToolHostError {
    let path = path.into();
    move |err| ToolHostError::io_error(err, Some(path))
}
