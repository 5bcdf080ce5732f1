// Toolhost - a dynamic MCP tool server
// Discovers user plugins on disk, isolates each in its own Python
// environment, and brokers tool calls through one-shot worker processes.

pub mod config;
pub mod error;
pub mod logging;
pub mod middleware;
pub mod plugins;
pub mod registry;
pub mod server;
pub mod tools;

use once_cell::sync::Lazy;
use regex::Regex;

/// Regex for valid plugin directory names. Leading underscores are
/// reserved for managed directories (worker scripts, interpreter caches).
static PLUGIN_NAME_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z][A-Za-z0-9_]*$").expect("plugin name regex is valid")
});

/// Directory names that are never treated as plugins even when they
/// match the name pattern.
pub const RESERVED_DIR_NAMES: &[&str] = &["__pycache__", "venv"];

/// Check whether a directory name is usable as a plugin name.
pub fn is_valid_plugin_name(name: &str) -> bool {
    PLUGIN_NAME_REGEX.is_match(name) && !RESERVED_DIR_NAMES.contains(&name)
}

/// Separator between the plugin prefix and the function name in a
/// qualified tool name.
pub const QUALIFIED_NAME_SEPARATOR: char = '-';

/// Split a qualified tool name into its plugin prefix, if it has one.
/// Non-qualified names (builtins, mirrored tools) return None.
pub fn plugin_prefix(tool_name: &str) -> Option<&str> {
    tool_name
        .split_once(QUALIFIED_NAME_SEPARATOR)
        .map(|(prefix, _)| prefix)
}

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
