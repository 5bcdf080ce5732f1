//! Isolated plugin lifecycle engine.
//!
//! A plugin is a subdirectory of the plugin root carrying a `tool.py` entry
//! module, an optional `requirements.txt` manifest, and a managed `venv/`.
//! The modules below provision environments, introspect plugins through
//! one-shot worker processes, cache the results against file mtimes, and
//! reconcile the discovered tools into the server registry.

pub mod cache;
pub mod changes;
pub mod envs;
pub mod introspect;
pub mod loader;
pub mod proxy;
pub mod workers;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::error::{map_io_err, ToolHostResult};

/// Entry module file name inside a plugin directory.
pub const TOOL_FILE: &str = "tool.py";

/// Dependency manifest file name inside a plugin directory.
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// Managed environment directory name inside a plugin directory.
pub const VENV_DIR: &str = "venv";

/// Serializable metadata for one callable tool, as emitted by the
/// introspection worker. The plugin's source file is authoritative; these
/// are derived values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDescriptor {
    /// Qualified name: `<plugin>-<function>`.
    pub name: String,
    pub description: String,
    /// JSON-Schema-like object describing the function parameters.
    pub input_schema: serde_json::Value,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub source_module: String,
    #[serde(default)]
    pub function_name: String,
    #[serde(default)]
    pub tool_name_prefix: String,
}

/// A plugin directory under the plugin root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginDir {
    pub name: String,
    pub path: PathBuf,
}

impl PluginDir {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
        }
    }

    pub fn tool_file(&self) -> PathBuf {
        self.path.join(TOOL_FILE)
    }

    pub fn requirements_file(&self) -> PathBuf {
        self.path.join(REQUIREMENTS_FILE)
    }

    pub fn venv_dir(&self) -> PathBuf {
        self.path.join(VENV_DIR)
    }

    /// Modification times of the tracked files (entry module and manifest),
    /// keyed by file name. Missing files are simply absent from the map, so
    /// adding or deleting one changes the tracked set.
    pub fn tracked_file_mtimes(&self) -> HashMap<String, SystemTime> {
        let mut mtimes = HashMap::new();
        for file_name in [TOOL_FILE, REQUIREMENTS_FILE] {
            if let Ok(metadata) = std::fs::metadata(self.path.join(file_name)) {
                if let Ok(mtime) = metadata.modified() {
                    mtimes.insert(file_name.to_string(), mtime);
                }
            }
        }
        mtimes
    }
}

/// Enumerate plugin directories under the plugin root. Directories with
/// invalid names (leading underscore, reserved names) are skipped; the
/// result is sorted by name for deterministic scan order.
pub fn plugin_directories(plugin_root: &Path) -> ToolHostResult<Vec<PluginDir>> {
    let mut dirs = Vec::new();

    let entries = std::fs::read_dir(plugin_root).map_err(map_io_err(plugin_root))?;
    for entry in entries {
        let entry = entry.map_err(map_io_err(plugin_root))?;
        let path = entry.path();
        if !path.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if !crate::is_valid_plugin_name(&name) {
            continue;
        }
        dirs.push(PluginDir::new(name, path));
    }

    dirs.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(dirs)
}

/// Parse a `requirements.txt` body into dependency lines. Blank lines and
/// `#` comments are ignored.
pub fn parse_requirements(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(String::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_requirements_skips_blanks_and_comments() {
        let content = "requests>=2.0\n\n# build tooling\nnumpy\n   \n  # trailing\npandas==2.2.0\n";
        assert_eq!(
            parse_requirements(content),
            vec!["requests>=2.0", "numpy", "pandas==2.2.0"]
        );
        assert!(parse_requirements("").is_empty());
        assert!(parse_requirements("# only comments\n").is_empty());
    }

    #[test]
    fn test_plugin_directories_filters_invalid_names() {
        let root = tempfile::tempdir().unwrap();
        for name in ["calc", "_hidden", "__pycache__", "weather", "2fast", "venv"] {
            std::fs::create_dir(root.path().join(name)).unwrap();
        }
        // Plain files are never plugins.
        std::fs::write(root.path().join("notes.txt"), "x").unwrap();

        let dirs = plugin_directories(root.path()).unwrap();
        let names: Vec<&str> = dirs.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["calc", "weather"]);
    }

    #[test]
    fn test_tracked_file_mtimes_follow_file_set() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("calc");
        std::fs::create_dir(&dir).unwrap();
        let plugin = PluginDir::new("calc", &dir);

        assert!(plugin.tracked_file_mtimes().is_empty());

        std::fs::write(plugin.tool_file(), "def add(a, b):\n    return a + b\n").unwrap();
        let mtimes = plugin.tracked_file_mtimes();
        assert_eq!(mtimes.len(), 1);
        assert!(mtimes.contains_key(TOOL_FILE));

        std::fs::write(plugin.requirements_file(), "requests\n").unwrap();
        let mtimes = plugin.tracked_file_mtimes();
        assert_eq!(mtimes.len(), 2);
        assert!(mtimes.contains_key(REQUIREMENTS_FILE));
    }

    #[test]
    fn test_descriptor_round_trips_through_json() {
        let descriptor = ToolDescriptor {
            name: "calc-add".to_string(),
            description: "Add two numbers".to_string(),
            input_schema: serde_json::json!({
                "type": "object",
                "properties": {
                    "a": {"type": "integer"},
                    "b": {"type": "integer"}
                },
                "required": ["a", "b"]
            }),
            tags: vec!["math".to_string()],
            source_module: "/srv/tools/calc/tool.py".to_string(),
            function_name: "add".to_string(),
            tool_name_prefix: "calc".to_string(),
        };

        let encoded = serde_json::to_string(&descriptor).unwrap();
        let decoded: ToolDescriptor = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, descriptor);
        assert_eq!(serde_json::to_string(&decoded).unwrap(), encoded);
    }
}
