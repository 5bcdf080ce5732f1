//! Embedded one-shot worker scripts.
//!
//! The introspection and execution workers are Python scripts shipped
//! inside the server binary and materialized under the plugin root at
//! startup. The directory name starts with an underscore so plugin
//! discovery never treats it as a plugin.

use std::path::{Path, PathBuf};

use crate::error::{map_io_err, ToolHostResult};

const LOADER_SCRIPT: &str = include_str!("workers/tool_loader.py");
const EXECUTOR_SCRIPT: &str = include_str!("workers/tool_executor.py");

/// Directory under the plugin root holding the materialized scripts.
pub const WORKERS_DIR: &str = "_workers";

/// Absolute paths of the materialized worker scripts.
#[derive(Debug, Clone)]
pub struct WorkerScripts {
    pub loader: PathBuf,
    pub executor: PathBuf,
}

impl WorkerScripts {
    /// Write both scripts under `<plugin_root>/_workers/`, overwriting any
    /// previous copies so upgrades propagate.
    pub fn materialize(plugin_root: &Path) -> ToolHostResult<Self> {
        let dir = plugin_root.join(WORKERS_DIR);
        std::fs::create_dir_all(&dir).map_err(map_io_err(&dir))?;

        let loader = dir.join("tool_loader.py");
        let executor = dir.join("tool_executor.py");
        std::fs::write(&loader, LOADER_SCRIPT).map_err(map_io_err(&loader))?;
        std::fs::write(&executor, EXECUTOR_SCRIPT).map_err(map_io_err(&executor))?;

        Ok(Self { loader, executor })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_materialize_writes_both_scripts() {
        let root = tempfile::tempdir().unwrap();
        let scripts = WorkerScripts::materialize(root.path()).unwrap();

        assert!(scripts.loader.exists());
        assert!(scripts.executor.exists());

        let loader = std::fs::read_to_string(&scripts.loader).unwrap();
        assert!(loader.contains("load_tools_from_module"));
        let executor = std::fs::read_to_string(&scripts.executor).unwrap();
        assert!(executor.contains("execute_tool"));
    }

    #[test]
    fn test_workers_dir_is_not_a_plugin_name() {
        assert!(!crate::is_valid_plugin_name(WORKERS_DIR));
    }
}
