//! Per-plugin isolated environment management.
//!
//! Each plugin owns a `venv/` directory with its own interpreter and
//! installed packages. All state is on disk and operations are idempotent;
//! the manager holds no long-lived handles to child processes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tracing::{debug, error, info, warn};

use super::{parse_requirements, PluginDir, REQUIREMENTS_FILE};
use crate::error::{map_io_err, ToolHostError, ToolHostResult};

/// Packages every venv ships with; not counted as user-installed.
const BASELINE_PACKAGES: &[&str] = &["pip", "setuptools", "wheel"];

/// Stdlib modules the introspection worker needs inside the venv.
const BASELINE_IMPORTS: &str = "import importlib.util, inspect, json";

/// Result of one dependency installation run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub success: bool,
    pub message: String,
    pub stdout_lines: Vec<String>,
    pub stderr_lines: Vec<String>,
    pub return_code: Option<i32>,
}

impl InstallReport {
    fn trivial(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
            stdout_lines: Vec::new(),
            stderr_lines: Vec::new(),
            return_code: Some(0),
        }
    }
}

/// One installed package as reported by `pip list --format=json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PackageInfo {
    pub name: String,
    pub version: String,
}

/// Structural report of a plugin environment, used by diagnostics and the
/// admin surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentReport {
    pub name: String,
    pub path: String,
    pub has_tool_file: bool,
    pub has_requirements: bool,
    pub has_venv: bool,
    pub venv_path: String,
    pub interpreter: Option<String>,
    pub venv_valid: bool,
    pub pip_version: Option<String>,
    pub installed_packages: Vec<PackageInfo>,
    pub packages_count: usize,
    pub packages_error: Option<String>,
    pub requirements_content: Option<String>,
    pub requirements_list: Vec<String>,
    pub requirements_count: usize,
    pub tool_file_size: Option<u64>,
    pub tool_file_modified: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueSeverity {
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticIssue {
    pub severity: IssueSeverity,
    pub message: String,
    pub recommendation: String,
}

/// Derived health report for one plugin environment.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosisReport {
    pub plugin: String,
    pub status: HealthStatus,
    pub issues: Vec<DiagnosticIssue>,
}

/// Outcome of a repair pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RepairReport {
    pub plugin: String,
    pub recreated: bool,
    pub install: InstallReport,
}

/// Manages the isolated runtime environment of every plugin directory.
#[derive(Debug, Clone)]
pub struct EnvironmentManager {
    base_interpreter: PathBuf,
    install_timeout: Duration,
}

impl EnvironmentManager {
    /// Discover the base interpreter used to seed new environments.
    pub fn new(install_timeout: Duration) -> ToolHostResult<Self> {
        let base_interpreter = which::which("python3")
            .or_else(|_| which::which("python"))
            .map_err(|_| ToolHostError::InterpreterMissing {
                path: PathBuf::from("python3"),
            })?;
        debug!("Using base interpreter {}", base_interpreter.display());

        Ok(Self::with_base_interpreter(base_interpreter, install_timeout))
    }

    /// Build a manager around an explicit base interpreter.
    pub fn with_base_interpreter(base_interpreter: PathBuf, install_timeout: Duration) -> Self {
        Self {
            base_interpreter,
            install_timeout,
        }
    }

    /// Ensure the plugin has an isolated environment, creating it if absent.
    /// Returns the absolute environment path.
    pub async fn ensure(&self, plugin: &PluginDir) -> ToolHostResult<PathBuf> {
        let venv_path = plugin.venv_dir();
        if venv_path.exists() {
            return venv_path.canonicalize().map_err(map_io_err(&venv_path));
        }

        info!("Creating virtual environment for {}", plugin.name);
        let output = Command::new(&self.base_interpreter)
            .arg("-m")
            .arg("venv")
            .arg(&venv_path)
            .output()
            .await
            .map_err(map_io_err(&venv_path))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "Failed to create virtual environment for {}: {}",
                plugin.name, stderr
            );
            return Err(ToolHostError::env_creation(
                &plugin.name,
                stderr.trim().to_string(),
            ));
        }

        venv_path.canonicalize().map_err(map_io_err(&venv_path))
    }

    /// Absolute path of the sandboxed interpreter. Fails when the
    /// environment is absent or corrupt.
    pub fn interpreter_path(&self, plugin: &PluginDir) -> ToolHostResult<PathBuf> {
        let venv_path = plugin.venv_dir();
        let interpreter = if cfg!(windows) {
            venv_path.join("Scripts").join("python.exe")
        } else {
            venv_path.join("bin").join("python")
        };

        if !interpreter.exists() {
            return Err(ToolHostError::InterpreterMissing { path: interpreter });
        }
        Ok(interpreter)
    }

    /// Install the plugin's declared dependencies into its environment,
    /// streaming installer output line by line.
    pub async fn install_requirements(&self, plugin: &PluginDir) -> ToolHostResult<InstallReport> {
        let requirements_file = plugin.requirements_file();
        if !requirements_file.exists() {
            debug!("No {} found for {}", REQUIREMENTS_FILE, plugin.name);
            return Ok(InstallReport::trivial("No requirements.txt found"));
        }

        let interpreter = self.interpreter_path(plugin)?;
        info!("Installing requirements for {}", plugin.name);

        let mut child = Command::new(&interpreter)
            .arg("-m")
            .arg("pip")
            .arg("install")
            .arg("-r")
            .arg(&requirements_file)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(map_io_err(&requirements_file))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let plugin_name = plugin.name.clone();

        let run = async {
            let (mut stdout_lines, mut stderr_lines) = tokio::join!(
                collect_lines(stdout, &plugin_name),
                collect_lines(stderr, &plugin_name),
            );
            stdout_lines.append(&mut stderr_lines);
            let status = child.wait().await;
            (stdout_lines, status)
        };

        let (all_lines, status) = match tokio::time::timeout(self.install_timeout, run).await {
            Ok(result) => result,
            Err(_) => {
                warn!(
                    "Installation for {} exceeded {}s, killing installer",
                    plugin.name,
                    self.install_timeout.as_secs()
                );
                let _ = child.start_kill();
                return Ok(InstallReport {
                    success: false,
                    message: "Installation timeout".to_string(),
                    stdout_lines: Vec::new(),
                    stderr_lines: vec!["Installation process timed out".to_string()],
                    return_code: None,
                });
            }
        };

        let stderr_lines: Vec<String> = all_lines
            .iter()
            .filter(|line| is_installer_error_line(line))
            .cloned()
            .collect();

        let return_code = status.ok().and_then(|s| s.code());
        if return_code != Some(0) {
            error!(
                "Failed to install requirements for {}, return code: {:?}",
                plugin.name, return_code
            );
            return Ok(InstallReport {
                success: false,
                message: format!(
                    "Installation failed with return code {}",
                    return_code.map_or_else(|| "unknown".to_string(), |c| c.to_string())
                ),
                stdout_lines: all_lines,
                stderr_lines,
                return_code,
            });
        }

        info!("Requirements installed for {}", plugin.name);
        Ok(InstallReport {
            success: true,
            message: "Requirements installed successfully".to_string(),
            stdout_lines: all_lines,
            stderr_lines,
            return_code,
        })
    }

    /// Structural report of the plugin environment.
    pub async fn describe(&self, plugin: &PluginDir) -> EnvironmentReport {
        let tool_file = plugin.tool_file();
        let requirements_file = plugin.requirements_file();
        let venv_path = plugin.venv_dir();

        let mut report = EnvironmentReport {
            name: plugin.name.clone(),
            path: plugin.path.to_string_lossy().to_string(),
            has_tool_file: tool_file.exists(),
            has_requirements: requirements_file.exists(),
            has_venv: venv_path.exists(),
            venv_path: venv_path.to_string_lossy().to_string(),
            interpreter: None,
            venv_valid: false,
            pip_version: None,
            installed_packages: Vec::new(),
            packages_count: 0,
            packages_error: None,
            requirements_content: None,
            requirements_list: Vec::new(),
            requirements_count: 0,
            tool_file_size: None,
            tool_file_modified: None,
        };

        if report.has_venv {
            match self.interpreter_path(plugin) {
                Ok(interpreter) => {
                    report.interpreter = Some(interpreter.to_string_lossy().to_string());
                    report.venv_valid = true;

                    match self.run_python(&interpreter, &["-m", "pip", "--version"], 10).await {
                        Ok((true, stdout, _)) => {
                            report.pip_version = Some(stdout.trim().to_string())
                        }
                        Ok((false, _, stderr)) => {
                            report.pip_version = Some(format!("Error: {}", stderr.trim()))
                        }
                        Err(e) => report.pip_version = Some(format!("Error checking version: {}", e)),
                    }

                    match self
                        .run_python(&interpreter, &["-m", "pip", "list", "--format=json"], 30)
                        .await
                    {
                        Ok((true, stdout, _)) => {
                            match serde_json::from_str::<Vec<PackageInfo>>(stdout.trim()) {
                                Ok(packages) => {
                                    report.packages_count = packages.len();
                                    report.installed_packages = packages;
                                }
                                Err(e) => report.packages_error = Some(e.to_string()),
                            }
                        }
                        Ok((false, _, stderr)) => {
                            report.packages_error = Some(stderr.trim().to_string())
                        }
                        Err(e) => report.packages_error = Some(e.to_string()),
                    }
                }
                Err(e) => {
                    report.packages_error = Some(e.to_string());
                }
            }
        }

        if report.has_requirements {
            if let Ok(content) = std::fs::read_to_string(&requirements_file) {
                report.requirements_list = parse_requirements(&content);
                report.requirements_count = report.requirements_list.len();
                report.requirements_content = Some(content);
            }
        }

        if report.has_tool_file {
            if let Ok(metadata) = std::fs::metadata(&tool_file) {
                report.tool_file_size = Some(metadata.len());
                if let Ok(mtime) = metadata.modified() {
                    let stamp: chrono::DateTime<chrono::Local> = mtime.into();
                    report.tool_file_modified =
                        Some(stamp.format("%Y-%m-%d %H:%M:%S").to_string());
                }
            }
        }

        report
    }

    /// Classify environment issues and derive an overall health status.
    pub async fn diagnose(&self, plugin: &PluginDir) -> DiagnosisReport {
        let mut issues = Vec::new();
        let report = self.describe(plugin).await;

        if !report.has_tool_file {
            issues.push(DiagnosticIssue {
                severity: IssueSeverity::Critical,
                message: "Missing tool.py entry file".to_string(),
                recommendation: format!(
                    "Create {}/tool.py defining the plugin's public functions",
                    plugin.name
                ),
            });
        }

        if !report.has_venv {
            issues.push(DiagnosticIssue {
                severity: IssueSeverity::Warning,
                message: "No virtual environment".to_string(),
                recommendation: "Run repair_tool_env or wait for the next scan to create it"
                    .to_string(),
            });
        } else if !report.venv_valid {
            issues.push(DiagnosticIssue {
                severity: IssueSeverity::Critical,
                message: "Environment exists but its interpreter is missing".to_string(),
                recommendation: "Run repair_tool_env with force=true to recreate the environment"
                    .to_string(),
            });
        } else if let Ok(interpreter) = self.interpreter_path(plugin) {
            let pip_ok = matches!(
                self.run_python(&interpreter, &["-m", "pip", "--version"], 10).await,
                Ok((true, _, _))
            );
            if !pip_ok {
                issues.push(DiagnosticIssue {
                    severity: IssueSeverity::Critical,
                    message: "Package installer is missing or broken".to_string(),
                    recommendation: "Run repair_tool_env with force=true to recreate the environment"
                        .to_string(),
                });
            }

            let baseline_ok = matches!(
                self.run_python(&interpreter, &["-c", BASELINE_IMPORTS], 10).await,
                Ok((true, _, _))
            );
            if !baseline_ok {
                issues.push(DiagnosticIssue {
                    severity: IssueSeverity::Critical,
                    message: "Interpreter cannot load the introspection baseline".to_string(),
                    recommendation: "Run repair_tool_env with force=true to recreate the environment"
                        .to_string(),
                });
            }

            let user_packages = report
                .installed_packages
                .iter()
                .filter(|p| !BASELINE_PACKAGES.contains(&p.name.to_lowercase().as_str()))
                .count();
            if report.requirements_count > 0 && user_packages == 0 {
                issues.push(DiagnosticIssue {
                    severity: IssueSeverity::Warning,
                    message: "Manifest declares dependencies but none are installed".to_string(),
                    recommendation: "Run repair_tool_env to install the declared requirements"
                        .to_string(),
                });
            }
        }

        let status = if issues.iter().any(|i| i.severity == IssueSeverity::Critical) {
            HealthStatus::Critical
        } else if issues.is_empty() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Warning
        };

        DiagnosisReport {
            plugin: plugin.name.clone(),
            status,
            issues,
        }
    }

    /// Recreate or complete the plugin environment. With `force`, the
    /// existing environment is destroyed first.
    pub async fn repair(&self, plugin: &PluginDir, force: bool) -> ToolHostResult<RepairReport> {
        let mut recreated = false;
        if force && plugin.venv_dir().exists() {
            self.cleanup(plugin)?;
            recreated = true;
        }

        self.ensure(plugin).await?;
        let install = self.install_requirements(plugin).await?;

        Ok(RepairReport {
            plugin: plugin.name.clone(),
            recreated,
            install,
        })
    }

    /// Remove the plugin's environment directory.
    pub fn cleanup(&self, plugin: &PluginDir) -> ToolHostResult<()> {
        let venv_path = plugin.venv_dir();
        if venv_path.exists() {
            std::fs::remove_dir_all(&venv_path).map_err(map_io_err(&venv_path))?;
            info!("Cleaned up environment for {}", plugin.name);
        }
        Ok(())
    }

    /// Uninstall everything except the baseline packages. Returns the
    /// removed package names.
    pub async fn uninstall_user_packages(&self, plugin: &PluginDir) -> ToolHostResult<Vec<String>> {
        let interpreter = self.interpreter_path(plugin)?;

        let (ok, stdout, stderr) = self
            .run_python(&interpreter, &["-m", "pip", "list", "--format=json"], 30)
            .await?;
        if !ok {
            return Err(ToolHostError::other(format!(
                "Failed to enumerate installed packages: {}",
                stderr.trim()
            )));
        }

        let packages: Vec<PackageInfo> = serde_json::from_str(stdout.trim())?;
        let user_packages: Vec<String> = packages
            .into_iter()
            .map(|p| p.name)
            .filter(|name| !BASELINE_PACKAGES.contains(&name.to_lowercase().as_str()))
            .collect();

        if user_packages.is_empty() {
            return Ok(user_packages);
        }

        let mut args: Vec<&str> = vec!["-m", "pip", "uninstall", "-y"];
        args.extend(user_packages.iter().map(String::as_str));
        let (ok, _, stderr) = self.run_python(&interpreter, &args, 120).await?;
        if !ok {
            return Err(ToolHostError::other(format!(
                "Failed to uninstall packages: {}",
                stderr.trim()
            )));
        }

        info!(
            "Uninstalled {} user packages from {}",
            user_packages.len(),
            plugin.name
        );
        Ok(user_packages)
    }

    /// Run the given interpreter with arguments and a bounded wait.
    /// Returns (success, stdout, stderr).
    async fn run_python(
        &self,
        interpreter: &Path,
        args: &[&str],
        timeout_secs: u64,
    ) -> ToolHostResult<(bool, String, String)> {
        let output = tokio::time::timeout(
            Duration::from_secs(timeout_secs),
            Command::new(interpreter)
                .args(args)
                .kill_on_drop(true)
                .output(),
        )
        .await
        .map_err(|_| ToolHostError::other(format!("Command timed out: python {}", args.join(" "))))?
        .map_err(map_io_err(interpreter))?;

        Ok((
            output.status.success(),
            String::from_utf8_lossy(&output.stdout).to_string(),
            String::from_utf8_lossy(&output.stderr).to_string(),
        ))
    }
}

/// Lines the installer prints when a package cannot be resolved or built.
pub fn is_installer_error_line(line: &str) -> bool {
    line.contains("ERROR:") || line.contains("FAILED:") || line.contains("Could not find")
}

/// Drain a child stream line by line, logging each line as it arrives.
async fn collect_lines<R: AsyncRead + Unpin>(stream: Option<R>, plugin: &str) -> Vec<String> {
    let mut lines = Vec::new();
    let Some(stream) = stream else {
        return lines;
    };

    let mut reader = BufReader::new(stream).lines();
    while let Ok(Some(line)) = reader.next_line().await {
        if !line.is_empty() {
            debug!("[{}] {}", plugin, line);
            lines.push(line);
        }
    }
    lines
}
