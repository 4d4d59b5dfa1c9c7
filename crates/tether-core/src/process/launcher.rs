//! Spawning plugin executables and querying their metadata.

use crate::config::{EnvConfig, TimeoutConfig};
use crate::error::{Result, TetherError};
use crate::rpc::PluginDescriptor;
use async_trait::async_trait;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::{Child, Command};
use tracing::{debug, info};

/// Everything needed to start one plugin process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub plugin_id: String,
    pub path: PathBuf,
    /// `host:port` the plugin dials back to.
    pub host_address: String,
    /// Per-spawn correlation token echoed in the plugin's registration.
    pub launch_token: String,
    /// File receiving the child's stdout/stderr; `None` inherits the host's.
    pub log_file: Option<PathBuf>,
}

/// How a plugin process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitReport {
    pub code: Option<i32>,
    pub success: bool,
}

/// A running plugin process, owned by its monitor task.
#[async_trait]
pub trait PluginProcess: Send {
    fn pid(&self) -> Option<u32>;

    /// Wait for the process to exit. Must be cancel-safe.
    async fn wait(&mut self) -> Result<ExitReport>;

    /// Terminate the process forcibly.
    async fn kill(&mut self) -> Result<()>;
}

/// Starts plugin processes and runs metadata queries.
#[async_trait]
pub trait PluginLauncher: Send + Sync + 'static {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn PluginProcess>>;

    /// Run the executable in metadata query mode and parse its descriptor.
    async fn query_info(&self, path: &Path) -> Result<PluginDescriptor>;
}

/// Launcher that runs plugin executables as OS child processes.
#[derive(Debug, Default, Clone, Copy)]
pub struct CommandLauncher;

impl CommandLauncher {
    pub fn new() -> Self {
        Self
    }

    fn open_log(path: &Path) -> Result<(Stdio, Stdio)> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                TetherError::io_with_context(e, format!("create log dir {}", parent.display()))
            })?;
        }
        let file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| TetherError::io_with_context(e, format!("open log {}", path.display())))?;
        let stdout_file = file
            .try_clone()
            .map_err(|e| TetherError::io_with_context(e, "clone log file handle"))?;
        Ok((Stdio::from(stdout_file), Stdio::from(file)))
    }
}

#[async_trait]
impl PluginLauncher for CommandLauncher {
    async fn spawn(&self, spec: &LaunchSpec) -> Result<Box<dyn PluginProcess>> {
        let mut cmd = Command::new(&spec.path);
        cmd.env(EnvConfig::PLUGIN_ID, &spec.plugin_id)
            .env(EnvConfig::HOST_ADDRESS, &spec.host_address)
            .env(EnvConfig::LAUNCH_TOKEN, &spec.launch_token)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        match &spec.log_file {
            Some(log_file) => {
                let (stdout, stderr) = Self::open_log(log_file)?;
                cmd.stdout(stdout).stderr(stderr);
            }
            None => {
                cmd.stdout(Stdio::inherit()).stderr(Stdio::inherit());
            }
        }

        let child = cmd.spawn().map_err(|e| TetherError::LaunchFailed {
            path: spec.path.clone(),
            message: e.to_string(),
        })?;

        info!(
            plugin_id = %spec.plugin_id,
            pid = ?child.id(),
            "Launched plugin from {}",
            spec.path.display()
        );

        Ok(Box::new(ChildProcess { child }))
    }

    async fn query_info(&self, path: &Path) -> Result<PluginDescriptor> {
        let metadata_error = |message: String| TetherError::MetadataQuery {
            path: path.to_path_buf(),
            message,
        };

        let output = Command::new(path)
            .arg(EnvConfig::INFO_FLAG)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(TimeoutConfig::METADATA_QUERY, output)
            .await
            .map_err(|_| {
                metadata_error(format!(
                    "no answer within {:?}",
                    TimeoutConfig::METADATA_QUERY
                ))
            })?
            .map_err(|e| metadata_error(e.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(metadata_error(format!(
                "exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let descriptor = parse_descriptor(&stdout).map_err(metadata_error)?;
        debug!(
            plugin_id = %descriptor.id,
            "Queried metadata from {}",
            path.display()
        );
        Ok(descriptor)
    }
}

/// Parse metadata query output. Accepts the object on its own or as the
/// last JSON line of a noisier output.
pub fn parse_descriptor(output: &str) -> std::result::Result<PluginDescriptor, String> {
    let trimmed = output.trim();
    let parsed = serde_json::from_str::<PluginDescriptor>(trimmed).or_else(|first_err| {
        trimmed
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| line.starts_with('{'))
            .ok_or_else(|| format!("invalid metadata JSON: {}", first_err))
            .and_then(|line| {
                serde_json::from_str::<PluginDescriptor>(line)
                    .map_err(|e| format!("invalid metadata JSON: {}", e))
            })
    })?;

    if parsed.name.trim().is_empty() {
        return Err("metadata is missing a plugin name".to_string());
    }
    Ok(parsed)
}

/// A plugin running as an OS child process.
#[derive(Debug)]
pub struct ChildProcess {
    child: Child,
}

#[async_trait]
impl PluginProcess for ChildProcess {
    fn pid(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> Result<ExitReport> {
        let status = self.child.wait().await?;
        Ok(ExitReport {
            code: status.code(),
            success: status.success(),
        })
    }

    async fn kill(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already exited
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(TetherError::io_with_context(e, "kill plugin process")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_descriptor_plain_object() {
        let descriptor = parse_descriptor(
            r#"{"id":"s","name":"Sample","version":"1.0.0","description":"d","capabilities":["x"],"functions":["Echo"]}"#,
        )
        .unwrap();
        assert_eq!(descriptor.name, "Sample");
        assert_eq!(descriptor.functions, vec!["Echo"]);
    }

    #[test]
    fn test_parse_descriptor_after_noise() {
        let output = "starting up\n{\"id\":\"s\",\"name\":\"Sample\",\"version\":\"1.0.0\"}\n";
        let descriptor = parse_descriptor(output).unwrap();
        assert_eq!(descriptor.id, "s");
        assert!(descriptor.capabilities.is_empty());
    }

    #[test]
    fn test_parse_descriptor_rejects_garbage() {
        assert!(parse_descriptor("not json at all").is_err());
        assert!(parse_descriptor(r#"{"id":"x","name":"","version":"1"}"#).is_err());
    }

    #[tokio::test]
    async fn test_query_info_missing_executable() {
        let temp_dir = TempDir::new().unwrap();
        let missing = temp_dir.path().join("no-such-plugin");

        let result = CommandLauncher::new().query_info(&missing).await;
        assert!(matches!(result, Err(TetherError::MetadataQuery { .. })));
    }

    #[tokio::test]
    async fn test_spawn_missing_executable() {
        let temp_dir = TempDir::new().unwrap();
        let spec = LaunchSpec {
            plugin_id: "ghost".into(),
            path: temp_dir.path().join("no-such-plugin"),
            host_address: "127.0.0.1:1".into(),
            launch_token: "t".into(),
            log_file: Some(temp_dir.path().join("logs").join("ghost.log")),
        };

        let result = CommandLauncher::new().spawn(&spec).await;
        assert!(matches!(result, Err(TetherError::LaunchFailed { .. })));
    }
}
