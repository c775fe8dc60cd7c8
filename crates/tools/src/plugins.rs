//! External command plugins described by TOML manifests.
//!
//! Every `*.toml` file in the plugin directory declares one tool:
//!
//! ```toml
//! name = "weather"
//! description = "Current weather for a city"
//! command = "/usr/local/bin/weather-tool"
//! args = ["--json"]
//!
//! [[parameters]]
//! name = "city"
//! description = "City name"
//! required = true
//! ```
//!
//! The command receives the JSON arguments on stdin.  Stdout is parsed as
//! JSON; anything else is returned as a JSON string.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::{Tool, ToolError, ToolParam, ToolSpec};

const DEFAULT_PLUGIN_TIMEOUT_SECS: u64 = 30;

#[derive(Debug, Clone, Deserialize)]
pub struct PluginManifest {
    pub name: String,
    pub description: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub parameters: Vec<ToolParam>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl PluginManifest {
    pub fn load(path: &Path) -> Result<Self, String> {
        let raw = fs::read_to_string(path).map_err(|err| err.to_string())?;
        let manifest: Self = toml::from_str(&raw).map_err(|err| err.to_string())?;
        if manifest.name.trim().is_empty() {
            return Err("`name` must not be empty".to_string());
        }
        if manifest.command.trim().is_empty() {
            return Err("`command` must not be empty".to_string());
        }
        Ok(manifest)
    }
}

pub struct PluginTool {
    manifest: PluginManifest,
    /// Working directory for the spawned command.
    base_dir: PathBuf,
}

impl PluginTool {
    pub fn new(manifest: PluginManifest, base_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            base_dir: base_dir.into(),
        }
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }
}

#[async_trait]
impl Tool for PluginTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: self.manifest.name.clone(),
            description: self.manifest.description.clone(),
            params: self.manifest.parameters.clone(),
        }
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let timeout_secs = self
            .manifest
            .timeout_secs
            .unwrap_or(DEFAULT_PLUGIN_TIMEOUT_SECS);
        let input = serde_json::to_vec(args)
            .map_err(|err| ToolError::InvalidArguments(err.to_string()))?;

        let mut child = tokio::process::Command::new(&self.manifest.command)
            .args(&self.manifest.args)
            .current_dir(&self.base_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| {
                ToolError::Execution(format!(
                    "cannot start plugin `{}`: {err}",
                    self.manifest.name
                ))
            })?;

        // Stdin is fed while the output is drained; the timeout covers both.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
                stdin.shutdown().await?;
            }
            Ok::<(), io::Error>(())
        };
        let (fed, output) = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            tokio::join!(feed, child.wait_with_output())
        })
        .await
        .map_err(|_| ToolError::Timeout(timeout_secs))?;
        let output = output?;
        if let Err(err) = fed {
            // A plugin may exit without reading all of stdin.
            debug!(plugin = %self.manifest.name, error = %err, "plugin stdin closed early");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ToolError::Execution(format!(
                "plugin `{}` exited with {}: {}",
                self.manifest.name,
                output.status,
                stderr.trim()
            )));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let trimmed = stdout.trim();
        Ok(serde_json::from_str(trimmed).unwrap_or_else(|_| Value::String(trimmed.to_string())))
    }
}

/// Load every plugin manifest in `dir`, sorted by file name.  A missing
/// directory yields nothing; a bad manifest is logged and skipped.
pub fn discover_plugins(dir: &Path) -> Vec<PluginTool> {
    let mut tools = Vec::new();
    if !dir.is_dir() {
        debug!(?dir, "plugin dir absent; skipping plugin discovery");
        return tools;
    }

    let mut paths: Vec<PathBuf> = match fs::read_dir(dir) {
        Ok(entries) => entries
            .flatten()
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "toml"))
            .collect(),
        Err(err) => {
            warn!(?dir, error = %err, "cannot read plugin dir");
            return tools;
        }
    };
    paths.sort();

    for path in paths {
        match PluginManifest::load(&path) {
            Ok(manifest) => {
                debug!(?path, plugin = %manifest.name, "plugin manifest loaded");
                tools.push(PluginTool::new(manifest, dir));
            }
            Err(err) => warn!(?path, error = %err, "skipping malformed plugin manifest"),
        }
    }

    if !tools.is_empty() {
        info!(count = tools.len(), ?dir, "plugins discovered");
    }
    tools
}
