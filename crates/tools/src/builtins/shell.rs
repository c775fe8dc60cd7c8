//! Shell execution tool.

use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::{
    ParamType, Tool, ToolError, ToolParam, ToolSpec, optional_u64, required_str,
    truncate_byte_boundary,
};

pub struct ShellTool {
    pub workspace_root: PathBuf,
    pub default_timeout_secs: u64,
    /// Requested timeouts are clamped to this.
    pub max_timeout_secs: u64,
    pub max_output_bytes: usize,
}

impl ShellTool {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            default_timeout_secs: 30,
            max_timeout_secs: 300,
            max_output_bytes: 32 * 1024,
        }
    }

    pub fn with_limits(mut self, timeout_secs: u64, max_output_bytes: usize) -> Self {
        self.default_timeout_secs = timeout_secs;
        self.max_output_bytes = max_output_bytes;
        self
    }

    pub fn with_max_timeout(mut self, max_timeout_secs: u64) -> Self {
        self.max_timeout_secs = max_timeout_secs;
        self
    }

    fn cap(&self, text: &str) -> (String, bool) {
        if text.len() <= self.max_output_bytes {
            return (text.to_string(), false);
        }
        let end = truncate_byte_boundary(text, self.max_output_bytes);
        (text[..end].to_string(), true)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "shell".to_string(),
            description: "Execute a shell command within the workspace directory. \
                Each invocation runs in a fresh shell, so `cd` does not persist \
                between calls. Chain commands with `&&` when they must share state."
                .to_string(),
            params: vec![
                ToolParam::required("command", "Shell command to execute"),
                ToolParam::optional(
                    "timeout_secs",
                    format!(
                        "Max execution time in seconds (default: {}, at most {})",
                        self.default_timeout_secs, self.max_timeout_secs
                    ),
                )
                .of_type(ParamType::Integer),
            ],
        }
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let command = required_str(args, "command")?;
        let requested = optional_u64(args, "timeout_secs")?.unwrap_or(self.default_timeout_secs);
        let timeout_secs = requested.clamp(1, self.max_timeout_secs.max(1));
        if timeout_secs != requested {
            tracing::debug!(requested, timeout_secs, "clamped shell timeout");
        }

        tracing::debug!(%command, timeout_secs, "running shell command");
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workspace_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (status, stdout, stderr) = tokio::time::timeout(Duration::from_secs(timeout_secs), async {
            let (status, stdout, stderr) = tokio::join!(
                child.wait(),
                read_capped(stdout, self.max_output_bytes),
                read_capped(stderr, self.max_output_bytes),
            );
            Ok::<_, io::Error>((status?, stdout?, stderr?))
        })
        .await
        .map_err(|_| ToolError::Timeout(timeout_secs))??;

        let ((stdout, stdout_dropped), (stderr, stderr_dropped)) = (stdout, stderr);
        let (stdout, stdout_cut) = self.cap(&String::from_utf8_lossy(&stdout));
        let (stderr, stderr_cut) = self.cap(&String::from_utf8_lossy(&stderr));

        Ok(json!({
            "exit_code": status.code(),
            "stdout": stdout,
            "stderr": stderr,
            "truncated": stdout_dropped || stderr_dropped || stdout_cut || stderr_cut,
        }))
    }
}

/// Keep the first `cap` bytes of a pipe and drain the rest.  The flag is
/// set when anything was dropped.
async fn read_capped<R: AsyncRead + Unpin>(pipe: Option<R>, cap: usize) -> io::Result<(Vec<u8>, bool)> {
    let Some(mut pipe) = pipe else {
        return Ok((Vec::new(), false));
    };
    let mut kept = Vec::new();
    (&mut pipe).take(cap as u64).read_to_end(&mut kept).await?;
    let dropped = tokio::io::copy(&mut pipe, &mut tokio::io::sink()).await?;
    Ok((kept, dropped > 0))
}
