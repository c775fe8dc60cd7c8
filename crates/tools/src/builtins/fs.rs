//! Workspace file reader.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::{
    ParamType, Tool, ToolError, ToolParam, ToolSpec, optional_u64, required_str,
    truncate_byte_boundary,
};

const DEFAULT_MAX_BYTES: u64 = 64 * 1024;

/// Resolve `.` and `..` lexically, without touching the filesystem.
fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other),
        }
    }
    out
}

/// `rel_path` joined onto `root`, rejected if it leaves the workspace.
fn checked_path(root: &Path, rel_path: &str) -> Result<PathBuf, ToolError> {
    let normalized = normalize_path(&root.join(rel_path));
    if !normalized.starts_with(normalize_path(root)) {
        return Err(ToolError::InvalidArguments(format!(
            "path escapes workspace boundary: {rel_path}"
        )));
    }
    Ok(normalized)
}

pub struct ReaderTool {
    pub workspace_root: PathBuf,
}

impl ReaderTool {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
        }
    }
}

#[async_trait]
impl Tool for ReaderTool {
    fn spec(&self) -> ToolSpec {
        ToolSpec {
            name: "reader".to_string(),
            description: "Read a text file within the workspace.".to_string(),
            params: vec![
                ToolParam::required("path", "Relative path from workspace root"),
                ToolParam::optional(
                    "max_bytes",
                    format!("Maximum bytes to return (default: {DEFAULT_MAX_BYTES})"),
                )
                .of_type(ParamType::Integer),
            ],
        }
    }

    async fn invoke(&self, args: &Value) -> Result<Value, ToolError> {
        let rel_path = required_str(args, "path")?;
        let full = checked_path(&self.workspace_root, rel_path)?;
        let max_bytes = optional_u64(args, "max_bytes")?.unwrap_or(DEFAULT_MAX_BYTES) as usize;

        let content = tokio::fs::read_to_string(&full).await.map_err(|err| {
            ToolError::Execution(format!("cannot read `{rel_path}`: {err}"))
        })?;
        let end = truncate_byte_boundary(&content, max_bytes);

        Ok(json!({
            "path": rel_path,
            "content": &content[..end],
            "truncated": end < content.len(),
        }))
    }
}
