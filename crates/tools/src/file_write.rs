//! File write tool — create or overwrite files in the workspace.

use async_trait::async_trait;

use talon_core::error::ToolError;
use talon_core::{Tool, ToolContext};

use crate::resolve_in_workspace;

pub struct FileWriteTool;

#[async_trait]
impl Tool for FileWriteTool {
    fn name(&self) -> &str {
        "write"
    }

    fn description(&self) -> &str {
        "Write content to a file at the given path, creating parent directories as needed."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "path": {
                    "type": "string",
                    "description": "The file path to write, relative to the workspace"
                },
                "content": {
                    "type": "string",
                    "description": "The content to write"
                }
            },
            "required": ["path", "content"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let path = input["path"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'path' argument".into()))?;
        let content = input["content"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'content' argument".into()))?;
        let resolved = resolve_in_workspace(&ctx.workspace_dir, path)?;

        if let Some(parent) = resolved.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;
        }
        tokio::fs::write(&resolved, content)
            .await
            .map_err(|e| ToolError::ExecutionFailed(format!("Failed to write {path}: {e}")))?;
        Ok(format!("Wrote {} bytes to {path}", content.len()))
    }
}
