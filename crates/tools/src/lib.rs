//! # Talon Tools
//!
//! Built-in tool implementations. Every tool resolves paths inside the
//! run's workspace directory and observes the cancellation token from its
//! context.

pub mod file_read;
pub mod file_write;
pub mod shell;

use std::path::{Component, Path, PathBuf};

use talon_core::error::ToolError;
use talon_core::ToolRegistry;

pub use file_read::FileReadTool;
pub use file_write::FileWriteTool;
pub use shell::ShellTool;

/// A registry holding all built-in tools.
pub fn default_registry() -> ToolRegistry {
    let mut registry = ToolRegistry::new();
    registry.register(std::sync::Arc::new(FileReadTool));
    registry.register(std::sync::Arc::new(FileWriteTool));
    registry.register(std::sync::Arc::new(ShellTool::new(Vec::new())));
    registry
}

/// Resolve `path` inside `workspace_dir`, rejecting traversal out of it.
pub(crate) fn resolve_in_workspace(
    workspace_dir: &Path,
    path: &str,
) -> Result<PathBuf, ToolError> {
    let candidate = Path::new(path);
    let joined = if candidate.is_absolute() {
        candidate.to_path_buf()
    } else {
        workspace_dir.join(candidate)
    };

    // Normalize lexically: the target may not exist yet (writes).
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::ParentDir => {
                if !normalized.pop() {
                    return Err(ToolError::PermissionDenied {
                        tool_name: String::new(),
                        reason: format!("Path '{path}' escapes the workspace"),
                    });
                }
            }
            Component::CurDir => {}
            other => normalized.push(other),
        }
    }

    let workspace = workspace_dir
        .canonicalize()
        .unwrap_or_else(|_| workspace_dir.to_path_buf());
    if !normalized.starts_with(&workspace) && !normalized.starts_with(workspace_dir) {
        return Err(ToolError::PermissionDenied {
            tool_name: String::new(),
            reason: format!("Path '{path}' is outside the workspace"),
        });
    }
    Ok(normalized)
}
