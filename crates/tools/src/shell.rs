//! Shell tool — execute system commands.
//!
//! Supports command allowlisting, workspace-scoped working directory, and
//! cooperative cancellation: an aborted run kills the child process.

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, warn};

use talon_core::error::ToolError;
use talon_core::{Tool, ToolContext};

/// Execute shell commands with safety constraints.
pub struct ShellTool {
    /// If non-empty, only these base commands are allowed.
    allowed_commands: Vec<String>,
}

impl ShellTool {
    pub fn new(allowed_commands: Vec<String>) -> Self {
        Self { allowed_commands }
    }

    fn is_command_allowed(&self, command: &str) -> bool {
        if self.allowed_commands.is_empty() {
            return true;
        }
        let base_cmd = command.split_whitespace().next().unwrap_or("").trim();
        self.allowed_commands.iter().any(|a| a == base_cmd)
    }
}

#[async_trait]
impl Tool for ShellTool {
    fn name(&self) -> &str {
        "shell"
    }

    fn description(&self) -> &str {
        "Execute a shell command in the workspace and return stdout/stderr."
    }

    fn input_schema(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "command": {
                    "type": "string",
                    "description": "The shell command to execute"
                }
            },
            "required": ["command"]
        })
    }

    async fn execute(
        &self,
        input: serde_json::Value,
        ctx: &ToolContext,
    ) -> Result<String, ToolError> {
        let command = input["command"]
            .as_str()
            .ok_or_else(|| ToolError::InvalidArguments("Missing 'command' argument".into()))?;

        if !self.is_command_allowed(command) {
            return Err(ToolError::PermissionDenied {
                tool_name: "shell".into(),
                reason: format!(
                    "Command '{}' not in allowlist",
                    command.split_whitespace().next().unwrap_or("")
                ),
            });
        }

        debug!(command = %command, "Executing shell command");

        let child = Command::new("sh")
            .args(["-c", command])
            .current_dir(&ctx.workspace_dir)
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ToolError::ExecutionFailed(e.to_string()))?;

        let output = tokio::select! {
            output = child.wait_with_output() => {
                output.map_err(|e| ToolError::ExecutionFailed(e.to_string()))?
            }
            () = ctx.cancel.cancelled() => {
                warn!(command = %command, "Shell command aborted");
                return Err(ToolError::Aborted);
            }
        };

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if output.status.success() {
            if stderr.is_empty() {
                Ok(stdout.trim_end().to_string())
            } else {
                Ok(format!("{stdout}\n[stderr]: {stderr}").trim_end().to_string())
            }
        } else {
            let code = output.status.code().unwrap_or(-1);
            warn!(command = %command, exit_code = code, "Command failed");
            Ok(format!("[exit code: {code}]\n{stdout}\n{stderr}")
                .trim_end()
                .to_string())
        }
    }
}
