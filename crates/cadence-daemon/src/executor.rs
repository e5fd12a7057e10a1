use std::process::Stdio;

use async_trait::async_trait;
use cadence_core::config::ShellConfig;
use cadence_core::Node;
use cadence_scheduler::ScriptExecutor;
use tokio::process::Command;
use tracing::debug;

/// Script instruction holding one shell command line.
pub const SHELL_NODE: &str = "sh";

/// Runs every `sh` step of a script through the configured shell, in order,
/// stopping at the first step that fails.
pub struct ShellExecutor {
    program: String,
    args: Vec<String>,
}

impl ShellExecutor {
    pub fn new(config: &ShellConfig) -> Self {
        Self {
            program: config.program.clone(),
            args: config.args.clone(),
        }
    }

    async fn run_line(&self, line: &str) -> Result<(), String> {
        let output = Command::new(&self.program)
            .args(&self.args)
            .arg(line)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| format!("spawn failed: {e}"))?;

        let stdout = strip_text(&output.stdout);
        let stderr = strip_text(&output.stderr);
        if output.status.success() {
            if !stdout.is_empty() {
                debug!(command = line, %stdout, "shell step output");
            }
            return Ok(());
        }

        let exit_code = output.status.code().unwrap_or(-1);
        let detail = if !stderr.is_empty() { stderr } else { stdout };
        if detail.is_empty() {
            Err(format!("`{line}` exited with status {exit_code}"))
        } else {
            Err(format!("`{line}` exited with status {exit_code}: {detail}"))
        }
    }
}

#[async_trait]
impl ScriptExecutor for ShellExecutor {
    async fn execute(&self, job: &str, script: &Node) -> Result<(), String> {
        for (step, node) in script.children.iter().enumerate() {
            if node.name != SHELL_NODE {
                return Err(format!("step {step}: unsupported instruction '{}'", node.name));
            }
            let line = node
                .text()
                .ok_or_else(|| format!("step {step}: '{SHELL_NODE}' carries no command line"))?;

            debug!(job, step, command = line, "running shell step");
            self.run_line(line)
                .await
                .map_err(|e| format!("step {step}: {e}"))?;
        }
        Ok(())
    }
}

fn strip_text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).trim().to_string()
}
