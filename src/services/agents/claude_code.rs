//! Claude Code Adapter
//!
//! Invokes the `claude` CLI in non-interactive print mode. The prompt is
//! kept in a workspace file and the CLI is pointed at it, so argv never
//! grows with log size.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::services::agents::process::{run_captured, ProcessFailure};
use crate::services::agents::runner::{
    failure_from_process, AgentOptions, AgentProbe, AgentRun, AgentRunner,
};
use crate::utils::error::StageError;

#[derive(Debug)]
pub struct ClaudeCodeRunner {
    binary: String,
}

impl ClaudeCodeRunner {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "claude".to_string()),
        }
    }

    fn build_command(&self, prompt_file: &Path, workspace: &Path, options: &AgentOptions) -> Command {
        let prompt_name = prompt_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prompt.txt".to_string());

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(workspace)
            .arg("-p")
            .arg(format!(
                "Read the file {} and follow the instructions in it.",
                prompt_name
            ))
            .arg("--output-format")
            .arg("text");

        if !options.model.is_empty() {
            cmd.arg("--model").arg(&options.model);
        }
        if options.max_turns > 0 {
            cmd.arg("--max-turns").arg(options.max_turns.to_string());
        }
        if !options.allowed_tools.is_empty() {
            cmd.arg("--allowedTools").arg(options.allowed_tools.join(","));
        }
        cmd
    }
}

#[async_trait]
impl AgentRunner for ClaudeCodeRunner {
    fn name(&self) -> &str {
        "claude_code"
    }

    async fn run(
        &self,
        prompt_file: &Path,
        workspace: &Path,
        options: &AgentOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, StageError> {
        let cmd = self.build_command(prompt_file, workspace, options);
        tracing::info!(
            workspace = %workspace.display(),
            model = %options.model,
            timeout_secs = options.timeout.as_secs(),
            "running claude_code"
        );

        let output = run_captured(cmd, options.timeout, options.stdout_cap, cancel)
            .await
            .map_err(|f| failure_from_process(self.name(), f, options.timeout))?;

        if output.exit_code != Some(0) {
            tracing::warn!(
                exit_code = ?output.exit_code,
                stderr = %output.stderr_tail(5),
                "claude_code exited nonzero"
            );
        }

        Ok(AgentRun {
            stderr_tail: output.stderr_tail(20),
            exit_code: output.exit_code,
            duration: output.duration,
            transcript: output.stdout,
        })
    }

    async fn available(&self) -> AgentProbe {
        let mut cmd = Command::new(&self.binary);
        cmd.arg("--version");
        match run_captured(cmd, Duration::from_secs(10), 4096, &CancellationToken::new()).await {
            Ok(output) if output.exit_code == Some(0) => AgentProbe {
                available: true,
                detail: first_line(&output.stdout),
            },
            Ok(output) => AgentProbe {
                available: false,
                detail: format!("version check exited {:?}", output.exit_code),
            },
            Err(ProcessFailure::Timeout) => AgentProbe {
                available: false,
                detail: "version check timed out".to_string(),
            },
            Err(e) => AgentProbe {
                available: false,
                detail: format!("{:?}", e),
            },
        }
    }
}

pub(crate) fn first_line(s: &str) -> String {
    s.lines().next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options() -> AgentOptions {
        AgentOptions {
            model: "claude-sonnet-4-20250514".into(),
            timeout: Duration::from_secs(300),
            max_turns: 25,
            allowed_tools: vec!["Read".into(), "Grep".into()],
            stdout_cap: 1024,
        }
    }

    #[test]
    fn test_command_flags() {
        let runner = ClaudeCodeRunner::new(None);
        let cmd = runner.build_command(
            Path::new("/ws/task_1/prompt.txt"),
            Path::new("/ws/task_1"),
            &options(),
        );
        let std_cmd = cmd.as_std();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(std_cmd.get_program().to_string_lossy(), "claude");
        assert!(args.contains(&"-p".to_string()));
        assert!(args.iter().any(|a| a.contains("prompt.txt")));
        assert!(args.contains(&"--output-format".to_string()));
        assert!(args.contains(&"text".to_string()));
        assert!(args.contains(&"--model".to_string()));
        assert!(args.contains(&"--max-turns".to_string()));
        assert!(args.contains(&"Read,Grep".to_string()));
        assert_eq!(
            std_cmd.get_current_dir().unwrap(),
            Path::new("/ws/task_1")
        );
    }

    #[test]
    fn test_optional_flags_omitted() {
        let runner = ClaudeCodeRunner::new(Some("claude-custom".into()));
        let mut opts = options();
        opts.model = String::new();
        opts.allowed_tools.clear();
        let cmd = runner.build_command(Path::new("prompt.txt"), Path::new("."), &opts);
        let args: Vec<String> = cmd
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();
        assert!(!args.contains(&"--model".to_string()));
        assert!(!args.contains(&"--allowedTools".to_string()));
    }

    #[test]
    fn test_first_line() {
        assert_eq!(first_line("1.2.3 (build 4)\nextra"), "1.2.3 (build 4)");
        assert_eq!(first_line(""), "");
    }
}
