//! Codex Adapter
//!
//! Invokes `codex exec` in full-auto mode. Codex insists on a git repository
//! as its working directory, so the workspace is initialized as one on first
//! use.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::services::agents::claude_code::first_line;
use crate::services::agents::process::{run_captured, ProcessFailure};
use crate::services::agents::runner::{
    failure_from_process, AgentOptions, AgentProbe, AgentRun, AgentRunner,
};
use crate::utils::error::StageError;

#[derive(Debug)]
pub struct CodexRunner {
    binary: String,
}

impl CodexRunner {
    pub fn new(binary: Option<String>) -> Self {
        Self {
            binary: binary.unwrap_or_else(|| "codex".to_string()),
        }
    }

    fn build_command(&self, prompt_file: &Path, workspace: &Path, options: &AgentOptions) -> Command {
        let prompt_name = prompt_file
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "prompt.txt".to_string());

        let mut cmd = Command::new(&self.binary);
        cmd.current_dir(workspace)
            .arg("exec")
            .arg("--full-auto")
            .arg(format!(
                "Read the file {} and follow all instructions in it.",
                prompt_name
            ));
        if !options.model.is_empty() {
            cmd.arg("--model").arg(&options.model);
        }
        cmd
    }

    async fn ensure_git_repo(&self, workspace: &Path) {
        if workspace.join(".git").exists() {
            return;
        }
        let mut cmd = Command::new("git");
        cmd.current_dir(workspace).arg("init").arg("-q");
        let _ = run_captured(
            cmd,
            Duration::from_secs(20),
            4096,
            &CancellationToken::new(),
        )
        .await;
    }
}

#[async_trait]
impl AgentRunner for CodexRunner {
    fn name(&self) -> &str {
        "codex"
    }

    async fn run(
        &self,
        prompt_file: &Path,
        workspace: &Path,
        options: &AgentOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, StageError> {
        self.ensure_git_repo(workspace).await;

        let cmd = self.build_command(prompt_file, workspace, options);
        tracing::info!(
            workspace = %workspace.display(),
            timeout_secs = options.timeout.as_secs(),
            "running codex"
        );

        let output = run_captured(cmd, options.timeout, options.stdout_cap, cancel)
            .await
            .map_err(|f| failure_from_process(self.name(), f, options.timeout))?;

        if output.exit_code != Some(0) {
            tracing::warn!(
                exit_code = ?output.exit_code,
                stderr = %output.stderr_tail(5),
                "codex exited nonzero"
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_shape() {
        let runner = CodexRunner::new(None);
        let options = AgentOptions {
            model: "o4-mini".into(),
            timeout: Duration::from_secs(120),
            max_turns: 10,
            allowed_tools: vec![],
            stdout_cap: 1024,
        };
        let cmd = runner.build_command(Path::new("prompt.txt"), Path::new("/ws"), &options);
        let std_cmd = cmd.as_std();
        let args: Vec<String> = std_cmd
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(std_cmd.get_program().to_string_lossy(), "codex");
        assert_eq!(args[0], "exec");
        assert_eq!(args[1], "--full-auto");
        assert!(args[2].contains("prompt.txt"));
        assert!(args.contains(&"--model".to_string()));
    }

    #[tokio::test]
    async fn test_ensure_git_repo_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let runner = CodexRunner::new(None);
        runner.ensure_git_repo(dir.path()).await;
        runner.ensure_git_repo(dir.path()).await;
        // Either git is present and a repo exists, or git is absent and the
        // call was a harmless no-op
        if dir.path().join(".git").exists() {
            assert!(dir.path().join(".git").is_dir());
        }
    }
}
