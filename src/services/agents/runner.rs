//! Agent Runner Contract
//!
//! A uniform capability over subprocess LLM CLIs. Each provider adapter
//! knows how to invoke its binary; selection and fallback order live in the
//! registry so the pipeline only ever sees "the runner that will handle this
//! task".

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::services::agents::process::ProcessFailure;
use crate::storage::config::{AgentsConfig, ProviderConfig};
use crate::utils::error::{FailureKind, StageError};

/// Per-run options resolved from configuration.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    pub model: String,
    pub timeout: Duration,
    pub max_turns: u32,
    pub allowed_tools: Vec<String>,
    pub stdout_cap: usize,
}

/// What a completed agent run produced.
#[derive(Debug)]
pub struct AgentRun {
    /// Captured stdout (the transcript), truncated with a marker on overflow
    pub transcript: String,
    /// Last lines of stderr, kept for crash diagnostics
    pub stderr_tail: String,
    pub exit_code: Option<i32>,
    pub duration: Duration,
}

/// Readiness probe result.
#[derive(Debug, Clone)]
pub struct AgentProbe {
    pub available: bool,
    /// Version string when available, error description otherwise
    pub detail: String,
}

/// The uniform contract every provider adapter implements.
#[async_trait]
pub trait AgentRunner: Send + Sync + std::fmt::Debug {
    /// Stable provider name ("claude_code", "codex", …)
    fn name(&self) -> &str;

    /// Run one analysis. The process is spawned with `workspace` as its
    /// working directory; the prompt has already been written to
    /// `prompt_file` inside it.
    async fn run(
        &self,
        prompt_file: &Path,
        workspace: &Path,
        options: &AgentOptions,
        cancel: &CancellationToken,
    ) -> Result<AgentRun, StageError>;

    /// Probe the CLI binary (`--version` under a short deadline).
    async fn available(&self) -> AgentProbe;
}

/// Map a process failure onto the task failure taxonomy.
pub fn failure_from_process(provider: &str, failure: ProcessFailure, timeout: Duration) -> StageError {
    match failure {
        ProcessFailure::Timeout => StageError::new(
            FailureKind::AgentTimeout,
            format!("{} exceeded the {}s deadline", provider, timeout.as_secs()),
        ),
        ProcessFailure::Cancelled => StageError::new(FailureKind::Cancelled, "task cancelled"),
        ProcessFailure::Spawn(msg) => StageError::new(
            FailureKind::AgentUnavailable,
            format!("{} cannot start: {}", provider, msg),
        ),
    }
}

/// The provider registry: adapters plus selection policy. Selection config
/// is swappable at runtime; a task picks its provider once, at its own
/// boundary, so in-flight runs are unaffected by updates.
pub struct AgentRegistry {
    runners: BTreeMap<String, Arc<dyn AgentRunner>>,
    config: std::sync::RwLock<AgentsConfig>,
    stdout_cap: usize,
}

impl AgentRegistry {
    pub fn new(
        runners: Vec<Arc<dyn AgentRunner>>,
        config: AgentsConfig,
        stdout_cap: usize,
    ) -> Self {
        let runners = runners
            .into_iter()
            .map(|r| (r.name().to_string(), r))
            .collect();
        Self {
            runners,
            config: std::sync::RwLock::new(config),
            stdout_cap,
        }
    }

    /// Replace the selection config (settings API); observed by the next
    /// pick, never mid-run.
    pub fn update_config(&self, config: AgentsConfig) {
        *self.config.write().expect("agent config lock poisoned") = config;
    }

    fn config_snapshot(&self) -> AgentsConfig {
        self.config.read().expect("agent config lock poisoned").clone()
    }

    /// Per-provider run options from the layered configuration.
    fn options_for(&self, config: &AgentsConfig, provider: &ProviderConfig) -> AgentOptions {
        AgentOptions {
            model: provider.model.clone(),
            timeout: Duration::from_secs(provider.timeout_secs.unwrap_or(config.timeout_secs)),
            max_turns: provider.max_turns.unwrap_or(config.max_turns),
            allowed_tools: provider.allowed_tools.clone(),
            stdout_cap: self.stdout_cap,
        }
    }

    /// Candidate provider names in selection order: the task's requested
    /// override, the per-rule route, the global default, then every other
    /// enabled provider in deterministic (sorted) order.
    fn candidates(&self, config: &AgentsConfig, requested: Option<&str>, rule_id: &str) -> Vec<String> {
        let mut ordered: Vec<String> = Vec::new();
        let mut push = |name: &str, ordered: &mut Vec<String>| {
            if !name.is_empty() && !ordered.iter().any(|n| n == name) {
                ordered.push(name.to_string());
            }
        };

        if let Some(name) = requested {
            push(name, &mut ordered);
        }
        if let Some(name) = config.routing.get(rule_id) {
            push(name, &mut ordered);
        }
        push(&config.default, &mut ordered);
        for name in self.runners.keys() {
            push(name, &mut ordered);
        }
        ordered
    }

    /// Pick the runner for a task: first candidate that is configured,
    /// enabled, and whose binary answers the readiness probe. Records which
    /// provider was effectively chosen via the returned runner's name.
    pub async fn pick(
        &self,
        requested: Option<&str>,
        rule_id: &str,
    ) -> Result<(Arc<dyn AgentRunner>, AgentOptions), StageError> {
        let config = self.config_snapshot();
        let mut tried = Vec::new();

        for name in self.candidates(&config, requested, rule_id) {
            let Some(provider) = config.providers.get(&name) else {
                tried.push(format!("{} (not configured)", name));
                continue;
            };
            if !provider.enabled {
                tried.push(format!("{} (disabled)", name));
                continue;
            }
            let Some(runner) = self.runners.get(&name) else {
                tried.push(format!("{} (no adapter)", name));
                continue;
            };
            let probe = runner.available().await;
            if !probe.available {
                tracing::warn!(provider = %name, detail = %probe.detail, "agent unavailable, trying next");
                tried.push(format!("{} ({})", name, probe.detail));
                continue;
            }
            return Ok((runner.clone(), self.options_for(&config, provider)));
        }

        Err(StageError::new(
            FailureKind::AgentUnavailable,
            format!("no enabled agent available; tried: {}", tried.join(", ")),
        ))
    }

    /// Probe every configured provider, for the health endpoint.
    pub async fn probe_all(&self) -> BTreeMap<String, AgentProbe> {
        let config = self.config_snapshot();
        let mut probes = BTreeMap::new();
        for (name, runner) in &self.runners {
            let enabled = config
                .providers
                .get(name)
                .map(|p| p.enabled)
                .unwrap_or(false);
            let probe = if enabled {
                runner.available().await
            } else {
                AgentProbe {
                    available: false,
                    detail: "disabled".to_string(),
                }
            };
            probes.insert(name.clone(), probe);
        }
        probes
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("providers", &self.runners.keys().collect::<Vec<_>>())
            .field("default", &self.config_snapshot().default)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;

    /// Scriptable runner for tests: fixed availability and a canned outcome.
    #[derive(Debug)]
    pub struct MockRunner {
        pub name: String,
        pub available: bool,
        pub transcript: String,
    }

    #[async_trait]
    impl AgentRunner for MockRunner {
        fn name(&self) -> &str {
            &self.name
        }

        async fn run(
            &self,
            _prompt_file: &Path,
            _workspace: &Path,
            _options: &AgentOptions,
            cancel: &CancellationToken,
        ) -> Result<AgentRun, StageError> {
            if cancel.is_cancelled() {
                return Err(StageError::new(FailureKind::Cancelled, "task cancelled"));
            }
            Ok(AgentRun {
                transcript: self.transcript.clone(),
                stderr_tail: String::new(),
                exit_code: Some(0),
                duration: Duration::from_millis(5),
            })
        }

        async fn available(&self) -> AgentProbe {
            AgentProbe {
                available: self.available,
                detail: if self.available {
                    "mock 1.0.0".to_string()
                } else {
                    "not installed".to_string()
                },
            }
        }
    }
}
