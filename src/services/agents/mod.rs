//! Agent runners: the uniform subprocess contract, per-provider adapters,
//! prompt assembly, and result parsing.

pub mod claude_code;
pub mod codex;
pub mod parser;
pub mod process;
pub mod prompt;
pub mod runner;

use std::sync::Arc;

use crate::storage::config::{AgentsConfig, LimitsConfig};
use claude_code::ClaudeCodeRunner;
use codex::CodexRunner;
use runner::{AgentRegistry, AgentRunner};

pub use runner::{AgentOptions, AgentProbe, AgentRun};

/// Build the registry with the built-in provider adapters. Providers with a
/// configured `binary` use it; otherwise each adapter's conventional binary
/// name is used.
pub fn build_registry(agents: &AgentsConfig, limits: &LimitsConfig) -> AgentRegistry {
    let mut runners: Vec<Arc<dyn AgentRunner>> = Vec::new();

    let claude_binary = agents
        .providers
        .get("claude_code")
        .and_then(|p| p.binary.clone());
    runners.push(Arc::new(ClaudeCodeRunner::new(claude_binary)));

    let codex_binary = agents.providers.get("codex").and_then(|p| p.binary.clone());
    runners.push(Arc::new(CodexRunner::new(codex_binary)));

    AgentRegistry::new(runners, agents.clone(), limits.stdout_cap_bytes)
}
