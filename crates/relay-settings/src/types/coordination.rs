//! Orchestrator identity, registry liveness, and session execution settings.

use serde::{Deserialize, Serialize};

/// Who the orchestrator is and where it listens.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OrchestratorSettings {
    /// Identity on the chat network; also the `@mention` users can address.
    pub id: String,
    pub display_name: String,
    /// Text prefix that marks a line as an orchestrator command.
    pub command_prefix: String,
    /// Channel where agents announce themselves and users issue commands.
    pub coordination_channel: String,
    /// Capabilities announced for the orchestrator itself.
    pub capabilities: Vec<String>,
}

impl Default for OrchestratorSettings {
    fn default() -> Self {
        Self {
            id: "orchestrator".to_string(),
            display_name: "Orchestrator".to_string(),
            command_prefix: "!orchestrator".to_string(),
            coordination_channel: "#agents".to_string(),
            capabilities: vec![
                "agent_discovery".to_string(),
                "message_routing".to_string(),
                "workflow_coordination".to_string(),
                "system_monitoring".to_string(),
            ],
        }
    }
}

/// Agent liveness tracking.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RegistrySettings {
    /// Expected interval between agent heartbeats. The sweep runs at half this.
    pub heartbeat_interval_ms: u64,
    /// Silence after which an agent is marked offline.
    pub agent_ttl_ms: u64,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            heartbeat_interval_ms: 60_000,
            agent_ttl_ms: 300_000,
        }
    }
}

/// Upper bound on `session.maxRetries`.
pub const MAX_RETRIES_LIMIT: u32 = 10;

/// Per-step deadlines and retry budget for sessions.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SessionSettings {
    pub step_timeout_ms: u64,
    /// Extra attempts per step after the first one fails.
    pub max_retries: u32,
    /// Backoff before the first retry; doubles per attempt.
    pub retry_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Jitter as a fraction of the backoff (0.0 disables).
    pub jitter_factor: f64,
    /// Finished sessions kept for `status`/`sessions`.
    pub history_limit: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            step_timeout_ms: 30_000,
            max_retries: 1,
            retry_backoff_ms: 500,
            max_backoff_ms: 5_000,
            jitter_factor: 0.2,
            history_limit: 50,
        }
    }
}
