use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Liveness of a registered agent.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Online,
    Busy,
    Offline,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Online => "online",
            Self::Busy => "busy",
            Self::Offline => "offline",
        }
    }
}

/// An addressable worker known to the registry.
///
/// Agents are described only by the capabilities they declare. Nothing in the
/// coordinator depends on how an agent computes its answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub display_name: String,
    pub capabilities: BTreeSet<String>,
    pub status: AgentStatus,
    /// Channel the agent reads requests from. `None` means the coordination
    /// channel.
    pub inbox: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
}

impl Agent {
    pub fn new(id: impl Into<String>, now: DateTime<Utc>) -> Self {
        let id = id.into();
        Self {
            display_name: id.clone(),
            id,
            capabilities: BTreeSet::new(),
            status: AgentStatus::Online,
            inbox: None,
            first_seen: now,
            last_seen: now,
        }
    }

    /// Online or busy. Busy agents still receive requests; they answer late.
    pub fn is_reachable(&self) -> bool {
        self.status != AgentStatus::Offline
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_agent_is_online_and_named_by_id() {
        let now = Utc::now();
        let agent = Agent::new("llm", now);
        assert_eq!(agent.display_name, "llm");
        assert_eq!(agent.status, AgentStatus::Online);
        assert!(agent.is_reachable());
        assert_eq!(agent.first_seen, agent.last_seen);
    }

    #[test]
    fn offline_agent_is_unreachable() {
        let mut agent = Agent::new("llm", Utc::now());
        agent.status = AgentStatus::Busy;
        assert!(agent.is_reachable());
        agent.status = AgentStatus::Offline;
        assert!(!agent.is_reachable());
    }

    #[test]
    fn status_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&AgentStatus::Busy).unwrap(), "\"busy\"");
        assert_eq!(AgentStatus::Offline.as_str(), "offline");
    }
}
