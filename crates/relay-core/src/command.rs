//! Structured forms of the commands users type into the coordination channel.

use serde::{Deserialize, Serialize};

use crate::ids::SessionId;

/// Command name sent with a single `ask`.
pub const ASK_COMMAND: &str = "ask";
/// Command name sent with every step of a chain.
pub const CHAIN_STEP_COMMAND: &str = "process";

/// One resolved call to one agent.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Invocation {
    pub agent_id: String,
    pub command: String,
    pub args: String,
}

/// A step whose arguments are not known until the step runs.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepTemplate {
    pub agent_id: String,
    pub command: String,
}

/// An ordered sequence of calls. Step 0 receives `seed`; every later step
/// receives the previous step's result, synthesized at run time.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chain {
    pub steps: Vec<StepTemplate>,
    pub seed: String,
}

impl Chain {
    pub fn new(agent_ids: impl IntoIterator<Item = impl Into<String>>, seed: impl Into<String>) -> Self {
        Self {
            steps: agent_ids
                .into_iter()
                .map(|agent_id| StepTemplate {
                    agent_id: agent_id.into(),
                    command: CHAIN_STEP_COMMAND.to_string(),
                })
                .collect(),
            seed: seed.into(),
        }
    }

    pub fn agent_ids(&self) -> impl Iterator<Item = &str> {
        self.steps.iter().map(|s| s.agent_id.as_str())
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }
}

impl From<Invocation> for Chain {
    /// A single call is a one-step chain seeded with its own arguments.
    fn from(inv: Invocation) -> Self {
        Self {
            steps: vec![StepTemplate {
                agent_id: inv.agent_id,
                command: inv.command,
            }],
            seed: inv.args,
        }
    }
}

/// Commands answered locally by the orchestrator, without agent dispatch.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AdminCommand {
    Help,
    Status,
    Agents,
    Capabilities,
    Sessions,
    Cancel(SessionId),
}

/// Result of parsing one command line.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ParsedCommand {
    Admin(AdminCommand),
    Ask(Invocation),
    Chain(Chain),
}

impl ParsedCommand {
    /// Agents the command would dispatch to, in order.
    pub fn agent_ids(&self) -> Vec<&str> {
        match self {
            Self::Admin(_) => Vec::new(),
            Self::Ask(inv) => vec![inv.agent_id.as_str()],
            Self::Chain(chain) => chain.agent_ids().collect(),
        }
    }
}
