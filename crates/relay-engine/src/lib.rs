//! Coordination engine: agent registry, command parser, dispatcher and
//! session manager. Nothing here knows which chat network carries the
//! envelopes; everything goes through [`relay_core::transport::Transport`].

pub mod dispatcher;
pub mod error;
pub mod parser;
pub mod registry;
pub mod session;

#[cfg(test)]
mod testing;

pub use dispatcher::{DispatchResult, Dispatcher, PendingReply};
pub use error::{DispatchError, RegistryError, SessionError};
pub use parser::{is_valid_agent_id, CommandParser, ParseError};
pub use registry::{AgentRegistry, Registration, RegistryCounts};
pub use session::{
    FailureKind, Session, SessionConfig, SessionManager, SessionStatus, StepFailure, StepRecord,
};
