//! Shared types for the relay coordination core: identifiers, the wire
//! envelope and its chat framing, the agent model, parsed command shapes, and
//! the transport seam the orchestrator talks through.

pub mod agent;
pub mod command;
pub mod envelope;
pub mod errors;
pub mod ids;
pub mod transport;

pub use agent::{Agent, AgentStatus};
pub use command::{AdminCommand, Chain, Invocation, ParsedCommand, StepTemplate};
pub use envelope::{Envelope, EnvelopeKind, BROADCAST};
pub use errors::{CodecError, TransportError};
pub use ids::{CorrelationId, EnvelopeId, SessionId};
pub use transport::{InboundMessage, Subscription, Transport};
