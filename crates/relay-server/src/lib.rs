//! Network side of relay: the in-process channel hub, the WebSocket gateway
//! that lets people and agents join it, and the orchestrator that sits on
//! the coordination channel.

pub mod client;
pub mod error;
pub mod format;
pub mod gateway;
pub mod hub;
pub mod orchestrator;
pub mod server;

pub use error::ServerError;
pub use hub::{ChannelHub, HubTransport};
pub use orchestrator::{HealthReport, Orchestrator, OrchestratorConfig, OrchestratorHandle};
pub use server::{start, ServerConfig, ServerHandle};
