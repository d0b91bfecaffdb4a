//! Request/response correlation over a transport with no native call/return.
//!
//! Every request gets a fresh [`CorrelationId`] and one entry in the wait
//! table. The inbound pump hands `response`/`error` envelopes to
//! [`Dispatcher::resolve`], which completes the matching entry exactly once.
//! Entries leave the table on resolution, deadline expiry, send failure or
//! [`Dispatcher::forget`]; anything arriving afterwards is dropped.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, warn};

use relay_core::envelope::{Envelope, EnvelopeKind};
use relay_core::ids::CorrelationId;
use relay_core::transport::{send_envelope, Transport};

use crate::error::DispatchError;
use crate::registry::AgentRegistry;

/// Final result of one dispatched request.
pub type DispatchResult = Result<String, DispatchError>;

struct Waiter {
    agent_id: String,
    tx: oneshot::Sender<DispatchResult>,
}

type WaitTable = Arc<DashMap<CorrelationId, Waiter>>;

/// Awaitable handle for one outstanding request.
pub struct PendingReply {
    correlation_id: CorrelationId,
    state: PendingState,
}

enum PendingState {
    Ready(DispatchResult),
    Waiting {
        rx: oneshot::Receiver<DispatchResult>,
        deadline: Instant,
        timeout: Duration,
        table: WaitTable,
    },
}

impl PendingReply {
    fn ready(correlation_id: CorrelationId, result: DispatchResult) -> Self {
        Self {
            correlation_id,
            state: PendingState::Ready(result),
        }
    }

    pub fn correlation_id(&self) -> &CorrelationId {
        &self.correlation_id
    }

    /// Resolve to the reply, the agent's error, or `Timeout` at the deadline.
    pub async fn wait(self) -> DispatchResult {
        match self.state {
            PendingState::Ready(result) => result,
            PendingState::Waiting {
                rx,
                deadline,
                timeout,
                table,
            } => match tokio::time::timeout_at(deadline, rx).await {
                Ok(Ok(result)) => result,
                // Sender dropped: the entry was forgotten.
                Ok(Err(_)) => Err(DispatchError::AgentError("request cancelled".into())),
                Err(_) => {
                    let _ = table.remove(&self.correlation_id);
                    debug!(correlation_id = %self.correlation_id, "request timed out");
                    Err(DispatchError::Timeout(timeout))
                }
            },
        }
    }
}

pub struct Dispatcher {
    transport: Arc<dyn Transport>,
    registry: Arc<AgentRegistry>,
    /// Sender id stamped on outgoing requests.
    from: String,
    /// Where requests go when the agent declared no inbox.
    default_channel: String,
    waiters: WaitTable,
}

impl Dispatcher {
    pub fn new(
        transport: Arc<dyn Transport>,
        registry: Arc<AgentRegistry>,
        from: impl Into<String>,
        default_channel: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            registry,
            from: from.into(),
            default_channel: default_channel.into(),
            waiters: Arc::new(DashMap::new()),
        }
    }

    /// Send `command`/`args` to `agent_id` and return a handle that resolves
    /// within `timeout`.
    ///
    /// Agents the registry does not consider reachable resolve immediately to
    /// `Unavailable` without touching the transport.
    pub async fn send(
        &self,
        agent_id: &str,
        command: &str,
        args: &str,
        timeout: Duration,
    ) -> (CorrelationId, PendingReply) {
        let correlation_id = CorrelationId::new();

        let agent = match self.registry.lookup(agent_id) {
            Ok(agent) if agent.is_reachable() => agent,
            Ok(_) => {
                debug!(agent_id, "agent offline, not dispatching");
                return (
                    correlation_id.clone(),
                    PendingReply::ready(
                        correlation_id,
                        Err(DispatchError::Unavailable(agent_id.to_string())),
                    ),
                );
            }
            Err(e) => {
                debug!(agent_id, error = %e, "agent unknown, not dispatching");
                return (
                    correlation_id.clone(),
                    PendingReply::ready(
                        correlation_id,
                        Err(DispatchError::Unavailable(agent_id.to_string())),
                    ),
                );
            }
        };

        let channel = agent.inbox.as_deref().unwrap_or(&self.default_channel);
        let envelope = Envelope::request(&self.from, agent_id, correlation_id.clone(), command, args);

        let (tx, rx) = oneshot::channel();
        let deadline = Instant::now() + timeout;
        let _ = self.waiters.insert(
            correlation_id.clone(),
            Waiter {
                agent_id: agent_id.to_string(),
                tx,
            },
        );

        if let Err(e) = send_envelope(self.transport.as_ref(), channel, &envelope).await {
            let _ = self.waiters.remove(&correlation_id);
            warn!(agent_id, %correlation_id, error = %e, "request send failed");
            return (
                correlation_id.clone(),
                PendingReply::ready(correlation_id, Err(e.into())),
            );
        }

        debug!(agent_id, command, %correlation_id, channel, "request dispatched");
        (
            correlation_id.clone(),
            PendingReply {
                correlation_id,
                state: PendingState::Waiting {
                    rx,
                    deadline,
                    timeout,
                    table: self.waiters.clone(),
                },
            },
        )
    }

    /// Complete the request a `response`/`error` envelope answers. Returns
    /// whether a waiter was resolved. Unknown, already-resolved and
    /// wrong-sender replies are dropped.
    pub fn resolve(&self, envelope: &Envelope) -> bool {
        if !envelope.kind.is_reply() {
            return false;
        }
        let Some(correlation_id) = envelope.correlation_id.as_ref() else {
            return false;
        };

        let Some((_, waiter)) = self
            .waiters
            .remove_if(correlation_id, |_, w| w.agent_id == envelope.from)
        else {
            if self.waiters.contains_key(correlation_id) {
                warn!(
                    %correlation_id,
                    from = %envelope.from,
                    "reply from unexpected sender, dropping"
                );
            } else {
                debug!(%correlation_id, "reply for unknown or resolved request, dropping");
            }
            return false;
        };

        let result = match envelope.kind {
            EnvelopeKind::Response => Ok(envelope.payload.clone()),
            _ => Err(DispatchError::AgentError(envelope.payload.clone())),
        };
        // The waiter may have just timed out; nothing to do then.
        let _ = waiter.tx.send(result);
        true
    }

    /// Drop the wait-table entry so a late reply is discarded.
    pub fn forget(&self, correlation_id: &CorrelationId) -> bool {
        self.waiters.remove(correlation_id).is_some()
    }

    /// Outstanding requests.
    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}
