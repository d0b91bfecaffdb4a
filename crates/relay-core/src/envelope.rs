//! The wire envelope exchanged between the orchestrator and agents.
//!
//! Envelopes ride inside ordinary chat messages. A message body carrying an
//! envelope is framed as `@<to>: <json>`, with `*` as the broadcast target:
//!
//! ```text
//! @llm: {"id":"env_…","correlation_id":"corr_…","type":"request","from":"orchestrator",…}
//! @*: {"id":"env_…","type":"announce","from":"llm","capabilities":["summarize"],…}
//! ```
//!
//! Any body that does not have that shape is plain text and belongs to the
//! command parser instead.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::agent::AgentStatus;
use crate::errors::CodecError;
use crate::ids::{CorrelationId, EnvelopeId};

/// Target marker for envelopes addressed to everyone on the channel.
pub const BROADCAST: &str = "*";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvelopeKind {
    Announce,
    Heartbeat,
    Depart,
    Request,
    Response,
    Error,
}

impl EnvelopeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Announce => "announce",
            Self::Heartbeat => "heartbeat",
            Self::Depart => "depart",
            Self::Request => "request",
            Self::Response => "response",
            Self::Error => "error",
        }
    }

    /// Whether this kind answers an earlier request.
    pub fn is_reply(&self) -> bool {
        matches!(self, Self::Response | Self::Error)
    }
}

/// Immutable once built. Fields that only apply to some kinds are omitted
/// from the JSON when absent.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub id: EnvelopeId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<CorrelationId>,
    #[serde(rename = "type")]
    pub kind: EnvelopeKind,
    pub from: String,
    pub to: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub capabilities: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inbox: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<AgentStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(default)]
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Envelope {
    fn base(kind: EnvelopeKind, from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            id: EnvelopeId::new(),
            correlation_id: None,
            kind,
            from: from.into(),
            to: to.into(),
            capabilities: Vec::new(),
            display_name: None,
            inbox: None,
            status: None,
            command: None,
            payload: String::new(),
            timestamp: Utc::now(),
        }
    }

    /// Broadcast that an agent exists and what it can do.
    pub fn announce(
        from: impl Into<String>,
        display_name: impl Into<String>,
        capabilities: Vec<String>,
    ) -> Self {
        Self {
            capabilities,
            display_name: Some(display_name.into()),
            ..Self::base(EnvelopeKind::Announce, from, BROADCAST)
        }
    }

    pub fn heartbeat(from: impl Into<String>) -> Self {
        Self::base(EnvelopeKind::Heartbeat, from, BROADCAST)
    }

    pub fn depart(from: impl Into<String>) -> Self {
        Self::base(EnvelopeKind::Depart, from, BROADCAST)
    }

    pub fn request(
        from: impl Into<String>,
        to: impl Into<String>,
        correlation_id: CorrelationId,
        command: impl Into<String>,
        args: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            command: Some(command.into()),
            payload: args.into(),
            ..Self::base(EnvelopeKind::Request, from, to)
        }
    }

    pub fn response(
        from: impl Into<String>,
        to: impl Into<String>,
        correlation_id: CorrelationId,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            payload: payload.into(),
            ..Self::base(EnvelopeKind::Response, from, to)
        }
    }

    pub fn error(
        from: impl Into<String>,
        to: impl Into<String>,
        correlation_id: CorrelationId,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: Some(correlation_id),
            payload: reason.into(),
            ..Self::base(EnvelopeKind::Error, from, to)
        }
    }

    /// Build the response to this request, sent back to its author.
    pub fn reply(&self, from: impl Into<String>, payload: impl Into<String>) -> Option<Self> {
        let correlation_id = self.correlation_id.clone()?;
        Some(Self::response(from, self.from.clone(), correlation_id, payload))
    }

    /// Build the error reply to this request, sent back to its author.
    pub fn reply_error(&self, from: impl Into<String>, reason: impl Into<String>) -> Option<Self> {
        let correlation_id = self.correlation_id.clone()?;
        Some(Self::error(from, self.from.clone(), correlation_id, reason))
    }

    pub fn with_inbox(mut self, inbox: impl Into<String>) -> Self {
        self.inbox = Some(inbox.into());
        self
    }

    pub fn with_status(mut self, status: AgentStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn is_broadcast(&self) -> bool {
        self.to == BROADCAST
    }

    /// Whether an agent with `agent_id` should look at this envelope.
    pub fn is_for(&self, agent_id: &str) -> bool {
        self.is_broadcast() || self.to == agent_id
    }

    /// Check the per-kind required fields.
    pub fn validate(&self) -> Result<(), CodecError> {
        let kind = self.kind.as_str();
        match self.kind {
            EnvelopeKind::Request | EnvelopeKind::Response | EnvelopeKind::Error
                if self.correlation_id.is_none() =>
            {
                Err(CodecError::MissingField {
                    kind,
                    field: "correlation_id",
                })
            }
            EnvelopeKind::Request if self.command.is_none() => Err(CodecError::MissingField {
                kind,
                field: "command",
            }),
            _ if self.from.is_empty() => Err(CodecError::MissingField { kind, field: "from" }),
            _ => Ok(()),
        }
    }

    /// Frame this envelope as a chat message body.
    pub fn encode(&self) -> Result<String, CodecError> {
        let json = serde_json::to_string(self)?;
        Ok(format!("@{}: {}", self.to, json))
    }

    /// Parse a chat message body.
    ///
    /// Returns `Ok(None)` when the body is not an envelope frame at all, and
    /// an error when it is framed like one but cannot be decoded.
    pub fn decode(body: &str) -> Result<Option<Self>, CodecError> {
        let Some((target, json)) = split_frame(body) else {
            return Ok(None);
        };
        let envelope: Envelope = serde_json::from_str(json)?;
        if envelope.to != target {
            return Err(CodecError::TargetMismatch {
                frame: target.to_string(),
                envelope: envelope.to,
            });
        }
        envelope.validate()?;
        Ok(Some(envelope))
    }
}

/// Whether `body` is shaped like an envelope frame.
pub fn is_frame(body: &str) -> bool {
    split_frame(body).is_some()
}

fn split_frame(body: &str) -> Option<(&str, &str)> {
    let body = body.trim();
    let rest = body.strip_prefix('@')?;
    let sep = rest.find(": {")?;
    let target = &rest[..sep];
    if target.is_empty() || target.contains(char::is_whitespace) {
        return None;
    }
    Some((target, &rest[sep + 2..]))
}
