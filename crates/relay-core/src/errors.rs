/// Failure to turn a chat message body into an [`Envelope`](crate::Envelope)
/// or back.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("malformed envelope json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame addressed to {frame} but envelope says {envelope}")]
    TargetMismatch { frame: String, envelope: String },

    #[error("{kind} envelope is missing {field}")]
    MissingField { kind: &'static str, field: &'static str },
}

/// Failure reported by a transport adapter. The chat transport offers no
/// finer-grained signal than this.
#[derive(Clone, Debug, thiserror::Error)]
pub enum TransportError {
    #[error("channel not joined: {0}")]
    NotJoined(String),

    #[error("send failed: {0}")]
    SendFailed(String),

    #[error("transport closed")]
    Closed,
}

impl TransportError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::NotJoined(_) => "not_joined",
            Self::SendFailed(_) => "send_failed",
            Self::Closed => "closed",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codec_error_messages() {
        let err = CodecError::TargetMismatch {
            frame: "llm".into(),
            envelope: "search".into(),
        };
        assert_eq!(err.to_string(), "frame addressed to llm but envelope says search");

        let err = CodecError::MissingField {
            kind: "response",
            field: "correlation_id",
        };
        assert_eq!(err.to_string(), "response envelope is missing correlation_id");
    }

    #[test]
    fn json_error_converts() {
        let json_err = serde_json::from_str::<serde_json::Value>("{bad").unwrap_err();
        let err: CodecError = json_err.into();
        assert!(matches!(err, CodecError::Json(_)));
    }

    #[test]
    fn transport_error_kinds() {
        assert_eq!(TransportError::Closed.error_kind(), "closed");
        assert_eq!(TransportError::NotJoined("#a".into()).error_kind(), "not_joined");
        assert_eq!(TransportError::SendFailed("x".into()).error_kind(), "send_failed");
    }
}
