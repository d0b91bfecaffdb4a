//! The seam between the coordination core and a chat network.
//!
//! The core relies on nothing beyond at-least-once delivery and ordering
//! within a single channel.

use std::pin::Pin;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::envelope::Envelope;
use crate::errors::TransportError;

/// A message observed on a channel.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct InboundMessage {
    pub channel: String,
    pub sender: String,
    pub body: String,
    pub timestamp: DateTime<Utc>,
}

impl InboundMessage {
    pub fn new(channel: impl Into<String>, sender: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
            sender: sender.into(),
            body: body.into(),
            timestamp: Utc::now(),
        }
    }
}

pub type Subscription = Pin<Box<dyn Stream<Item = InboundMessage> + Send>>;

/// Channel-based send/receive bound to one identity on the chat network.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Identity this transport sends as.
    fn user_id(&self) -> &str;

    async fn join(&self, channel: &str) -> Result<(), TransportError>;

    async fn send(&self, channel: &str, body: &str) -> Result<(), TransportError>;

    /// Messages arriving on a joined channel, including our own.
    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError>;
}

/// Frame `envelope` and send it on `channel`.
pub async fn send_envelope(
    transport: &dyn Transport,
    channel: &str,
    envelope: &Envelope,
) -> Result<(), TransportError> {
    let body = envelope
        .encode()
        .map_err(|e| TransportError::SendFailed(e.to_string()))?;
    transport.send(channel, &body).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    struct RecordingTransport {
        sent: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        fn user_id(&self) -> &str {
            "orchestrator"
        }

        async fn join(&self, _channel: &str) -> Result<(), TransportError> {
            Ok(())
        }

        async fn send(&self, channel: &str, body: &str) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push((channel.into(), body.into()));
            Ok(())
        }

        fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
            Err(TransportError::NotJoined(channel.into()))
        }
    }

    #[tokio::test]
    async fn send_envelope_frames_body() {
        let transport = RecordingTransport {
            sent: Mutex::new(Vec::new()),
        };
        let env = Envelope::heartbeat("orchestrator");
        send_envelope(&transport, "#agents", &env).await.unwrap();

        let sent = transport.sent.lock().unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "#agents");
        let decoded = Envelope::decode(&sent[0].1).unwrap().unwrap();
        assert_eq!(decoded, env);
    }
}
