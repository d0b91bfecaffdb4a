//! In-process chat network: named channels fanned out over broadcast queues.
//!
//! The orchestrator, WebSocket clients and tests all see the same channels
//! through [`HubTransport`], one per identity.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;
use tracing::{debug, warn};

use relay_core::errors::TransportError;
use relay_core::transport::{InboundMessage, Subscription, Transport};

pub struct ChannelHub {
    channels: DashMap<String, broadcast::Sender<InboundMessage>>,
    capacity: usize,
}

impl ChannelHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<InboundMessage> {
        self.channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(self.capacity).0)
            .clone()
    }

    /// Deliver `body` to every current subscriber of `channel`. Returns the
    /// number of subscribers reached.
    pub fn publish(&self, channel: &str, sender: &str, body: &str) -> usize {
        let message = InboundMessage::new(channel, sender, body);
        self.sender(channel).send(message).unwrap_or(0)
    }

    pub fn subscribe(&self, channel: &str) -> broadcast::Receiver<InboundMessage> {
        self.sender(channel).subscribe()
    }

    /// Channel names, sorted.
    pub fn channels(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// A transport bound to `user_id`.
    pub fn connect(self: &Arc<Self>, user_id: impl Into<String>) -> HubTransport {
        HubTransport {
            hub: Arc::clone(self),
            user_id: user_id.into(),
            joined: Mutex::new(HashSet::new()),
        }
    }
}

pub struct HubTransport {
    hub: Arc<ChannelHub>,
    user_id: String,
    joined: Mutex<HashSet<String>>,
}

impl HubTransport {
    pub fn leave(&self, channel: &str) -> bool {
        self.joined.lock().remove(channel)
    }

    pub fn is_joined(&self, channel: &str) -> bool {
        self.joined.lock().contains(channel)
    }

    fn require_joined(&self, channel: &str) -> Result<(), TransportError> {
        if self.is_joined(channel) {
            Ok(())
        } else {
            Err(TransportError::NotJoined(channel.to_string()))
        }
    }
}

#[async_trait]
impl Transport for HubTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn join(&self, channel: &str) -> Result<(), TransportError> {
        if self.joined.lock().insert(channel.to_string()) {
            debug!(user_id = %self.user_id, channel, "joined channel");
        }
        Ok(())
    }

    async fn send(&self, channel: &str, body: &str) -> Result<(), TransportError> {
        self.require_joined(channel)?;
        let _ = self.hub.publish(channel, &self.user_id, body);
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        self.require_joined(channel)?;
        let user_id = self.user_id.clone();
        let stream = BroadcastStream::new(self.hub.subscribe(channel)).filter_map(move |item| match item {
            Ok(message) => Some(message),
            Err(BroadcastStreamRecvError::Lagged(n)) => {
                warn!(user_id = %user_id, skipped = n, "subscriber lagged, dropped messages");
                None
            }
        });
        Ok(Box::pin(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn members_see_each_others_messages() {
        let hub = Arc::new(ChannelHub::new(16));
        let alice = hub.connect("alice");
        let bob = hub.connect("bob");
        alice.join("#agents").await.unwrap();
        bob.join("#agents").await.unwrap();

        let mut stream = bob.subscribe("#agents").unwrap();
        alice.send("#agents", "hello").await.unwrap();

        let msg = stream.next().await.unwrap();
        assert_eq!(msg.channel, "#agents");
        assert_eq!(msg.sender, "alice");
        assert_eq!(msg.body, "hello");
    }

    #[tokio::test]
    async fn subscribers_see_their_own_messages() {
        let hub = Arc::new(ChannelHub::new(16));
        let alice = hub.connect("alice");
        alice.join("#agents").await.unwrap();
        let mut stream = alice.subscribe("#agents").unwrap();

        alice.send("#agents", "echo").await.unwrap();
        assert_eq!(stream.next().await.unwrap().sender, "alice");
    }

    #[tokio::test]
    async fn send_requires_join() {
        let hub = Arc::new(ChannelHub::new(16));
        let alice = hub.connect("alice");
        let err = alice.send("#agents", "hi").await.unwrap_err();
        assert!(matches!(err, TransportError::NotJoined(c) if c == "#agents"));
        assert!(alice.subscribe("#agents").is_err());

        alice.join("#agents").await.unwrap();
        assert!(alice.leave("#agents"));
        assert!(alice.send("#agents", "hi").await.is_err());
    }

    #[tokio::test]
    async fn channels_are_isolated() {
        let hub = Arc::new(ChannelHub::new(16));
        let alice = hub.connect("alice");
        alice.join("#a").await.unwrap();
        alice.join("#b").await.unwrap();

        let mut a = alice.subscribe("#a").unwrap();
        alice.send("#b", "for b").await.unwrap();
        alice.send("#a", "for a").await.unwrap();

        assert_eq!(a.next().await.unwrap().body, "for a");
        assert_eq!(hub.channels(), vec!["#a".to_string(), "#b".to_string()]);
    }

    #[test]
    fn publish_without_subscribers_reaches_nobody() {
        let hub = ChannelHub::new(16);
        assert_eq!(hub.publish("#empty", "alice", "anyone?"), 0);
    }
}
