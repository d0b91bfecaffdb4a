//! Test doubles shared by the engine's unit tests.

use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use relay_core::envelope::Envelope;
use relay_core::errors::TransportError;
use relay_core::transport::{Subscription, Transport};

pub(crate) fn announce(id: &str, caps: &[&str]) -> Envelope {
    Envelope::announce(id, id, caps.iter().map(|c| c.to_string()).collect())
}

/// Records every send and republishes decoded envelopes to watchers.
pub(crate) struct RecordingTransport {
    user_id: String,
    sent: Mutex<Vec<(String, String)>>,
    fail: AtomicBool,
    outbox: broadcast::Sender<Envelope>,
}

impl RecordingTransport {
    pub(crate) fn new(user_id: &str) -> Self {
        let (outbox, _) = broadcast::channel(64);
        Self {
            user_id: user_id.to_string(),
            sent: Mutex::new(Vec::new()),
            fail: AtomicBool::new(false),
            outbox,
        }
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub(crate) fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }

    pub(crate) fn last_envelope(&self) -> Option<Envelope> {
        let sent = self.sent.lock();
        let (_, body) = sent.last()?;
        Envelope::decode(body).ok().flatten()
    }

    /// Envelopes sent from now on.
    pub(crate) fn watch(&self) -> broadcast::Receiver<Envelope> {
        self.outbox.subscribe()
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn user_id(&self) -> &str {
        &self.user_id
    }

    async fn join(&self, _channel: &str) -> Result<(), TransportError> {
        Ok(())
    }

    async fn send(&self, channel: &str, body: &str) -> Result<(), TransportError> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(TransportError::SendFailed("scripted failure".into()));
        }
        self.sent.lock().push((channel.to_string(), body.to_string()));
        if let Ok(Some(envelope)) = Envelope::decode(body) {
            let _ = self.outbox.send(envelope);
        }
        Ok(())
    }

    fn subscribe(&self, channel: &str) -> Result<Subscription, TransportError> {
        Err(TransportError::NotJoined(channel.to_string()))
    }
}
