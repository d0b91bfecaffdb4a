//! WebSocket client protocol: join, leave and send on hub channels.
//!
//! Client frames are tagged by `op`:
//!
//! ```text
//! {"op":"join","channel":"#agents"}
//! {"op":"send","channel":"#agents","body":"!orchestrator ask llm \"2+2\""}
//! {"op":"leave","channel":"#agents"}
//! ```
//!
//! Every message on a joined channel is forwarded as an
//! [`InboundMessage`](relay_core::transport::InboundMessage) JSON object.
//! Rejected frames are answered with `{"error": "..."}`.

use std::collections::HashMap;
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use relay_core::transport::Transport;

use crate::client::Client;
use crate::hub::HubTransport;

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Join { channel: String },
    Leave { channel: String },
    Send { channel: String, body: String },
}

/// One connected user's view of the hub.
pub struct GatewaySession {
    transport: HubTransport,
    client: Arc<Client>,
    forwards: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl GatewaySession {
    pub fn new(transport: HubTransport, client: Arc<Client>) -> Self {
        Self {
            transport,
            client,
            forwards: Mutex::new(HashMap::new()),
        }
    }

    /// Apply one client frame. Returns an error frame to send back, if any.
    pub async fn handle_frame(&self, raw: &str) -> Option<String> {
        let frame: ClientFrame = match serde_json::from_str(raw) {
            Ok(frame) => frame,
            Err(e) => return Some(error_frame(&format!("invalid frame: {e}"))),
        };

        let result = match frame {
            ClientFrame::Join { channel } => self.join(&channel).await,
            ClientFrame::Leave { channel } => {
                self.leave(&channel);
                Ok(())
            }
            ClientFrame::Send { channel, body } => self
                .transport
                .send(&channel, &body)
                .await
                .map_err(|e| e.to_string()),
        };
        result.err().map(|e| error_frame(&e))
    }

    async fn join(&self, channel: &str) -> Result<(), String> {
        if self.forwards.lock().contains_key(channel) {
            return Ok(());
        }
        self.transport.join(channel).await.map_err(|e| e.to_string())?;
        let mut stream = self.transport.subscribe(channel).map_err(|e| e.to_string())?;

        let client = Arc::clone(&self.client);
        let handle = tokio::spawn(async move {
            while let Some(message) = stream.next().await {
                match serde_json::to_string(&message) {
                    Ok(json) => {
                        let _ = client.send(json);
                    }
                    Err(e) => warn!(client_id = %client.id, error = %e, "failed to encode message"),
                }
            }
        });
        let _ = self.forwards.lock().insert(channel.to_string(), handle);
        debug!(client_id = %self.client.id, channel, "client joined channel");
        Ok(())
    }

    fn leave(&self, channel: &str) {
        if let Some(handle) = self.forwards.lock().remove(channel) {
            handle.abort();
        }
        let _ = self.transport.leave(channel);
    }

    /// Stop forwarding every joined channel.
    pub fn close(&self) {
        for (_, handle) in self.forwards.lock().drain() {
            handle.abort();
        }
    }
}

impl Drop for GatewaySession {
    fn drop(&mut self) {
        self.close();
    }
}

fn error_frame(message: &str) -> String {
    serde_json::json!({ "error": message }).to_string()
}
