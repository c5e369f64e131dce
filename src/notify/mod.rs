//! Notification fan-out to every live delivery sink.
//!
//! Best-effort broadcast: a failing sink is dropped from the list so one
//! dead client cannot block the others. No retries, no ordering guarantee.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// One broadcast target (an open WebSocket, a channel bot's recent chats).
#[async_trait]
pub trait NotificationSink: Send + Sync {
    /// A stable label for logging.
    fn label(&self) -> String;

    async fn deliver(&self, event: &str, message: &str) -> anyhow::Result<()>;
}

pub struct NotificationHub {
    sinks: Mutex<Vec<Arc<dyn NotificationSink>>>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self {
            sinks: Mutex::new(Vec::new()),
        }
    }

    pub async fn subscribe(&self, sink: Arc<dyn NotificationSink>) {
        self.sinks.lock().await.push(sink);
    }

    pub async fn sink_count(&self) -> usize {
        self.sinks.lock().await.len()
    }

    /// Deliver `(event, message)` to a snapshot of the current sinks.
    /// Failed sinks are removed.
    pub async fn broadcast(&self, event: &str, message: &str) {
        let snapshot: Vec<Arc<dyn NotificationSink>> = {
            let sinks = self.sinks.lock().await;
            sinks.clone()
        };
        if snapshot.is_empty() {
            return;
        }
        info!(event, sinks = snapshot.len(), "broadcasting notification");

        let mut dead: Vec<String> = Vec::new();
        for sink in &snapshot {
            if let Err(e) = sink.deliver(event, message).await {
                debug!(sink = %sink.label(), error = %e, "notification delivery failed, dropping sink");
                dead.push(sink.label());
            }
        }
        if !dead.is_empty() {
            let mut sinks = self.sinks.lock().await;
            sinks.retain(|s| !dead.contains(&s.label()));
        }
    }
}

impl Default for NotificationHub {
    fn default() -> Self {
        Self::new()
    }
}
