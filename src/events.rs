use serde::Serialize;
use tokio::sync::broadcast;
use tracing::debug;

use crate::upstream::SessionStatus;

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Everything the gateway announces about itself. Delivery is best-effort:
/// a slow subscriber lags and drops, it never blocks the publisher.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum GatewayEvent {
    #[serde(rename = "server:added")]
    ServerAdded { server_id: String, name: String },
    #[serde(rename = "server:updated")]
    ServerUpdated { server_id: String, name: String },
    #[serde(rename = "server:removed")]
    ServerRemoved { server_id: String, name: String },
    #[serde(rename = "server:status")]
    ServerStatus {
        server_id: String,
        status: SessionStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename = "server:connected")]
    ServerConnected { server_id: String, name: String },
    #[serde(rename = "server:disconnected")]
    ServerDisconnected { server_id: String, name: String },
    #[serde(rename = "oauth:required")]
    OauthRequired { server_id: String, auth_url: String },
    #[serde(rename = "log:started")]
    LogStarted { log_id: String },
    #[serde(rename = "log:completed")]
    LogCompleted { log_id: String, status: String },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GatewayEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: GatewayEvent) {
        debug!(event = ?event, "publishing gateway event");
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.tx.subscribe()
    }
}
