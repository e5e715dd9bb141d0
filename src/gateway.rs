use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rmcp::model::{CallToolResult, GetPromptResult, ReadResourceResult};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::events::{EventBus, GatewayEvent};
use crate::naming::{normalize_prefix, parse_prefixed_name, prefixed_name};
use crate::oauth::{OAuthError, OAuthManager};
use crate::store::{NewServer, ServerConfig, ServerUpdate, Store, StoreError, TransportKind};
use crate::upstream::{
    PromptInfo, ResourceInfo, SessionSnapshot, SessionStatus, ToolInfo, UpstreamCallError,
    UpstreamSession,
};

const SHUTDOWN_GRACE_PER_SESSION: Duration = Duration::from_secs(5);

#[derive(Debug)]
pub enum GatewayError {
    ConfigNotFound(String),
    DuplicateName(String),
    InvalidConfig(String),
    NotConnected(String),
    NoSuchTool(String),
    NoSuchResource(String),
    NoSuchPrompt(String),
    Upstream { code: i32, message: String },
    Transport(String),
    AwaitingOauth(String),
    OAuth(OAuthError),
    StorePersist(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ConfigNotFound(id) => write!(f, "server '{id}' not found"),
            Self::DuplicateName(name) => write!(f, "server name '{name}' is already taken"),
            Self::InvalidConfig(reason) => write!(f, "invalid server config: {reason}"),
            Self::NotConnected(id) => write!(f, "server '{id}' is not connected"),
            Self::NoSuchTool(name) => write!(f, "no tool named '{name}'"),
            Self::NoSuchResource(uri) => write!(f, "no resource with uri '{uri}'"),
            Self::NoSuchPrompt(name) => write!(f, "no prompt named '{name}'"),
            Self::Upstream { code, message } => write!(f, "upstream error {code}: {message}"),
            Self::Transport(detail) => write!(f, "transport error: {detail}"),
            Self::AwaitingOauth(id) => {
                write!(f, "server '{id}' is awaiting oauth authorization")
            }
            Self::OAuth(err) => write!(f, "{err}"),
            Self::StorePersist(detail) => write!(f, "store persistence failed: {detail}"),
        }
    }
}

impl std::error::Error for GatewayError {}

impl From<StoreError> for GatewayError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => Self::ConfigNotFound(id),
            StoreError::DuplicateName(name) => Self::DuplicateName(name),
            StoreError::InvalidConfig(reason) => Self::InvalidConfig(reason),
            StoreError::Persist(detail) => Self::StorePersist(detail),
        }
    }
}

impl From<OAuthError> for GatewayError {
    fn from(err: OAuthError) -> Self {
        Self::OAuth(err)
    }
}

fn map_call_error(server_id: &str, err: UpstreamCallError) -> GatewayError {
    match err {
        UpstreamCallError::NotConnected => GatewayError::NotConnected(server_id.to_string()),
        UpstreamCallError::Timeout => {
            GatewayError::Transport(format!("request to '{server_id}' timed out"))
        }
        UpstreamCallError::Cancelled => {
            GatewayError::Transport("request cancelled by the caller".to_string())
        }
        UpstreamCallError::Remote { code, message } => GatewayError::Upstream { code, message },
        UpstreamCallError::Transport(detail) => GatewayError::Transport(detail),
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerStatusView {
    pub id: String,
    pub name: String,
    pub prefix: String,
    pub enabled: bool,
    pub transport: TransportKind,
    #[serde(flatten)]
    pub session: SessionSnapshot,
    pub created_at: u64,
    pub updated_at: u64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedTool {
    pub server_id: String,
    pub server_name: String,
    pub prefix: String,
    pub prefixed_name: String,
    #[serde(flatten)]
    pub tool: ToolInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedResource {
    pub server_id: String,
    pub server_name: String,
    #[serde(flatten)]
    pub resource: ResourceInfo,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedPrompt {
    pub server_id: String,
    pub server_name: String,
    pub prefix: String,
    pub prefixed_name: String,
    #[serde(flatten)]
    pub prompt: PromptInfo,
}

struct GatewayInner {
    store: Store,
    oauth: OAuthManager,
    events: EventBus,
    sessions: RwLock<HashMap<String, Arc<UpstreamSession>>>,
    // Coarse lock so two callers cannot race configuration mutations on the
    // same server id; queries never take it.
    mutation: Mutex<()>,
}

/// Registry of all upstream sessions. Serialises configuration mutations,
/// publishes events, and answers aggregated queries from snapshot copies.
#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(store: Store, oauth: OAuthManager, events: EventBus) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                store,
                oauth,
                events,
                sessions: RwLock::new(HashMap::new()),
                mutation: Mutex::new(()),
            }),
        }
    }

    pub fn store(&self) -> &Store {
        &self.inner.store
    }

    /// Builds sessions for every stored config (all start disconnected) and
    /// kicks off connects for the enabled ones. Returns once those connects
    /// have started; their progress is observable through statuses.
    pub async fn initialize(&self) {
        let configs = self.inner.store.list_servers();
        let mut sessions = self.inner.sessions.write().await;
        for config in configs {
            let enabled = config.enabled;
            let session = UpstreamSession::new(
                config,
                self.inner.events.clone(),
                self.inner.oauth.clone(),
            );
            if enabled {
                let session = Arc::clone(&session);
                tokio::spawn(async move {
                    if let Err(err) = session.connect().await {
                        warn!(server_id = %session.id(), error = %err, "initial connect failed");
                    }
                });
            }
            sessions.insert(session.id().to_string(), session);
        }
        info!(server_count = sessions.len(), "gateway initialized");
    }

    pub async fn register_server(&self, new: NewServer) -> Result<ServerConfig, GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let config = self.inner.store.add_server(new)?;
        let session = UpstreamSession::new(
            config.clone(),
            self.inner.events.clone(),
            self.inner.oauth.clone(),
        );
        self.inner
            .sessions
            .write()
            .await
            .insert(config.id.clone(), Arc::clone(&session));

        self.inner.events.publish(GatewayEvent::ServerAdded {
            server_id: config.id.clone(),
            name: config.name.clone(),
        });

        if config.enabled {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                if let Err(err) = session.connect().await {
                    warn!(server_id = %session.id(), error = %err, "auto-connect failed");
                }
            });
        }
        Ok(config)
    }

    pub async fn update_server(
        &self,
        id: &str,
        update: ServerUpdate,
    ) -> Result<ServerConfig, GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        let was_enabled = session.config().enabled;

        let updated = self.inner.store.update_server(id, update)?;
        session.set_config(updated.config.clone());

        if updated.config.transport.auth().is_oauth() {
            self.inner.oauth.replace_provider(&updated.config)?;
        } else {
            self.inner.oauth.remove_provider(id);
        }

        self.inner.events.publish(GatewayEvent::ServerUpdated {
            server_id: updated.config.id.clone(),
            name: updated.config.name.clone(),
        });

        let now_enabled = updated.config.enabled;
        if was_enabled && !now_enabled {
            session.disconnect().await;
        } else if !was_enabled && now_enabled {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let _ = session.connect().await;
            });
        } else if now_enabled && updated.connection_changed {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                let _ = session.reconnect().await;
            });
        }

        Ok(updated.config)
    }

    pub async fn remove_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        let name = session.config().name;

        session.disconnect().await;
        self.inner.sessions.write().await.remove(id);
        self.inner.oauth.remove_provider(id);
        self.inner.store.remove_server(id)?;

        self.inner.events.publish(GatewayEvent::ServerRemoved {
            server_id: id.to_string(),
            name,
        });
        Ok(())
    }

    pub async fn connect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        session
            .connect()
            .await
            .map_err(|err| GatewayError::Transport(format!("{err:#}")))
    }

    pub async fn disconnect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        session.disconnect().await;
        Ok(())
    }

    pub async fn reconnect_server(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        session
            .reconnect()
            .await
            .map_err(|err| GatewayError::Transport(format!("{err:#}")))
    }

    pub async fn refresh_server(&self, id: &str) -> Result<(), GatewayError> {
        let session = self.session(id).await?;
        session
            .refresh_capabilities()
            .await
            .map_err(|err| map_call_error(id, err))
    }

    pub async fn set_server_enabled(&self, id: &str, enabled: bool) -> Result<ServerConfig, GatewayError> {
        self.update_server(
            id,
            ServerUpdate {
                enabled: Some(enabled),
                ..Default::default()
            },
        )
        .await
    }

    /// Valid from `awaitingOauth`, `disconnected`, or `error`; closes any
    /// stale transport and connects with the freshly-minted tokens.
    pub async fn on_oauth_complete(&self, id: &str) -> Result<(), GatewayError> {
        let _guard = self.inner.mutation.lock().await;
        let session = self.session(id).await?;
        session
            .on_oauth_complete()
            .await
            .map_err(|err| GatewayError::Transport(format!("{err:#}")))
    }

    pub async fn get_server_status(&self, id: &str) -> Result<ServerStatusView, GatewayError> {
        let session = self.session(id).await?;
        Ok(status_view(&session))
    }

    pub async fn get_all_server_statuses(&self) -> Vec<ServerStatusView> {
        let sessions = self.inner.sessions.read().await;
        let mut views: Vec<ServerStatusView> = sessions.values().map(|s| status_view(s)).collect();
        views.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        views
    }

    pub async fn connected_count(&self) -> (usize, usize) {
        let sessions = self.inner.sessions.read().await;
        let total = sessions.len();
        let connected = sessions
            .values()
            .filter(|s| s.status() == SessionStatus::Connected)
            .count();
        (total, connected)
    }

    pub async fn get_all_tools(&self) -> Vec<AggregatedTool> {
        let mut tools = Vec::new();
        for view in self.get_all_server_statuses().await {
            for tool in view.session.tools {
                tools.push(AggregatedTool {
                    server_id: view.id.clone(),
                    server_name: view.name.clone(),
                    prefix: view.prefix.clone(),
                    prefixed_name: prefixed_name(&view.prefix, &tool.name),
                    tool,
                });
            }
        }
        tools
    }

    pub async fn get_all_resources(&self) -> Vec<AggregatedResource> {
        let mut resources = Vec::new();
        for view in self.get_all_server_statuses().await {
            for resource in view.session.resources {
                resources.push(AggregatedResource {
                    server_id: view.id.clone(),
                    server_name: view.name.clone(),
                    resource,
                });
            }
        }
        resources
    }

    pub async fn get_all_prompts(&self) -> Vec<AggregatedPrompt> {
        let mut prompts = Vec::new();
        for view in self.get_all_server_statuses().await {
            for prompt in view.session.prompts {
                prompts.push(AggregatedPrompt {
                    server_id: view.id.clone(),
                    server_name: view.name.clone(),
                    prefix: view.prefix.clone(),
                    prefixed_name: prefixed_name(&view.prefix, &prompt.name),
                    prompt,
                });
            }
        }
        prompts
    }

    pub async fn call_tool(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, GatewayError> {
        let session = self.session(server_id).await?;
        session
            .call_tool(name, arguments, cancel)
            .await
            .map_err(|err| map_call_error(server_id, err))
    }

    /// Routes a prefixed tool name to its owning upstream. Ties are
    /// impossible because normalized prefixes are unique per server.
    pub async fn call_tool_by_name(
        &self,
        prefixed: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, GatewayError> {
        let (server_id, original) = self
            .resolve_tool(prefixed)
            .await
            .ok_or_else(|| GatewayError::NoSuchTool(prefixed.to_string()))?;
        self.call_tool(&server_id, &original, arguments, cancel).await
    }

    pub async fn resolve_tool(&self, prefixed: &str) -> Option<(String, String)> {
        let (prefix, original) = parse_prefixed_name(prefixed)?;
        let sessions = self.inner.sessions.read().await;
        for session in sessions.values() {
            let config = session.config();
            if normalize_prefix(&config.name) != prefix {
                continue;
            }
            let snapshot = session.snapshot();
            if snapshot.tools.iter().any(|tool| tool.name == original) {
                return Some((config.id, original.to_string()));
            }
        }
        None
    }

    pub async fn read_resource(
        &self,
        server_id: &str,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<ReadResourceResult, GatewayError> {
        let session = self.session(server_id).await?;
        session
            .read_resource(uri, cancel)
            .await
            .map_err(|err| map_call_error(server_id, err))
    }

    /// Resources keep their original URIs, so routing scans the aggregate.
    pub async fn resolve_resource(&self, uri: &str) -> Option<String> {
        let sessions = self.inner.sessions.read().await;
        for session in sessions.values() {
            let snapshot = session.snapshot();
            if snapshot.resources.iter().any(|r| r.uri == uri) {
                return Some(session.id().to_string());
            }
        }
        None
    }

    pub async fn get_prompt(
        &self,
        server_id: &str,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<GetPromptResult, GatewayError> {
        let session = self.session(server_id).await?;
        session
            .get_prompt(name, arguments, cancel)
            .await
            .map_err(|err| map_call_error(server_id, err))
    }

    pub async fn resolve_prompt(&self, prefixed: &str) -> Option<(String, String)> {
        let (prefix, original) = parse_prefixed_name(prefixed)?;
        let sessions = self.inner.sessions.read().await;
        for session in sessions.values() {
            let config = session.config();
            if normalize_prefix(&config.name) != prefix {
                continue;
            }
            let snapshot = session.snapshot();
            if snapshot.prompts.iter().any(|prompt| prompt.name == original) {
                return Some((config.id, original.to_string()));
            }
        }
        None
    }

    /// Cancels every pending reconnect, then disconnects all sessions in
    /// parallel with a per-session grace limit.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<UpstreamSession>> = {
            let mut guard = self.inner.sessions.write().await;
            guard.drain().map(|(_, session)| session).collect()
        };
        for session in &sessions {
            session.cancel_pending_reconnect();
        }

        let mut tasks = JoinSet::new();
        for session in sessions {
            tasks.spawn(async move {
                let _ =
                    tokio::time::timeout(SHUTDOWN_GRACE_PER_SESSION, session.disconnect()).await;
            });
        }
        while tasks.join_next().await.is_some() {}
        info!("gateway shut down");
    }

    async fn session(&self, id: &str) -> Result<Arc<UpstreamSession>, GatewayError> {
        self.inner
            .sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| GatewayError::ConfigNotFound(id.to_string()))
    }
}

fn status_view(session: &Arc<UpstreamSession>) -> ServerStatusView {
    let config = session.config();
    ServerStatusView {
        prefix: config.prefix(),
        id: config.id,
        name: config.name,
        enabled: config.enabled,
        transport: config.transport.kind(),
        session: session.snapshot(),
        created_at: config.created_at,
        updated_at: config.updated_at,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{Gateway, GatewayError};
    use crate::events::{EventBus, GatewayEvent};
    use crate::oauth::OAuthManager;
    use crate::store::{NewServer, ServerUpdate, StdioConfig, Store, TransportConfig};

    fn new_gateway() -> (tempfile::TempDir, Gateway, EventBus) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("store opens");
        let events = EventBus::new();
        let oauth = OAuthManager::new(
            store.clone(),
            events.clone(),
            "http://127.0.0.1:0".to_string(),
        );
        (temp, Gateway::new(store, oauth, events.clone()), events)
    }

    fn disabled_stdio(name: &str) -> NewServer {
        NewServer {
            name: name.to_string(),
            enabled: false,
            transport: TransportConfig::Stdio(StdioConfig {
                command: "echo-mcp".to_string(),
                args: vec![],
                env: BTreeMap::new(),
                cwd: None,
            }),
        }
    }

    #[tokio::test]
    async fn register_emits_event_and_builds_session() {
        let (_temp, gateway, events) = new_gateway();
        let mut rx = events.subscribe();

        let config = gateway
            .register_server(disabled_stdio("fs"))
            .await
            .expect("register");

        let event = rx.recv().await.expect("server:added event");
        assert!(matches!(event, GatewayEvent::ServerAdded { server_id, .. } if server_id == config.id));

        let status = gateway
            .get_server_status(&config.id)
            .await
            .expect("status");
        assert_eq!(status.name, "fs");
        assert_eq!(status.prefix, "fs");
        assert!(!status.enabled);
    }

    #[tokio::test]
    async fn duplicate_prefix_is_rejected_at_registration() {
        let (_temp, gateway, _events) = new_gateway();
        gateway
            .register_server(disabled_stdio("Foo Bar"))
            .await
            .expect("first registration");

        let err = gateway
            .register_server(disabled_stdio("Foo-Bar"))
            .await
            .expect_err("colliding prefix must fail");
        assert!(matches!(err, GatewayError::DuplicateName(_)));
    }

    #[tokio::test]
    async fn remove_tears_down_session_and_emits() {
        let (_temp, gateway, events) = new_gateway();
        let config = gateway
            .register_server(disabled_stdio("fs"))
            .await
            .expect("register");

        let mut rx = events.subscribe();
        gateway.remove_server(&config.id).await.expect("remove");

        let mut saw_removed = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(&event, GatewayEvent::ServerRemoved { server_id, .. } if *server_id == config.id)
            {
                saw_removed = true;
            }
        }
        assert!(saw_removed, "server:removed must fire");
        assert!(matches!(
            gateway.get_server_status(&config.id).await,
            Err(GatewayError::ConfigNotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_updates_prefix_for_routing() {
        let (_temp, gateway, _events) = new_gateway();
        let config = gateway
            .register_server(disabled_stdio("fs"))
            .await
            .expect("register");

        gateway
            .update_server(
                &config.id,
                ServerUpdate {
                    name: Some("files".to_string()),
                    ..Default::default()
                },
            )
            .await
            .expect("rename");

        let status = gateway
            .get_server_status(&config.id)
            .await
            .expect("status");
        assert_eq!(status.prefix, "files");
    }

    #[tokio::test]
    async fn unknown_tool_resolution_fails_cleanly() {
        let (_temp, gateway, _events) = new_gateway();
        gateway
            .register_server(disabled_stdio("fs"))
            .await
            .expect("register");

        assert!(gateway.resolve_tool("fs__missing").await.is_none());
        let err = gateway
            .call_tool_by_name("fs__missing", None, tokio_util::sync::CancellationToken::new())
            .await
            .expect_err("unknown tool");
        assert!(matches!(err, GatewayError::NoSuchTool(_)));
    }

    #[tokio::test]
    async fn aggregates_are_empty_when_nothing_connected() {
        let (_temp, gateway, _events) = new_gateway();
        gateway
            .register_server(disabled_stdio("fs"))
            .await
            .expect("register");

        assert!(gateway.get_all_tools().await.is_empty());
        assert!(gateway.get_all_resources().await.is_empty());
        assert!(gateway.get_all_prompts().await.is_empty());
        let (total, connected) = gateway.connected_count().await;
        assert_eq!((total, connected), (1, 0));
    }
}
