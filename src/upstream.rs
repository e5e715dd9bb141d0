use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use rmcp::{
    ClientHandler, RoleClient, ServiceExt,
    model::{
        CallToolRequestParam, CallToolResult, GetPromptRequestParam, GetPromptResult,
        ReadResourceRequestParam, ReadResourceResult,
    },
    service::{Peer, RunningService, ServiceError},
    transport::{
        StreamableHttpClientTransport, TokioChildProcess,
        streamable_http_client::StreamableHttpClientTransportConfig, worker::WorkerTransport,
    },
};
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::process::Command;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::events::{EventBus, GatewayEvent};
use crate::oauth::{AuthOutcome, CredentialScope, OAuthManager};
use crate::sse::SseUpstreamWorker;
use crate::store::{
    RemoteConfig, ServerConfig, StdioConfig, TransportConfig, build_auth_headers, now_epoch_ms,
};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
const DISCOVERY_TIMEOUT: Duration = Duration::from_secs(30);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const RECONNECT_BASE_DELAY: Duration = Duration::from_secs(2);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_MAX_ATTEMPTS: u32 = 5;
const RECONNECT_JITTER_MS: u64 = 1000;

/// Some upstreams legitimately take minutes per call, so the forwarding
/// timeout is generous and overridable rather than a hard constant.
pub fn upstream_request_timeout() -> Duration {
    std::env::var("UPSTREAM_REQUEST_TIMEOUT")
        .ok()
        .and_then(|raw| raw.parse::<u64>().ok())
        .map(Duration::from_secs)
        .unwrap_or(DEFAULT_REQUEST_TIMEOUT)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum SessionStatus {
    Disconnected,
    Connecting,
    Connected,
    Error,
    AwaitingOauth,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Error => "error",
            Self::AwaitingOauth => "awaitingOauth",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input_schema: Option<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceInfo {
    pub uri: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mime_type: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptArgumentInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub required: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub arguments: Vec<PromptArgumentInfo>,
}

#[derive(Debug, Clone, Default)]
pub struct CapabilitySnapshot {
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
    pub prompts: Vec<PromptInfo>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub tools: Vec<ToolInfo>,
    pub resources: Vec<ResourceInfo>,
    pub prompts: Vec<PromptInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_connected: Option<u64>,
    pub reconnect_attempts: u32,
}

#[derive(Debug)]
pub enum UpstreamCallError {
    NotConnected,
    Timeout,
    Cancelled,
    Remote { code: i32, message: String },
    Transport(String),
}

impl fmt::Display for UpstreamCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "upstream session is not connected"),
            Self::Timeout => write!(f, "upstream request timed out"),
            Self::Cancelled => write!(f, "upstream request cancelled"),
            Self::Remote { code, message } => write!(f, "upstream error {code}: {message}"),
            Self::Transport(detail) => write!(f, "upstream transport error: {detail}"),
        }
    }
}

impl std::error::Error for UpstreamCallError {}

fn map_service_error(err: ServiceError) -> UpstreamCallError {
    match err {
        ServiceError::McpError(mcp_error) => UpstreamCallError::Remote {
            code: mcp_error.code.0,
            message: mcp_error.message.to_string(),
        },
        other => UpstreamCallError::Transport(other.to_string()),
    }
}

/// A connect attempt either failed outright or was refused with an HTTP 401.
/// The 401 case is detected by status code, never by matching error text,
/// and suspends the session into `awaitingOauth` instead of retrying.
enum ConnectFailure {
    Unauthorized { had_token: bool },
    Failed(anyhow::Error),
}

#[derive(Clone, Default)]
struct UpstreamClientHandler;

impl ClientHandler for UpstreamClientHandler {}

type UpstreamService = RunningService<RoleClient, UpstreamClientHandler>;

#[derive(Debug)]
struct SessionState {
    status: SessionStatus,
    error: Option<String>,
    caps: CapabilitySnapshot,
    last_connected: Option<u64>,
    reconnect_attempts: u32,
    generation: u64,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            status: SessionStatus::Disconnected,
            error: None,
            caps: CapabilitySnapshot::default(),
            last_connected: None,
            reconnect_attempts: 0,
            generation: 0,
        }
    }
}

/// One connection to one upstream MCP server: owns the transport, drives
/// the handshake and capability discovery, and supervises reconnection.
pub struct UpstreamSession {
    id: String,
    events: EventBus,
    oauth: OAuthManager,
    config: RwLock<ServerConfig>,
    state: Mutex<SessionState>,
    peer: Mutex<Option<Peer<RoleClient>>>,
    transport_cancel: Mutex<Option<CancellationToken>>,
    reconnect_cancel: Mutex<Option<CancellationToken>>,
    connect_lock: tokio::sync::Mutex<()>,
    request_timeout: Duration,
}

impl UpstreamSession {
    pub fn new(config: ServerConfig, events: EventBus, oauth: OAuthManager) -> Arc<Self> {
        Arc::new(Self {
            id: config.id.clone(),
            events,
            oauth,
            config: RwLock::new(config),
            state: Mutex::new(SessionState::default()),
            peer: Mutex::new(None),
            transport_cancel: Mutex::new(None),
            reconnect_cancel: Mutex::new(None),
            connect_lock: tokio::sync::Mutex::new(()),
            request_timeout: upstream_request_timeout(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> ServerConfig {
        self.config
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set_config(&self, config: ServerConfig) {
        *self
            .config
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = config;
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        let state = self.lock_state();
        SessionSnapshot {
            status: state.status,
            error: state.error.clone(),
            tools: state.caps.tools.clone(),
            resources: state.caps.resources.clone(),
            prompts: state.caps.prompts.clone(),
            last_connected: state.last_connected,
            reconnect_attempts: state.reconnect_attempts,
        }
    }

    pub fn status(&self) -> SessionStatus {
        self.lock_state().status
    }

    /// Idempotent: a second connect while connecting or connected is a no-op.
    pub async fn connect(self: &Arc<Self>) -> Result<()> {
        let _guard = self.connect_lock.lock().await;
        {
            let state = self.lock_state();
            if matches!(
                state.status,
                SessionStatus::Connecting | SessionStatus::Connected
            ) {
                return Ok(());
            }
        }
        self.cancel_pending_reconnect();
        self.transition(SessionStatus::Connecting, None);

        let config = self.config();
        match self.try_connect(&config).await {
            Ok(()) => Ok(()),
            Err(ConnectFailure::Unauthorized { had_token }) => {
                if config.transport.auth().is_oauth() {
                    self.enter_oauth_flow(had_token).await;
                } else {
                    // Retrying cannot fix rejected static credentials, so a
                    // 401 never schedules a reconnect.
                    self.transition(
                        SessionStatus::Error,
                        Some("upstream rejected credentials (HTTP 401)".to_string()),
                    );
                }
                Ok(())
            }
            Err(ConnectFailure::Failed(err)) => {
                self.note_connect_failure(&err);
                Err(err)
            }
        }
    }

    pub async fn disconnect(self: &Arc<Self>) {
        let _guard = self.connect_lock.lock().await;
        self.teardown().await;
    }

    /// Manual reconnect resets the backoff counter (teardown zeroes it).
    pub async fn reconnect(self: &Arc<Self>) -> Result<()> {
        self.disconnect().await;
        self.connect().await
    }

    /// Tears down any stale transport left over from the failed pre-consent
    /// attempt and connects again, this time with tokens attached.
    pub async fn on_oauth_complete(self: &Arc<Self>) -> Result<()> {
        let status = self.status();
        if !matches!(
            status,
            SessionStatus::AwaitingOauth | SessionStatus::Disconnected | SessionStatus::Error
        ) {
            bail!(
                "oauth completion is not valid while the session is {}",
                status.as_str()
            );
        }
        self.disconnect().await;
        self.connect().await
    }

    pub async fn refresh_capabilities(&self) -> Result<(), UpstreamCallError> {
        let peer = self.current_peer()?;
        let name = self.config().name;
        let caps = discover_capabilities(&peer, &name).await;
        {
            let mut state = self.lock_state();
            if state.status != SessionStatus::Connected {
                return Err(UpstreamCallError::NotConnected);
            }
            state.caps = caps;
        }
        self.emit_status();
        Ok(())
    }

    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<CallToolResult, UpstreamCallError> {
        let peer = self.current_peer()?;
        let params = CallToolRequestParam {
            name: name.to_string().into(),
            arguments,
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamCallError::Cancelled),
            outcome = timeout(self.request_timeout, peer.call_tool(params)) => match outcome {
                Err(_) => Err(UpstreamCallError::Timeout),
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(map_service_error(err)),
            },
        }
    }

    pub async fn read_resource(
        &self,
        uri: &str,
        cancel: CancellationToken,
    ) -> Result<ReadResourceResult, UpstreamCallError> {
        let peer = self.current_peer()?;
        let params = ReadResourceRequestParam {
            uri: uri.to_string(),
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamCallError::Cancelled),
            outcome = timeout(self.request_timeout, peer.read_resource(params)) => match outcome {
                Err(_) => Err(UpstreamCallError::Timeout),
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(map_service_error(err)),
            },
        }
    }

    pub async fn get_prompt(
        &self,
        name: &str,
        arguments: Option<Map<String, Value>>,
        cancel: CancellationToken,
    ) -> Result<GetPromptResult, UpstreamCallError> {
        let peer = self.current_peer()?;
        let params = GetPromptRequestParam {
            name: name.to_string(),
            arguments,
        };
        tokio::select! {
            _ = cancel.cancelled() => Err(UpstreamCallError::Cancelled),
            outcome = timeout(self.request_timeout, peer.get_prompt(params)) => match outcome {
                Err(_) => Err(UpstreamCallError::Timeout),
                Ok(Ok(result)) => Ok(result),
                Ok(Err(err)) => Err(map_service_error(err)),
            },
        }
    }

    async fn try_connect(self: &Arc<Self>, config: &ServerConfig) -> Result<(), ConnectFailure> {
        let service = self.open_transport(config).await?;
        let peer = service.peer().clone();
        let caps = discover_capabilities(&peer, &config.name).await;

        let generation = {
            let mut state = self.lock_state();
            state.status = SessionStatus::Connected;
            state.error = None;
            state.caps = caps;
            state.last_connected = Some(now_epoch_ms());
            state.reconnect_attempts = 0;
            state.generation += 1;
            state.generation
        };
        *self.lock_peer() = Some(peer);
        *self.lock_transport_cancel() = Some(service.cancellation_token());
        self.spawn_watcher(service, generation);

        self.emit_status();
        self.events.publish(GatewayEvent::ServerConnected {
            server_id: self.id.clone(),
            name: config.name.clone(),
        });
        Ok(())
    }

    async fn open_transport(
        &self,
        config: &ServerConfig,
    ) -> Result<UpstreamService, ConnectFailure> {
        match &config.transport {
            TransportConfig::Stdio(stdio) => self
                .open_stdio_transport(&config.name, stdio)
                .await
                .map_err(ConnectFailure::Failed),
            TransportConfig::Sse(remote) => self.open_remote_transport(config, remote, false).await,
            TransportConfig::StreamableHttp(remote) => {
                self.open_remote_transport(config, remote, true).await
            }
        }
    }

    async fn open_stdio_transport(
        &self,
        name: &str,
        stdio: &StdioConfig,
    ) -> Result<UpstreamService> {
        debug!(
            server = %name,
            command = %stdio.command,
            args = ?stdio.args,
            cwd = ?stdio.cwd,
            "spawning stdio upstream"
        );

        let mut command = Command::new(&stdio.command);
        command.args(&stdio.args);
        for (key, value) in &stdio.env {
            command.env(key, value);
        }
        if let Some(cwd) = &stdio.cwd {
            command.current_dir(expand_tilde(cwd));
        }

        let transport = TokioChildProcess::new(command)
            .with_context(|| format!("failed to spawn stdio command '{}'", stdio.command))?;

        timeout(HANDSHAKE_TIMEOUT, UpstreamClientHandler.serve(transport))
            .await
            .map_err(|_| anyhow!("MCP handshake timed out for '{name}'"))?
            .with_context(|| format!("MCP handshake failed for '{name}'"))
    }

    async fn open_remote_transport(
        &self,
        config: &ServerConfig,
        remote: &RemoteConfig,
        streamable: bool,
    ) -> Result<UpstreamService, ConnectFailure> {
        let mut headers = remote.headers.clone();
        for (name, value) in build_auth_headers(&remote.auth) {
            headers.insert(name, value);
        }

        let mut had_token = false;
        if remote.auth.is_oauth() {
            match self.oauth.access_token_for(config).await {
                Ok(Some(token)) => {
                    had_token = true;
                    headers.insert("Authorization".to_string(), format!("Bearer {token}"));
                }
                Ok(None) => return Err(ConnectFailure::Unauthorized { had_token: false }),
                Err(err) => return Err(ConnectFailure::Failed(anyhow!(err))),
            }
        }

        let http = build_http_client(&headers).map_err(ConnectFailure::Failed)?;

        debug!(
            server = %config.name,
            url = %remote.url,
            streamable,
            header_count = headers.len(),
            "opening remote upstream transport"
        );

        let served = if streamable {
            let transport_config =
                StreamableHttpClientTransportConfig::with_uri(remote.url.clone());
            let transport =
                StreamableHttpClientTransport::with_client(http.clone(), transport_config);
            timeout(HANDSHAKE_TIMEOUT, UpstreamClientHandler.serve(transport)).await
        } else {
            // The worker injects the header set itself, so it gets a plain
            // client rather than one with default headers.
            let sse_http = reqwest::Client::builder()
                .connect_timeout(CONNECT_TIMEOUT)
                .build()
                .map_err(|err| ConnectFailure::Failed(anyhow!(err)))?;
            let worker = SseUpstreamWorker::new(sse_http, remote.url.clone(), headers.clone());
            let transport = WorkerTransport::spawn(worker);
            timeout(HANDSHAKE_TIMEOUT, UpstreamClientHandler.serve(transport)).await
        };

        match served {
            Ok(Ok(service)) => Ok(service),
            Ok(Err(err)) => {
                if probe_unauthorized(&http, &remote.url).await {
                    Err(ConnectFailure::Unauthorized { had_token })
                } else {
                    Err(ConnectFailure::Failed(
                        anyhow!(err)
                            .context(format!("MCP handshake failed for '{}'", config.name)),
                    ))
                }
            }
            Err(_) => Err(ConnectFailure::Failed(anyhow!(
                "MCP handshake timed out for '{}'",
                config.name
            ))),
        }
    }

    async fn enter_oauth_flow(self: &Arc<Self>, had_token: bool) {
        if had_token {
            // The server rejected a token we believed valid; only a fresh
            // grant can recover.
            if let Ok(provider) = self.oauth.get_provider(&self.config()) {
                provider.invalidate_credentials(CredentialScope::Tokens);
            }
        }

        match self.oauth.initiate_auth(&self.id).await {
            Ok(AuthOutcome::Authorized) => {
                // A refresh produced usable tokens underneath us; retry.
                self.transition(SessionStatus::Disconnected, None);
                let session = Arc::clone(self);
                tokio::spawn(async move {
                    if let Err(err) = session.connect().await {
                        warn!(
                            server_id = %session.id,
                            error = %err,
                            "reconnect after oauth refresh failed"
                        );
                    }
                });
            }
            Ok(AuthOutcome::Redirect { .. }) => {
                // `oauth:required` was already published by the provider;
                // the initial connect returns without error.
                self.transition(SessionStatus::AwaitingOauth, None);
            }
            Err(err) => {
                // OAuth flow errors surface to the caller and are never
                // silently retried.
                self.transition(SessionStatus::Error, Some(err.to_string()));
            }
        }
    }

    fn note_connect_failure(self: &Arc<Self>, err: &anyhow::Error) {
        let enabled = self.config().enabled;
        let failures = {
            let mut state = self.lock_state();
            state.reconnect_attempts += 1;
            state.status = SessionStatus::Error;
            state.caps = CapabilitySnapshot::default();
            state.error = Some(if state.reconnect_attempts > RECONNECT_MAX_ATTEMPTS {
                format!("giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts: {err:#}")
            } else {
                format!("{err:#}")
            });
            state.reconnect_attempts
        };
        self.emit_status();

        if enabled && failures <= RECONNECT_MAX_ATTEMPTS {
            self.schedule_reconnect(failures);
        }
    }

    fn schedule_reconnect(self: &Arc<Self>, failures: u32) {
        let jitter = Duration::from_millis(
            rand::Rng::gen_range(&mut rand::thread_rng(), 0..RECONNECT_JITTER_MS),
        );
        let delay = reconnect_delay(failures) + jitter;
        debug!(
            server_id = %self.id,
            failures,
            delay_ms = delay.as_millis() as u64,
            "scheduling reconnect"
        );

        let token = CancellationToken::new();
        *self.lock_reconnect_cancel() = Some(token.clone());

        let session = Arc::clone(self);
        tokio::spawn(async move {
            tokio::select! {
                _ = token.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    if let Err(err) = session.connect().await {
                        debug!(server_id = %session.id, error = %err, "scheduled reconnect failed");
                    }
                }
            }
        });
    }

    fn spawn_watcher(self: &Arc<Self>, service: UpstreamService, generation: u64) {
        let session = Arc::clone(self);
        tokio::spawn(async move {
            let quit = service.waiting().await;
            debug!(server_id = %session.id, quit = ?quit, "upstream transport closed");
            session.on_transport_closed(generation).await;
        });
    }

    async fn on_transport_closed(self: &Arc<Self>, generation: u64) {
        let (was_connected, name) = {
            let mut state = self.lock_state();
            if state.generation != generation {
                // A deliberate disconnect or replacement already superseded
                // this transport.
                return;
            }
            let was_connected = state.status == SessionStatus::Connected;
            state.status = SessionStatus::Disconnected;
            state.error = None;
            state.caps = CapabilitySnapshot::default();
            (was_connected, self.config().name)
        };
        *self.lock_peer() = None;
        *self.lock_transport_cancel() = None;

        if !was_connected {
            return;
        }
        self.emit_status();
        self.events.publish(GatewayEvent::ServerDisconnected {
            server_id: self.id.clone(),
            name,
        });

        if self.config().enabled {
            let failures = {
                let mut state = self.lock_state();
                state.reconnect_attempts += 1;
                state.reconnect_attempts
            };
            if failures > RECONNECT_MAX_ATTEMPTS {
                self.transition(
                    SessionStatus::Error,
                    Some(format!(
                        "giving up after {RECONNECT_MAX_ATTEMPTS} reconnect attempts"
                    )),
                );
            } else {
                self.schedule_reconnect(failures);
            }
        }
    }

    async fn teardown(self: &Arc<Self>) {
        self.cancel_pending_reconnect();
        let cancel = self.lock_transport_cancel().take();
        let was = {
            let mut state = self.lock_state();
            state.generation += 1;
            let was = state.status;
            state.status = SessionStatus::Disconnected;
            state.error = None;
            state.caps = CapabilitySnapshot::default();
            state.reconnect_attempts = 0;
            was
        };
        *self.lock_peer() = None;
        if let Some(cancel) = cancel {
            cancel.cancel();
        }

        if was == SessionStatus::Connected {
            self.emit_status();
            self.events.publish(GatewayEvent::ServerDisconnected {
                server_id: self.id.clone(),
                name: self.config().name,
            });
        } else if was != SessionStatus::Disconnected {
            self.emit_status();
        }
    }

    pub fn cancel_pending_reconnect(&self) {
        if let Some(token) = self.lock_reconnect_cancel().take() {
            token.cancel();
        }
    }

    fn current_peer(&self) -> Result<Peer<RoleClient>, UpstreamCallError> {
        if self.status() != SessionStatus::Connected {
            return Err(UpstreamCallError::NotConnected);
        }
        self.lock_peer()
            .clone()
            .ok_or(UpstreamCallError::NotConnected)
    }

    fn transition(&self, status: SessionStatus, error: Option<String>) {
        {
            let mut state = self.lock_state();
            state.status = status;
            state.error = error;
            if status != SessionStatus::Connected {
                state.caps = CapabilitySnapshot::default();
            }
        }
        self.emit_status();
    }

    fn emit_status(&self) {
        let (status, error) = {
            let state = self.lock_state();
            (state.status, state.error.clone())
        };
        self.events.publish(GatewayEvent::ServerStatus {
            server_id: self.id.clone(),
            status,
            error,
        });
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, SessionState> {
        self.state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_peer(&self) -> std::sync::MutexGuard<'_, Option<Peer<RoleClient>>> {
        self.peer
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_transport_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.transport_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_reconnect_cancel(&self) -> std::sync::MutexGuard<'_, Option<CancellationToken>> {
        self.reconnect_cancel
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Backoff before retry number `failures` (1-based), jitter excluded:
/// 2s, 4s, 8s, 16s, 30s.
fn reconnect_delay(failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    RECONNECT_BASE_DELAY
        .saturating_mul(1u32 << exponent)
        .min(RECONNECT_MAX_DELAY)
}

fn build_http_client(headers: &BTreeMap<String, String>) -> Result<reqwest::Client> {
    let mut header_map = reqwest::header::HeaderMap::new();
    for (name, value) in headers {
        let header_name = reqwest::header::HeaderName::from_bytes(name.as_bytes())
            .with_context(|| format!("invalid header name '{name}'"))?;
        let header_value = reqwest::header::HeaderValue::from_str(value)
            .with_context(|| format!("invalid value for header '{name}'"))?;
        header_map.insert(header_name, header_value);
    }
    reqwest::Client::builder()
        .default_headers(header_map)
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
        .context("failed to build upstream HTTP client")
}

async fn probe_unauthorized(http: &reqwest::Client, url: &str) -> bool {
    match http.get(url).timeout(PROBE_TIMEOUT).send().await {
        Ok(response) => response.status() == reqwest::StatusCode::UNAUTHORIZED,
        Err(_) => false,
    }
}

/// Each of the three list calls may fail independently; a failure yields an
/// empty list for that capability without failing the session.
async fn discover_capabilities(peer: &Peer<RoleClient>, server_name: &str) -> CapabilitySnapshot {
    let tools = match timeout(DISCOVERY_TIMEOUT, peer.list_all_tools()).await {
        Ok(Ok(tools)) => tools.iter().map(tool_info).collect(),
        Ok(Err(err)) => {
            warn!(server = %server_name, error = %err, "tool discovery failed");
            Vec::new()
        }
        Err(_) => {
            warn!(server = %server_name, "tool discovery timed out");
            Vec::new()
        }
    };

    let resources = match timeout(DISCOVERY_TIMEOUT, peer.list_all_resources()).await {
        Ok(Ok(resources)) => resources.iter().map(resource_info).collect(),
        Ok(Err(err)) => {
            warn!(server = %server_name, error = %err, "resource discovery failed");
            Vec::new()
        }
        Err(_) => {
            warn!(server = %server_name, "resource discovery timed out");
            Vec::new()
        }
    };

    let prompts = match timeout(DISCOVERY_TIMEOUT, peer.list_all_prompts()).await {
        Ok(Ok(prompts)) => prompts.iter().map(prompt_info).collect(),
        Ok(Err(err)) => {
            warn!(server = %server_name, error = %err, "prompt discovery failed");
            Vec::new()
        }
        Err(_) => {
            warn!(server = %server_name, "prompt discovery timed out");
            Vec::new()
        }
    };

    CapabilitySnapshot {
        tools,
        resources,
        prompts,
    }
}

fn tool_info(tool: &rmcp::model::Tool) -> ToolInfo {
    ToolInfo {
        name: tool.name.to_string(),
        description: tool.description.as_ref().map(|d| d.to_string()),
        input_schema: Some(Value::Object(tool.input_schema.as_ref().clone())),
    }
}

fn resource_info(resource: &rmcp::model::Resource) -> ResourceInfo {
    ResourceInfo {
        uri: resource.raw.uri.clone(),
        name: resource.raw.name.clone(),
        description: resource.raw.description.clone(),
        mime_type: resource.raw.mime_type.clone(),
    }
}

fn prompt_info(prompt: &rmcp::model::Prompt) -> PromptInfo {
    PromptInfo {
        name: prompt.name.clone(),
        description: prompt.description.clone(),
        arguments: prompt
            .arguments
            .iter()
            .flatten()
            .map(|argument| PromptArgumentInfo {
                name: argument.name.clone(),
                description: argument.description.clone(),
                required: argument.required,
            })
            .collect(),
    }
}

/// `~` expansion happens at spawn time, not at store time.
fn expand_tilde(path: &str) -> PathBuf {
    if path == "~"
        && let Some(home) = dirs::home_dir()
    {
        return home;
    }
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    PathBuf::from(path)
}
