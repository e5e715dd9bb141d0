use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use fs2::FileExt;
use rand::{Rng, distributions::Alphanumeric};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tracing::{error, warn};

#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use crate::naming::normalize_prefix;

pub const STORE_FILE_NAME: &str = "gateway.json";
const LOCK_FILE_NAME: &str = ".lock";
const FLUSH_COALESCE_DELAY: Duration = Duration::from_millis(200);
const SERVER_ID_LENGTH: usize = 16;

pub fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

pub fn now_epoch_s() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

pub fn new_opaque_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SERVER_ID_LENGTH)
        .map(char::from)
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Stdio,
    Sse,
    StreamableHttp,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Stdio => "stdio",
            Self::Sse => "sse",
            Self::StreamableHttp => "streamable_http",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum AuthConfig {
    #[default]
    None,
    Oauth {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        client_secret: Option<String>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        scopes: Vec<String>,
    },
    Bearer {
        token: String,
    },
    ApiKey {
        key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header_value_prefix: Option<String>,
    },
    Custom {
        headers: BTreeMap<String, String>,
    },
}

impl AuthConfig {
    pub fn is_oauth(&self) -> bool {
        matches!(self, Self::Oauth { .. })
    }
}

/// Static header set for non-OAuth auth modes, composed once per connection.
/// OAuth injects nothing here; tokens are supplied on demand by the provider.
pub fn build_auth_headers(auth: &AuthConfig) -> BTreeMap<String, String> {
    match auth {
        AuthConfig::None | AuthConfig::Oauth { .. } => BTreeMap::new(),
        AuthConfig::Bearer { token } => {
            let mut headers = BTreeMap::new();
            headers.insert("Authorization".to_string(), format!("Bearer {token}"));
            headers
        }
        AuthConfig::ApiKey {
            key,
            header_name,
            header_value_prefix,
        } => {
            let name = header_name.clone().unwrap_or_else(|| "X-API-Key".to_string());
            let value = match header_value_prefix {
                Some(prefix) => format!("{prefix}{key}"),
                None => key.clone(),
            };
            let mut headers = BTreeMap::new();
            headers.insert(name, value);
            headers
        }
        AuthConfig::Custom { headers } => headers.clone(),
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StdioConfig {
    pub command: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub args: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
}

/// Pre-dates the tagged `auth` union; migrated on load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LegacyOauthConfig {
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub client_secret: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteConfig {
    pub url: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oauth: Option<LegacyOauthConfig>,
}

impl RemoteConfig {
    fn migrate_legacy_oauth(&mut self) {
        if let Some(legacy) = self.oauth.take()
            && matches!(self.auth, AuthConfig::None)
        {
            self.auth = AuthConfig::Oauth {
                client_id: legacy.client_id,
                client_secret: legacy.client_secret,
                scopes: legacy.scopes,
            };
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "transport", rename_all = "snake_case")]
pub enum TransportConfig {
    Stdio(StdioConfig),
    Sse(RemoteConfig),
    StreamableHttp(RemoteConfig),
}

impl TransportConfig {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::Stdio(_) => TransportKind::Stdio,
            Self::Sse(_) => TransportKind::Sse,
            Self::StreamableHttp(_) => TransportKind::StreamableHttp,
        }
    }

    pub fn remote(&self) -> Option<&RemoteConfig> {
        match self {
            Self::Stdio(_) => None,
            Self::Sse(remote) | Self::StreamableHttp(remote) => Some(remote),
        }
    }

    pub fn stdio(&self) -> Option<&StdioConfig> {
        match self {
            Self::Stdio(stdio) => Some(stdio),
            _ => None,
        }
    }

    pub fn auth(&self) -> &AuthConfig {
        static NONE: AuthConfig = AuthConfig::None;
        self.remote().map(|remote| &remote.auth).unwrap_or(&NONE)
    }

    /// Stable digest of everything that forces a reconnect when it changes:
    /// command/args/env/cwd for stdio, url/headers/auth for remotes.
    pub fn connection_fingerprint(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    fn migrate_legacy(&mut self) {
        match self {
            Self::Stdio(_) => {}
            Self::Sse(remote) | Self::StreamableHttp(remote) => remote.migrate_legacy_oauth(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    pub id: String,
    pub name: String,
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: TransportConfig,
    pub created_at: u64,
    pub updated_at: u64,
}

impl ServerConfig {
    pub fn prefix(&self) -> String {
        normalize_prefix(&self.name)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServer {
    pub name: String,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(flatten)]
    pub transport: TransportConfig,
}

fn default_enabled() -> bool {
    true
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ServerUpdate {
    pub name: Option<String>,
    pub enabled: Option<bool>,
    pub transport: Option<TransportKind>,
    pub command: Option<String>,
    pub args: Option<Vec<String>>,
    pub env: Option<BTreeMap<String, String>>,
    pub cwd: Option<String>,
    pub url: Option<String>,
    pub headers: Option<BTreeMap<String, String>>,
    pub auth: Option<AuthConfig>,
}

#[derive(Debug, Clone)]
pub struct UpdatedServer {
    pub config: ServerConfig,
    pub connection_changed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredClientInfo {
    pub client_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id_issued_at: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret_expires_at: Option<u64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredTokens {
    pub access_token: String,
    pub token_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub obtained_at: u64,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl StoredTokens {
    /// Expiry check with a lead window so tokens are refreshed before the
    /// upstream starts rejecting them.
    pub fn is_expired(&self, lead: Duration) -> bool {
        let Some(expires_in) = self.expires_in else {
            return false;
        };
        let deadline = self.obtained_at.saturating_add(expires_in);
        now_epoch_s().saturating_add(lead.as_secs()) >= deadline
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OAuthPersistedState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_info: Option<StoredClientInfo>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tokens: Option<StoredTokens>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub code_verifier: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth_state: Option<String>,
}

impl OAuthPersistedState {
    fn is_empty(&self) -> bool {
        self.client_info.is_none()
            && self.tokens.is_none()
            && self.code_verifier.is_none()
            && self.auth_state.is_none()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct PersistedState {
    servers: Vec<ServerConfig>,
    oauth_state: BTreeMap<String, OAuthPersistedState>,
}

#[derive(Debug)]
pub enum StoreError {
    NotFound(String),
    DuplicateName(String),
    InvalidConfig(String),
    Persist(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotFound(id) => write!(f, "server '{id}' not found"),
            Self::DuplicateName(name) => write!(f, "server name '{name}' is already taken"),
            Self::InvalidConfig(reason) => write!(f, "invalid server config: {reason}"),
            Self::Persist(detail) => write!(f, "failed to persist store: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

struct StoreInner {
    file: PathBuf,
    state: Mutex<PersistedState>,
    dirty: AtomicBool,
    flush_pending: Mutex<Option<JoinHandle<()>>>,
    // Serialises disk writes so an in-flight write can never rename a stale
    // snapshot over a newer one.
    write_lock: tokio::sync::Mutex<()>,
    _lock: File,
}

/// Durable `{servers, oauthState}` JSON store. Mutations land in memory
/// immediately and are flushed to disk through a short coalescing window;
/// `flush()`/`close()` block until the bytes are on disk. Every write goes
/// through a sibling temp file and an atomic rename.
#[derive(Clone)]
pub struct Store {
    inner: Arc<StoreInner>,
}

impl Store {
    pub fn open(data_dir: &Path) -> Result<Self> {
        fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create {}", data_dir.display()))?;
        // Secrets live here: OAuth tokens, API keys, PKCE verifiers.
        #[cfg(unix)]
        fs::set_permissions(data_dir, fs::Permissions::from_mode(0o700))
            .with_context(|| format!("failed to restrict {}", data_dir.display()))?;

        let lock_path = data_dir.join(LOCK_FILE_NAME);
        let mut lock_options = OpenOptions::new();
        lock_options.create(true).read(true).write(true);
        #[cfg(unix)]
        lock_options.mode(0o600);
        let lock = lock_options
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;
        lock.try_lock_exclusive().with_context(|| {
            format!(
                "another gatehouse instance owns {}; stop it or use its REST API",
                data_dir.display()
            )
        })?;

        let file = data_dir.join(STORE_FILE_NAME);
        let mut state = load_state(&file);
        for server in &mut state.servers {
            server.transport.migrate_legacy();
        }

        Ok(Self {
            inner: Arc::new(StoreInner {
                file,
                state: Mutex::new(state),
                dirty: AtomicBool::new(false),
                flush_pending: Mutex::new(None),
                write_lock: tokio::sync::Mutex::new(()),
                _lock: lock,
            }),
        })
    }

    pub fn list_servers(&self) -> Vec<ServerConfig> {
        self.state(|state| state.servers.clone())
    }

    pub fn get_server(&self, id: &str) -> Option<ServerConfig> {
        self.state(|state| state.servers.iter().find(|s| s.id == id).cloned())
    }

    pub fn get_server_by_name(&self, name: &str) -> Option<ServerConfig> {
        self.state(|state| {
            state
                .servers
                .iter()
                .find(|s| s.name.eq_ignore_ascii_case(name))
                .cloned()
        })
    }

    pub fn add_server(&self, new: NewServer) -> Result<ServerConfig, StoreError> {
        let name = new.name.trim().to_string();
        validate_name(&name)?;
        let mut transport = new.transport;
        transport.migrate_legacy();
        validate_transport(&transport)?;

        let now = now_epoch_ms();
        let config = ServerConfig {
            id: new_opaque_id(),
            name,
            enabled: new.enabled,
            transport,
            created_at: now,
            updated_at: now,
        };

        {
            let mut state = self.lock_state();
            reject_collisions(&state.servers, &config.name, None)?;
            if state.servers.iter().any(|s| s.id == config.id) {
                return Err(StoreError::DuplicateName(config.id.clone()));
            }
            state.servers.push(config.clone());
        }
        self.schedule_flush();
        Ok(config)
    }

    pub fn update_server(
        &self,
        id: &str,
        update: ServerUpdate,
    ) -> Result<UpdatedServer, StoreError> {
        let result = {
            let mut state = self.lock_state();

            if let Some(name) = &update.name {
                let name = name.trim();
                validate_name(name)?;
                reject_collisions(&state.servers, name, Some(id))?;
            }

            let Some(server) = state.servers.iter_mut().find(|s| s.id == id) else {
                return Err(StoreError::NotFound(id.to_string()));
            };

            if update
                .transport
                .is_some_and(|kind| kind != server.transport.kind())
            {
                return Err(StoreError::InvalidConfig(
                    "transport is immutable after creation".to_string(),
                ));
            }

            // Apply onto a copy first so a failed validation leaves the
            // live config untouched.
            let before = server.transport.connection_fingerprint();
            let mut candidate = server.clone();
            apply_update(&mut candidate, update)?;
            validate_transport(&candidate.transport)?;
            candidate.updated_at = now_epoch_ms();

            let connection_changed = candidate.transport.connection_fingerprint() != before;
            *server = candidate.clone();

            UpdatedServer {
                connection_changed,
                config: candidate,
            }
        };
        self.schedule_flush();
        Ok(result)
    }

    pub fn remove_server(&self, id: &str) -> Result<ServerConfig, StoreError> {
        let removed = {
            let mut state = self.lock_state();
            let Some(index) = state.servers.iter().position(|s| s.id == id) else {
                return Err(StoreError::NotFound(id.to_string()));
            };
            state.oauth_state.remove(id);
            state.servers.remove(index)
        };
        self.schedule_flush();
        Ok(removed)
    }

    pub fn get_tokens(&self, id: &str) -> Option<StoredTokens> {
        self.state(|state| state.oauth_state.get(id).and_then(|s| s.tokens.clone()))
    }

    pub fn set_tokens(&self, id: &str, tokens: StoredTokens) {
        self.mutate_oauth(id, |entry| entry.tokens = Some(tokens));
    }

    pub fn remove_tokens(&self, id: &str) {
        self.mutate_oauth(id, |entry| entry.tokens = None);
    }

    pub fn get_client_info(&self, id: &str) -> Option<StoredClientInfo> {
        self.state(|state| {
            state
                .oauth_state
                .get(id)
                .and_then(|s| s.client_info.clone())
        })
    }

    pub fn set_client_info(&self, id: &str, info: StoredClientInfo) {
        self.mutate_oauth(id, |entry| entry.client_info = Some(info));
    }

    pub fn remove_client_info(&self, id: &str) {
        self.mutate_oauth(id, |entry| entry.client_info = None);
    }

    pub fn get_code_verifier(&self, id: &str) -> Option<String> {
        self.state(|state| {
            state
                .oauth_state
                .get(id)
                .and_then(|s| s.code_verifier.clone())
        })
    }

    pub fn set_code_verifier(&self, id: &str, verifier: String, auth_state: String) {
        self.mutate_oauth(id, |entry| {
            entry.code_verifier = Some(verifier);
            entry.auth_state = Some(auth_state);
        });
    }

    pub fn get_auth_state(&self, id: &str) -> Option<String> {
        self.state(|state| state.oauth_state.get(id).and_then(|s| s.auth_state.clone()))
    }

    pub fn clear_code_verifier(&self, id: &str) {
        self.mutate_oauth(id, |entry| {
            entry.code_verifier = None;
            entry.auth_state = None;
        });
    }

    pub fn remove_oauth_state(&self, id: &str) {
        {
            let mut state = self.lock_state();
            state.oauth_state.remove(id);
        }
        self.schedule_flush();
    }

    pub async fn flush(&self) -> Result<(), StoreError> {
        if let Ok(mut pending) = self.inner.flush_pending.lock()
            && let Some(handle) = pending.take()
        {
            handle.abort();
        }
        self.inner.dirty.store(false, Ordering::Release);
        self.write_now().await
    }

    pub async fn close(&self) -> Result<(), StoreError> {
        self.flush().await
    }

    fn state<T>(&self, f: impl FnOnce(&PersistedState) -> T) -> T {
        f(&self.lock_state())
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PersistedState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn mutate_oauth(&self, id: &str, f: impl FnOnce(&mut OAuthPersistedState)) {
        {
            let mut state = self.lock_state();
            let entry = state.oauth_state.entry(id.to_string()).or_default();
            f(entry);
            if entry.is_empty() {
                state.oauth_state.remove(id);
            }
        }
        self.schedule_flush();
    }

    /// Coalesces bursts of mutations into one disk write. The writer task
    /// keeps draining the dirty flag, so a mutation landing mid-write is
    /// picked up by the next pass rather than lost.
    fn schedule_flush(&self) {
        self.inner.dirty.store(true, Ordering::Release);
        let Ok(mut pending) = self.inner.flush_pending.lock() else {
            return;
        };
        if pending.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }
        let store = self.clone();
        *pending = Some(tokio::spawn(async move {
            while store.inner.dirty.swap(false, Ordering::AcqRel) {
                tokio::time::sleep(FLUSH_COALESCE_DELAY).await;
                if let Err(err) = store.write_now().await {
                    error!(error = %err, "store flush failed; in-memory state remains authoritative");
                }
            }
        }));
    }

    async fn write_now(&self) -> Result<(), StoreError> {
        let _guard = self.inner.write_lock.lock().await;
        let snapshot = self.state(Clone::clone);
        let file = self.inner.file.clone();
        tokio::task::spawn_blocking(move || persist_json(&file, &snapshot))
            .await
            .map_err(|err| StoreError::Persist(format!("flush task failed: {err}")))?
    }
}

fn load_state(file: &Path) -> PersistedState {
    let raw = match fs::read_to_string(file) {
        Ok(raw) => raw,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
            return PersistedState::default();
        }
        Err(err) => {
            warn!(
                path = %file.display(),
                error = %err,
                "failed to read store file; starting from empty state"
            );
            return PersistedState::default();
        }
    };

    match serde_json::from_str(&raw) {
        Ok(state) => state,
        Err(err) => {
            warn!(
                path = %file.display(),
                error = %err,
                "store file is not valid JSON; replacing with empty state (previous contents ignored)"
            );
            PersistedState::default()
        }
    }
}

fn apply_update(server: &mut ServerConfig, update: ServerUpdate) -> Result<(), StoreError> {
    if let Some(name) = update.name {
        server.name = name.trim().to_string();
    }
    if let Some(enabled) = update.enabled {
        server.enabled = enabled;
    }

    match &mut server.transport {
        TransportConfig::Stdio(stdio) => {
            if update.url.is_some() || update.headers.is_some() || update.auth.is_some() {
                return Err(StoreError::InvalidConfig(
                    "url/headers/auth do not apply to stdio servers".to_string(),
                ));
            }
            if let Some(command) = update.command {
                stdio.command = command;
            }
            if let Some(args) = update.args {
                stdio.args = args;
            }
            if let Some(env) = update.env {
                stdio.env = env;
            }
            if let Some(cwd) = update.cwd {
                stdio.cwd = if cwd.is_empty() { None } else { Some(cwd) };
            }
        }
        TransportConfig::Sse(remote) | TransportConfig::StreamableHttp(remote) => {
            if update.command.is_some() || update.args.is_some() || update.env.is_some() {
                return Err(StoreError::InvalidConfig(
                    "command/args/env do not apply to remote servers".to_string(),
                ));
            }
            if let Some(url) = update.url {
                remote.url = url;
            }
            if let Some(headers) = update.headers {
                remote.headers = headers;
            }
            if let Some(auth) = update.auth {
                remote.auth = auth;
            }
        }
    }
    Ok(())
}

fn validate_name(name: &str) -> Result<(), StoreError> {
    if name.is_empty() {
        return Err(StoreError::InvalidConfig(
            "server name cannot be empty".to_string(),
        ));
    }
    if normalize_prefix(name).is_empty() {
        return Err(StoreError::InvalidConfig(format!(
            "server name '{name}' normalizes to an empty prefix"
        )));
    }
    Ok(())
}

fn reject_collisions(
    servers: &[ServerConfig],
    name: &str,
    exempt_id: Option<&str>,
) -> Result<(), StoreError> {
    let prefix = normalize_prefix(name);
    for server in servers {
        if exempt_id.is_some_and(|id| id == server.id) {
            continue;
        }
        if server.name.eq_ignore_ascii_case(name) || server.prefix() == prefix {
            return Err(StoreError::DuplicateName(name.to_string()));
        }
    }
    Ok(())
}

fn validate_transport(transport: &TransportConfig) -> Result<(), StoreError> {
    match transport {
        TransportConfig::Stdio(stdio) => {
            if stdio.command.trim().is_empty() {
                return Err(StoreError::InvalidConfig(
                    "stdio command cannot be empty".to_string(),
                ));
            }
        }
        TransportConfig::Sse(remote) | TransportConfig::StreamableHttp(remote) => {
            let parsed = url::Url::parse(&remote.url).map_err(|err| {
                StoreError::InvalidConfig(format!("invalid url '{}': {err}", remote.url))
            })?;
            if parsed.scheme() != "http" && parsed.scheme() != "https" {
                return Err(StoreError::InvalidConfig(format!(
                    "unsupported url scheme '{}', expected http/https",
                    parsed.scheme()
                )));
            }
            if parsed.host_str().is_none() {
                return Err(StoreError::InvalidConfig(
                    "server url must include a host".to_string(),
                ));
            }
        }
    }
    Ok(())
}

fn persist_err(stage: &str, path: &Path, err: impl fmt::Display) -> StoreError {
    StoreError::Persist(format!("{stage} for {}: {err}", path.display()))
}

/// The whole document is staged into a sibling temp file that already
/// carries owner-only permissions, fsynced, and renamed over the canonical
/// file. A crash at any point leaves either the old store or the new one on
/// disk, never a torn mix.
fn persist_json<T: Serialize>(path: &Path, document: &T) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .ok_or_else(|| persist_err("resolve parent", path, "no parent directory"))?;

    let mut encoded = serde_json::to_vec_pretty(document)
        .map_err(|err| persist_err("encode store", path, err))?;
    encoded.push(b'\n');

    let mut staged = tempfile::Builder::new()
        .prefix(".gateway-json.")
        .tempfile_in(dir)
        .map_err(|err| persist_err("stage temp file", path, err))?;

    // Permissions go on before any secret bytes do, and the rename carries
    // them onto the canonical file.
    #[cfg(unix)]
    staged
        .as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(|err| persist_err("restrict temp file", path, err))?;

    staged
        .as_file_mut()
        .write_all(&encoded)
        .and_then(|()| staged.as_file().sync_all())
        .map_err(|err| persist_err("write temp file", path, err))?;

    staged
        .persist(path)
        .map_err(|err| persist_err("replace store file", path, err.error))?;

    // The rename is only durable once the directory entry is too.
    #[cfg(unix)]
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| persist_err("sync directory", path, err))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use super::{
        AuthConfig, NewServer, RemoteConfig, ServerUpdate, StdioConfig, Store, StoreError,
        TransportConfig, TransportKind, build_auth_headers,
    };

    fn stdio_server(name: &str) -> NewServer {
        NewServer {
            name: name.to_string(),
            enabled: false,
            transport: TransportConfig::Stdio(StdioConfig {
                command: "echo-mcp".to_string(),
                args: vec!["-root".to_string(), "/tmp".to_string()],
                env: BTreeMap::new(),
                cwd: None,
            }),
        }
    }

    fn remote_server(name: &str, auth: AuthConfig) -> NewServer {
        NewServer {
            name: name.to_string(),
            enabled: false,
            transport: TransportConfig::StreamableHttp(RemoteConfig {
                url: "https://mcp.example/v1".to_string(),
                headers: BTreeMap::new(),
                auth,
                oauth: None,
            }),
        }
    }

    fn open_store() -> (tempfile::TempDir, Store) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("store opens");
        (temp, store)
    }

    #[tokio::test]
    async fn add_get_roundtrip_preserves_config() {
        let (_temp, store) = open_store();
        let added = store.add_server(stdio_server("fs")).expect("add server");

        let loaded = store.get_server(&added.id).expect("server exists");
        assert_eq!(loaded.name, "fs");
        assert_eq!(loaded.transport, added.transport);
        assert_eq!(loaded.created_at, added.created_at);

        let by_name = store.get_server_by_name("FS").expect("case-insensitive");
        assert_eq!(by_name.id, added.id);
    }

    #[tokio::test]
    async fn duplicate_names_and_prefixes_are_rejected() {
        let (_temp, store) = open_store();
        store.add_server(stdio_server("Foo Bar")).expect("first add");

        let same_name = store.add_server(stdio_server("foo bar"));
        assert!(matches!(same_name, Err(StoreError::DuplicateName(_))));

        // "Foo-Bar" normalizes to the same foo_bar prefix.
        let same_prefix = store.add_server(stdio_server("Foo-Bar"));
        assert!(matches!(same_prefix, Err(StoreError::DuplicateName(_))));
    }

    #[tokio::test]
    async fn symbol_only_names_are_rejected() {
        let (_temp, store) = open_store();
        let err = store.add_server(stdio_server("!!!"));
        assert!(matches!(err, Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn transport_is_immutable() {
        let (_temp, store) = open_store();
        let added = store.add_server(stdio_server("fs")).expect("add server");

        let err = store.update_server(
            &added.id,
            ServerUpdate {
                transport: Some(TransportKind::Sse),
                ..Default::default()
            },
        );
        assert!(matches!(err, Err(StoreError::InvalidConfig(_))));
    }

    #[tokio::test]
    async fn update_reports_connection_changes() {
        let (_temp, store) = open_store();
        let added = store
            .add_server(remote_server("remote", AuthConfig::None))
            .expect("add server");

        let renamed = store
            .update_server(
                &added.id,
                ServerUpdate {
                    name: Some("renamed".to_string()),
                    ..Default::default()
                },
            )
            .expect("rename");
        assert!(!renamed.connection_changed);
        assert!(renamed.config.updated_at >= added.updated_at);

        let retargeted = store
            .update_server(
                &added.id,
                ServerUpdate {
                    url: Some("https://mcp.example/v2".to_string()),
                    ..Default::default()
                },
            )
            .expect("url update");
        assert!(retargeted.connection_changed);

        let reauthed = store
            .update_server(
                &added.id,
                ServerUpdate {
                    auth: Some(AuthConfig::Bearer {
                        token: "abc".to_string(),
                    }),
                    ..Default::default()
                },
            )
            .expect("auth update");
        assert!(reauthed.connection_changed);
    }

    #[tokio::test]
    async fn remove_drops_oauth_state_atomically() {
        let (_temp, store) = open_store();
        let added = store
            .add_server(remote_server(
                "oauthed",
                AuthConfig::Oauth {
                    client_id: None,
                    client_secret: None,
                    scopes: vec![],
                },
            ))
            .expect("add server");

        store.set_code_verifier(&added.id, "verifier".to_string(), "state".to_string());
        assert!(store.get_code_verifier(&added.id).is_some());

        store.remove_server(&added.id).expect("remove");
        assert!(store.get_server(&added.id).is_none());
        assert!(store.get_code_verifier(&added.id).is_none());
        assert!(store.get_tokens(&added.id).is_none());
    }

    #[tokio::test]
    async fn flush_persists_and_reload_restores() {
        let temp = tempfile::tempdir().expect("tempdir");
        let id = {
            let store = Store::open(temp.path()).expect("store opens");
            let added = store.add_server(stdio_server("fs")).expect("add server");
            store.flush().await.expect("flush");
            store.close().await.expect("close");
            added.id
        };

        let reopened = Store::open(temp.path()).expect("store reopens");
        let loaded = reopened.get_server(&id).expect("server survived restart");
        assert_eq!(loaded.name, "fs");
    }

    #[tokio::test]
    async fn malformed_store_file_falls_back_to_empty() {
        let temp = tempfile::tempdir().expect("tempdir");
        std::fs::write(temp.path().join(super::STORE_FILE_NAME), "{not json")
            .expect("write garbage");

        let store = Store::open(temp.path()).expect("store opens anyway");
        assert!(store.list_servers().is_empty());
    }

    #[tokio::test]
    async fn legacy_oauth_field_is_migrated() {
        let temp = tempfile::tempdir().expect("tempdir");
        let raw = serde_json::json!({
            "servers": [{
                "id": "legacy1234567890",
                "name": "legacy",
                "enabled": false,
                "transport": "sse",
                "url": "https://mcp.example/sse",
                "oauth": {"clientId": "static-client", "scopes": ["read"]},
                "createdAt": 1,
                "updatedAt": 1
            }],
            "oauthState": {}
        });
        std::fs::write(
            temp.path().join(super::STORE_FILE_NAME),
            serde_json::to_string_pretty(&raw).unwrap(),
        )
        .expect("write legacy store");

        let store = Store::open(temp.path()).expect("store opens");
        let server = store.get_server("legacy1234567890").expect("loaded");
        match server.transport.auth() {
            AuthConfig::Oauth {
                client_id, scopes, ..
            } => {
                assert_eq!(client_id.as_deref(), Some("static-client"));
                assert_eq!(scopes, &["read".to_string()]);
            }
            other => panic!("expected migrated oauth auth, got {other:?}"),
        }
    }

    #[test]
    fn auth_headers_cover_every_mode() {
        assert!(build_auth_headers(&AuthConfig::None).is_empty());
        assert!(
            build_auth_headers(&AuthConfig::Oauth {
                client_id: None,
                client_secret: None,
                scopes: vec![],
            })
            .is_empty(),
            "oauth must not inject static headers"
        );

        let bearer = build_auth_headers(&AuthConfig::Bearer {
            token: "abc".to_string(),
        });
        assert_eq!(bearer.get("Authorization").map(String::as_str), Some("Bearer abc"));

        let default_key = build_auth_headers(&AuthConfig::ApiKey {
            key: "k".to_string(),
            header_name: None,
            header_value_prefix: None,
        });
        assert_eq!(default_key.get("X-API-Key").map(String::as_str), Some("k"));

        let custom_key = build_auth_headers(&AuthConfig::ApiKey {
            key: "k".to_string(),
            header_name: Some("X-Key".to_string()),
            header_value_prefix: Some("Key ".to_string()),
        });
        assert_eq!(custom_key.get("X-Key").map(String::as_str), Some("Key k"));

        let mut map = BTreeMap::new();
        map.insert("X-Custom".to_string(), "v".to_string());
        let custom = build_auth_headers(&AuthConfig::Custom { headers: map });
        assert_eq!(custom.get("X-Custom").map(String::as_str), Some("v"));
    }

    #[tokio::test]
    async fn second_instance_cannot_take_the_lock() {
        let temp = tempfile::tempdir().expect("tempdir");
        let _store = Store::open(temp.path()).expect("first open");
        assert!(Store::open(temp.path()).is_err());
    }
}
