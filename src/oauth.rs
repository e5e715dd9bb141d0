use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{Rng, distributions::Alphanumeric};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use url::Url;

use crate::events::{EventBus, GatewayEvent};
use crate::store::{
    AuthConfig, ServerConfig, Store, StoredClientInfo, StoredTokens, now_epoch_s,
};

const OAUTH_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
const TOKEN_EXPIRY_LEAD: Duration = Duration::from_secs(60);
const CODE_VERIFIER_LENGTH: usize = 64;
const STATE_LENGTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OAuthErrorKind {
    DiscoveryFailed,
    DcrFailed,
    TokenExchangeFailed,
    TokenRefreshFailed,
    StateMismatch,
}

impl OAuthErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::DiscoveryFailed => "discovery_failed",
            Self::DcrFailed => "dcr_failed",
            Self::TokenExchangeFailed => "token_exchange_failed",
            Self::TokenRefreshFailed => "token_refresh_failed",
            Self::StateMismatch => "state_mismatch",
        }
    }
}

#[derive(Debug)]
pub struct OAuthError {
    pub kind: OAuthErrorKind,
    pub detail: String,
}

impl OAuthError {
    fn new(kind: OAuthErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for OAuthError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "oauth {}: {}", self.kind.as_str(), self.detail)
    }
}

impl std::error::Error for OAuthError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CredentialScope {
    All,
    Client,
    Tokens,
    Verifier,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthOutcome {
    Authorized,
    Redirect { auth_url: String },
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthStatus {
    pub requires_auth: bool,
    pub is_authenticated: bool,
    pub has_client_info: bool,
}

/// The statically-configured slice of an OAuth auth mode.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OauthClientSettings {
    pub client_id: Option<String>,
    pub client_secret: Option<String>,
    pub scopes: Vec<String>,
}

impl OauthClientSettings {
    pub fn from_auth(auth: &AuthConfig) -> Option<Self> {
        match auth {
            AuthConfig::Oauth {
                client_id,
                client_secret,
                scopes,
            } => Some(Self {
                client_id: client_id.clone(),
                client_secret: client_secret.clone(),
                scopes: scopes.clone(),
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Serialize)]
struct ClientMetadata {
    redirect_uris: Vec<String>,
    grant_types: Vec<&'static str>,
    response_types: Vec<&'static str>,
    token_endpoint_auth_method: &'static str,
    client_name: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ProtectedResourceMetadata {
    #[serde(default)]
    authorization_servers: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct AuthorizationServerMetadata {
    authorization_endpoint: String,
    token_endpoint: String,
    #[serde(default)]
    registration_endpoint: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
    #[serde(default)]
    client_id_issued_at: Option<u64>,
    #[serde(default)]
    client_secret_expires_at: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    token_type: Option<String>,
    #[serde(default)]
    expires_in: Option<u64>,
    #[serde(default)]
    scope: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

/// One per remote server id. Implements the callback contract an MCP
/// transport expects of an OAuth client, backed by the durable store.
pub struct OAuthProvider {
    server_id: String,
    server_url: String,
    settings: OauthClientSettings,
    gateway_base_url: String,
    store: Store,
    http: Client,
    events: EventBus,
    code_verifier_cache: Mutex<Option<String>>,
}

impl OAuthProvider {
    fn new(
        server_id: String,
        server_url: String,
        settings: OauthClientSettings,
        gateway_base_url: String,
        store: Store,
        http: Client,
        events: EventBus,
    ) -> Self {
        Self {
            server_id,
            server_url,
            settings,
            gateway_base_url,
            store,
            http,
            events,
            code_verifier_cache: Mutex::new(None),
        }
    }

    /// The encoded server id in the path is the routing key that survives
    /// the browser round-trip; the callback handler uses it to resume the
    /// right provider.
    pub fn redirect_url(&self) -> String {
        let encoded: String =
            url::form_urlencoded::byte_serialize(self.server_id.as_bytes()).collect();
        format!(
            "{}/oauth/callback/{encoded}",
            self.gateway_base_url.trim_end_matches('/')
        )
    }

    fn client_metadata(&self) -> ClientMetadata {
        ClientMetadata {
            redirect_uris: vec![self.redirect_url()],
            grant_types: vec!["authorization_code", "refresh_token"],
            response_types: vec!["code"],
            token_endpoint_auth_method: if self.settings.client_secret.is_some() {
                "client_secret_post"
            } else {
                "none"
            },
            client_name: "gatehouse",
            scope: (!self.settings.scopes.is_empty()).then(|| self.settings.scopes.join(" ")),
        }
    }

    /// Persisted info (from DCR or an earlier save) wins over the statically
    /// configured client id; absent both, the caller may run DCR.
    pub fn client_information(&self) -> Option<StoredClientInfo> {
        if let Some(stored) = self.store.get_client_info(&self.server_id) {
            return Some(stored);
        }
        self.settings.client_id.as_ref().map(|client_id| StoredClientInfo {
            client_id: client_id.clone(),
            client_secret: self.settings.client_secret.clone(),
            client_id_issued_at: None,
            client_secret_expires_at: None,
            extra: serde_json::Map::new(),
        })
    }

    pub fn save_client_information(&self, info: StoredClientInfo) {
        self.store.set_client_info(&self.server_id, info);
    }

    pub fn tokens(&self) -> Option<StoredTokens> {
        self.store.get_tokens(&self.server_id)
    }

    /// The one-shot verifier is cleared before this returns, so a completed
    /// flow never leaves a stale PKCE secret behind.
    pub fn save_tokens(&self, tokens: StoredTokens) {
        if let Ok(mut cache) = self.code_verifier_cache.lock() {
            *cache = None;
        }
        self.store.clear_code_verifier(&self.server_id);
        self.store.set_tokens(&self.server_id, tokens);
    }

    /// Does not redirect anything itself; the suspension is announced as an
    /// `oauth:required` event and the in-flight authorization waits for the
    /// callback leg.
    pub fn redirect_to_authorization(&self, auth_url: &str) {
        self.events.publish(GatewayEvent::OauthRequired {
            server_id: self.server_id.clone(),
            auth_url: auth_url.to_string(),
        });
    }

    /// Written to both memory and the store so a crash between redirect and
    /// callback does not orphan the flow.
    pub fn save_code_verifier(&self, verifier: String, state: String) {
        if let Ok(mut cache) = self.code_verifier_cache.lock() {
            *cache = Some(verifier.clone());
        }
        self.store.set_code_verifier(&self.server_id, verifier, state);
    }

    pub fn code_verifier(&self) -> Option<String> {
        if let Ok(cache) = self.code_verifier_cache.lock()
            && let Some(verifier) = cache.as_ref()
        {
            return Some(verifier.clone());
        }
        self.store.get_code_verifier(&self.server_id)
    }

    pub fn invalidate_credentials(&self, scope: CredentialScope) {
        match scope {
            CredentialScope::All => {
                if let Ok(mut cache) = self.code_verifier_cache.lock() {
                    *cache = None;
                }
                self.store.remove_oauth_state(&self.server_id);
            }
            CredentialScope::Client => self.store.remove_client_info(&self.server_id),
            CredentialScope::Tokens => self.store.remove_tokens(&self.server_id),
            CredentialScope::Verifier => {
                if let Ok(mut cache) = self.code_verifier_cache.lock() {
                    *cache = None;
                }
                self.store.clear_code_verifier(&self.server_id);
            }
        }
    }

    /// Runs the authorization routine up to (but excluding) the callback
    /// leg: reuse valid tokens, refresh expired ones, otherwise discover,
    /// register if needed, and emit the user redirect.
    pub async fn run_authorization(&self) -> Result<AuthOutcome, OAuthError> {
        if let Some(tokens) = self.tokens() {
            if !tokens.is_expired(TOKEN_EXPIRY_LEAD) {
                return Ok(AuthOutcome::Authorized);
            }
            if tokens.refresh_token.is_some() {
                match self.refresh_tokens().await {
                    Ok(_) => return Ok(AuthOutcome::Authorized),
                    Err(err) => {
                        warn!(
                            server_id = %self.server_id,
                            error = %err,
                            "token refresh failed; restarting authorization from scratch"
                        );
                        self.invalidate_credentials(CredentialScope::Tokens);
                    }
                }
            } else {
                self.invalidate_credentials(CredentialScope::Tokens);
            }
        }

        let metadata = self.discover().await?;
        let client = self.ensure_client(&metadata).await?;

        let verifier = random_url_safe(CODE_VERIFIER_LENGTH);
        let state = random_url_safe(STATE_LENGTH);
        let challenge = pkce_challenge(&verifier);
        self.save_code_verifier(verifier, state.clone());

        let mut auth_url = Url::parse(&metadata.authorization_endpoint).map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!(
                    "invalid authorization endpoint '{}': {err}",
                    metadata.authorization_endpoint
                ),
            )
        })?;
        {
            let mut query = auth_url.query_pairs_mut();
            query.append_pair("response_type", "code");
            query.append_pair("client_id", &client.client_id);
            query.append_pair("redirect_uri", &self.redirect_url());
            query.append_pair("state", &state);
            query.append_pair("code_challenge", &challenge);
            query.append_pair("code_challenge_method", "S256");
            if !self.settings.scopes.is_empty() {
                query.append_pair("scope", &self.settings.scopes.join(" "));
            }
        }

        let auth_url = auth_url.to_string();
        self.redirect_to_authorization(&auth_url);
        Ok(AuthOutcome::Redirect { auth_url })
    }

    /// The token-exchange half of the flow, driven by the callback route.
    pub async fn exchange_code(&self, code: &str, state: &str) -> Result<(), OAuthError> {
        let expected_state = self.store.get_auth_state(&self.server_id);
        if expected_state.as_deref() != Some(state) {
            return Err(OAuthError::new(
                OAuthErrorKind::StateMismatch,
                "callback state does not match the pending authorization",
            ));
        }
        let Some(verifier) = self.code_verifier() else {
            return Err(OAuthError::new(
                OAuthErrorKind::StateMismatch,
                "no authorization is in flight for this server",
            ));
        };

        let metadata = self.discover().await?;
        let client = self.ensure_client(&metadata).await?;

        let redirect_uri = self.redirect_url();
        let mut form = vec![
            ("grant_type", "authorization_code".to_string()),
            ("code", code.to_string()),
            ("redirect_uri", redirect_uri),
            ("client_id", client.client_id.clone()),
            ("code_verifier", verifier),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                OAuthError::new(
                    OAuthErrorKind::TokenExchangeFailed,
                    format!("token request failed: {err}"),
                )
            })?;
        let response = check_status(response, OAuthErrorKind::TokenExchangeFailed).await?;
        let token_response: TokenResponse = response.json().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::TokenExchangeFailed,
                format!("token response JSON is invalid: {err}"),
            )
        })?;

        self.save_tokens(build_tokens(token_response, None));
        Ok(())
    }

    pub async fn refresh_tokens(&self) -> Result<StoredTokens, OAuthError> {
        let Some(existing) = self.tokens() else {
            return Err(OAuthError::new(
                OAuthErrorKind::TokenRefreshFailed,
                "no tokens stored for this server",
            ));
        };
        let Some(refresh_token) = existing.refresh_token.clone() else {
            return Err(OAuthError::new(
                OAuthErrorKind::TokenRefreshFailed,
                "stored tokens do not include a refresh token",
            ));
        };

        let metadata = self.discover().await?;
        let client = self.ensure_client(&metadata).await?;

        let mut form = vec![
            ("grant_type", "refresh_token".to_string()),
            ("refresh_token", refresh_token.clone()),
            ("client_id", client.client_id.clone()),
        ];
        if let Some(secret) = &client.client_secret {
            form.push(("client_secret", secret.clone()));
        }

        let response = self
            .http
            .post(&metadata.token_endpoint)
            .form(&form)
            .send()
            .await
            .map_err(|err| {
                OAuthError::new(
                    OAuthErrorKind::TokenRefreshFailed,
                    format!("refresh request failed: {err}"),
                )
            })?;
        let response = check_status(response, OAuthErrorKind::TokenRefreshFailed).await?;
        let token_response: TokenResponse = response.json().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::TokenRefreshFailed,
                format!("refresh response JSON is invalid: {err}"),
            )
        })?;

        let tokens = build_tokens(token_response, Some(refresh_token));
        self.save_tokens(tokens.clone());
        Ok(tokens)
    }

    /// A currently-valid access token, refreshing through the stored refresh
    /// token when the old one has expired. `None` means a user round-trip is
    /// required.
    pub async fn access_token(&self) -> Result<Option<String>, OAuthError> {
        let Some(tokens) = self.tokens() else {
            return Ok(None);
        };
        if !tokens.is_expired(TOKEN_EXPIRY_LEAD) {
            return Ok(Some(tokens.access_token));
        }
        if tokens.refresh_token.is_none() {
            self.invalidate_credentials(CredentialScope::Tokens);
            return Ok(None);
        }
        match self.refresh_tokens().await {
            Ok(refreshed) => Ok(Some(refreshed.access_token)),
            Err(err) => {
                warn!(
                    server_id = %self.server_id,
                    error = %err,
                    "access token refresh failed; clearing tokens"
                );
                self.invalidate_credentials(CredentialScope::Tokens);
                Ok(None)
            }
        }
    }

    async fn discover(&self) -> Result<AuthorizationServerMetadata, OAuthError> {
        let issuer = match self.fetch_protected_resource().await {
            Ok(Some(issuer)) => issuer,
            Ok(None) | Err(_) => origin_of(&self.server_url).map_err(|err| {
                OAuthError::new(OAuthErrorKind::DiscoveryFailed, err.to_string())
            })?,
        };

        let oauth_url = well_known_url(&issuer, "oauth-authorization-server")?;
        match self.fetch_as_metadata(&oauth_url).await {
            Ok(metadata) => return Ok(metadata),
            Err(err) => {
                debug!(
                    url = %oauth_url,
                    error = %err,
                    "authorization-server metadata unavailable, trying OpenID Connect discovery"
                );
            }
        }

        let oidc_url = well_known_url(&issuer, "openid-configuration")?;
        self.fetch_as_metadata(&oidc_url).await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("no authorization server metadata at '{issuer}': {err}"),
            )
        })
    }

    async fn fetch_protected_resource(&self) -> Result<Option<String>, OAuthError> {
        let url = well_known_url(&self.server_url, "oauth-protected-resource")?;
        let response = self.http.get(&url).send().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("protected-resource request failed: {err}"),
            )
        })?;
        if !response.status().is_success() {
            return Ok(None);
        }
        let metadata: ProtectedResourceMetadata = response.json().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("protected-resource metadata is invalid JSON: {err}"),
            )
        })?;
        Ok(metadata.authorization_servers.into_iter().next())
    }

    async fn fetch_as_metadata(
        &self,
        url: &str,
    ) -> Result<AuthorizationServerMetadata, OAuthError> {
        let response = self.http.get(url).send().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("metadata request failed for '{url}': {err}"),
            )
        })?;
        let response = check_status(response, OAuthErrorKind::DiscoveryFailed).await?;
        response.json().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("metadata at '{url}' is invalid JSON: {err}"),
            )
        })
    }

    async fn ensure_client(
        &self,
        metadata: &AuthorizationServerMetadata,
    ) -> Result<StoredClientInfo, OAuthError> {
        if let Some(client) = self.client_information() {
            return Ok(client);
        }
        let Some(registration_endpoint) = &metadata.registration_endpoint else {
            return Err(OAuthError::new(
                OAuthErrorKind::DcrFailed,
                "no client_id configured and the authorization server offers no registration endpoint",
            ));
        };

        let response = self
            .http
            .post(registration_endpoint)
            .json(&self.client_metadata())
            .send()
            .await
            .map_err(|err| {
                OAuthError::new(
                    OAuthErrorKind::DcrFailed,
                    format!("registration request failed: {err}"),
                )
            })?;
        let response = check_status(response, OAuthErrorKind::DcrFailed).await?;
        let registered: RegistrationResponse = response.json().await.map_err(|err| {
            OAuthError::new(
                OAuthErrorKind::DcrFailed,
                format!("registration response JSON is invalid: {err}"),
            )
        })?;

        let info = StoredClientInfo {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            client_id_issued_at: registered.client_id_issued_at,
            client_secret_expires_at: registered.client_secret_expires_at,
            extra: serde_json::Map::new(),
        };
        self.save_client_information(info.clone());
        Ok(info)
    }
}

/// Registry of providers keyed by server id; the entry points the REST
/// surface and the upstream sessions go through.
#[derive(Clone)]
pub struct OAuthManager {
    inner: Arc<OAuthManagerInner>,
}

struct OAuthManagerInner {
    store: Store,
    events: EventBus,
    gateway_base_url: String,
    http: Client,
    providers: Mutex<HashMap<String, Arc<OAuthProvider>>>,
}

impl OAuthManager {
    pub fn new(store: Store, events: EventBus, gateway_base_url: String) -> Self {
        let http = Client::builder()
            .timeout(OAUTH_HTTP_TIMEOUT)
            .build()
            .unwrap_or_else(|err| {
                warn!(error = %err, "failed to build configured OAuth HTTP client; using defaults");
                Client::new()
            });
        Self {
            inner: Arc::new(OAuthManagerInner {
                store,
                events,
                gateway_base_url,
                http,
                providers: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn lock_providers(&self) -> std::sync::MutexGuard<'_, HashMap<String, Arc<OAuthProvider>>> {
        self.inner
            .providers
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns (or lazily creates) the provider for a server. A provider
    /// whose settings no longer match the config is replaced in place.
    pub fn get_provider(&self, config: &ServerConfig) -> Result<Arc<OAuthProvider>, OAuthError> {
        let Some(remote) = config.transport.remote() else {
            return Err(OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("server '{}' is not a remote server", config.name),
            ));
        };
        let Some(settings) = OauthClientSettings::from_auth(&remote.auth) else {
            return Err(OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("server '{}' is not configured for oauth", config.name),
            ));
        };

        let mut providers = self.lock_providers();
        if let Some(existing) = providers.get(&config.id)
            && existing.settings == settings
            && existing.server_url == remote.url
        {
            return Ok(Arc::clone(existing));
        }

        let provider = Arc::new(OAuthProvider::new(
            config.id.clone(),
            remote.url.clone(),
            settings,
            self.inner.gateway_base_url.clone(),
            self.inner.store.clone(),
            self.inner.http.clone(),
            self.inner.events.clone(),
        ));
        providers.insert(config.id.clone(), Arc::clone(&provider));
        Ok(provider)
    }

    pub fn replace_provider(&self, config: &ServerConfig) -> Result<(), OAuthError> {
        self.lock_providers().remove(&config.id);
        self.get_provider(config).map(|_| ())
    }

    pub fn remove_provider(&self, server_id: &str) {
        self.lock_providers().remove(server_id);
    }

    pub async fn initiate_auth(&self, server_id: &str) -> Result<AuthOutcome, OAuthError> {
        let config = self.require_config(server_id)?;
        self.get_provider(&config)?.run_authorization().await
    }

    pub async fn handle_callback(
        &self,
        server_id: &str,
        code: &str,
        state: &str,
    ) -> Result<AuthOutcome, OAuthError> {
        let config = self.require_config(server_id)?;
        self.get_provider(&config)?
            .exchange_code(code, state)
            .await?;
        Ok(AuthOutcome::Authorized)
    }

    pub fn get_auth_status(&self, server_id: &str) -> AuthStatus {
        let Some(config) = self.inner.store.get_server(server_id) else {
            return AuthStatus {
                requires_auth: false,
                is_authenticated: false,
                has_client_info: false,
            };
        };
        let requires_auth = config.transport.auth().is_oauth();
        let tokens = self.inner.store.get_tokens(server_id);
        let is_authenticated = tokens.as_ref().is_some_and(|tokens| {
            !tokens.is_expired(TOKEN_EXPIRY_LEAD) || tokens.refresh_token.is_some()
        });
        let has_client_info = self.inner.store.get_client_info(server_id).is_some()
            || OauthClientSettings::from_auth(config.transport.auth())
                .is_some_and(|settings| settings.client_id.is_some());
        AuthStatus {
            requires_auth,
            is_authenticated,
            has_client_info,
        }
    }

    /// Clears all persisted OAuth state and drops the provider so a future
    /// connect starts from a clean slate.
    pub fn revoke_tokens(&self, server_id: &str) {
        self.inner.store.remove_oauth_state(server_id);
        self.remove_provider(server_id);
    }

    /// Token supplier for upstream connects: `Ok(None)` means a user
    /// consent round-trip is still required.
    pub async fn access_token_for(
        &self,
        config: &ServerConfig,
    ) -> Result<Option<String>, OAuthError> {
        self.get_provider(config)?.access_token().await
    }

    fn require_config(&self, server_id: &str) -> Result<ServerConfig, OAuthError> {
        self.inner.store.get_server(server_id).ok_or_else(|| {
            OAuthError::new(
                OAuthErrorKind::DiscoveryFailed,
                format!("unknown server '{server_id}'"),
            )
        })
    }
}

fn pkce_challenge(verifier: &str) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}

fn random_url_safe(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn build_tokens(response: TokenResponse, previous_refresh: Option<String>) -> StoredTokens {
    StoredTokens {
        access_token: response.access_token,
        token_type: response.token_type.unwrap_or_else(|| "Bearer".to_string()),
        expires_in: response.expires_in,
        scope: response.scope,
        // Some servers rotate refresh tokens, some omit them on refresh;
        // keep the old one when no replacement arrives.
        refresh_token: response.refresh_token.or(previous_refresh),
        obtained_at: now_epoch_s(),
        extra: serde_json::Map::new(),
    }
}

fn origin_of(raw: &str) -> anyhow::Result<String> {
    let parsed = Url::parse(raw)?;
    let mut origin = format!(
        "{}://{}",
        parsed.scheme(),
        parsed
            .host_str()
            .ok_or_else(|| anyhow::anyhow!("url '{raw}' has no host"))?
    );
    if let Some(port) = parsed.port() {
        origin.push_str(&format!(":{port}"));
    }
    Ok(origin)
}

fn well_known_url(base: &str, suffix: &str) -> Result<String, OAuthError> {
    let origin = origin_of(base).map_err(|err| {
        OAuthError::new(OAuthErrorKind::DiscoveryFailed, err.to_string())
    })?;
    Ok(format!("{origin}/.well-known/{suffix}"))
}

async fn check_status(
    response: reqwest::Response,
    kind: OAuthErrorKind,
) -> Result<reqwest::Response, OAuthError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response
        .text()
        .await
        .unwrap_or_else(|_| "<unreadable>".to_string());
    Err(OAuthError::new(kind, format!("HTTP {status}: {body}")))
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};

    use axum::{
        Form, Json, Router,
        extract::State,
        routing::{get, post},
    };
    use serde_json::json;

    use super::{AuthOutcome, CredentialScope, OAuthErrorKind, OAuthManager, pkce_challenge};
    use crate::events::EventBus;
    use crate::store::{AuthConfig, NewServer, RemoteConfig, Store, TransportConfig};

    struct SimulatedProvider {
        base_url: String,
        handle: tokio::task::JoinHandle<()>,
    }

    impl Drop for SimulatedProvider {
        fn drop(&mut self) {
            self.handle.abort();
        }
    }

    #[derive(Clone)]
    struct ProviderState {
        base_url: String,
    }

    async fn spawn_provider() -> SimulatedProvider {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0))
            .await
            .expect("bind provider listener");
        let addr = listener.local_addr().expect("provider addr");
        let base_url = format!("http://{addr}");

        let state = ProviderState {
            base_url: base_url.clone(),
        };
        let app = Router::new()
            .route(
                "/.well-known/oauth-protected-resource",
                get(|State(state): State<ProviderState>| async move {
                    Json(json!({"authorization_servers": [state.base_url]}))
                }),
            )
            .route(
                "/.well-known/oauth-authorization-server",
                get(|State(state): State<ProviderState>| async move {
                    Json(json!({
                        "authorization_endpoint": format!("{}/authorize", state.base_url),
                        "token_endpoint": format!("{}/token", state.base_url),
                        "registration_endpoint": format!("{}/register", state.base_url),
                        "code_challenge_methods_supported": ["S256"],
                    }))
                }),
            )
            .route(
                "/register",
                post(|| async {
                    Json(json!({"client_id": "registered-client", "client_id_issued_at": 1}))
                }),
            )
            .route(
                "/token",
                post(|Form(form): Form<HashMap<String, String>>| async move {
                    match form.get("grant_type").map(String::as_str) {
                        Some("authorization_code") => {
                            if form.get("code_verifier").is_none_or(String::is_empty) {
                                return Json(json!({"error": "invalid_request"}));
                            }
                            Json(json!({
                                "access_token": "access-initial",
                                "refresh_token": "refresh-initial",
                                "token_type": "Bearer",
                                "expires_in": 1800,
                                "scope": "read write"
                            }))
                        }
                        Some("refresh_token") => {
                            if form.get("refresh_token").map(String::as_str)
                                != Some("refresh-initial")
                            {
                                return Json(json!({"error": "invalid_grant"}));
                            }
                            Json(json!({
                                "access_token": "access-refreshed",
                                "token_type": "Bearer",
                                "expires_in": 3600
                            }))
                        }
                        _ => Json(json!({"error": "unsupported_grant_type"})),
                    }
                }),
            )
            .with_state(state);

        let handle = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        SimulatedProvider { base_url, handle }
    }

    fn manager_with_server(
        provider_base: &str,
        client_id: Option<&str>,
    ) -> (tempfile::TempDir, Store, OAuthManager, String) {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = Store::open(temp.path()).expect("store opens");
        let added = store
            .add_server(NewServer {
                name: "example".to_string(),
                enabled: false,
                transport: TransportConfig::StreamableHttp(RemoteConfig {
                    url: format!("{provider_base}/mcp"),
                    headers: BTreeMap::new(),
                    auth: AuthConfig::Oauth {
                        client_id: client_id.map(str::to_string),
                        client_secret: None,
                        scopes: vec!["read".to_string()],
                    },
                    oauth: None,
                }),
            })
            .expect("add server");
        let manager = OAuthManager::new(
            store.clone(),
            EventBus::new(),
            "http://127.0.0.1:4280".to_string(),
        );
        (temp, store, manager, added.id)
    }

    fn query_param(url: &str, key: &str) -> Option<String> {
        url::Url::parse(url)
            .ok()?
            .query_pairs()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.into_owned())
    }

    #[test]
    fn pkce_challenge_is_base64url_sha256() {
        // RFC 7636 appendix B test vector.
        let verifier = "dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk";
        assert_eq!(
            pkce_challenge(verifier),
            "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM"
        );
    }

    #[tokio::test]
    async fn initiate_builds_pkce_redirect_with_discovery() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, Some("cid"));

        let outcome = manager.initiate_auth(&id).await.expect("initiate");
        let AuthOutcome::Redirect { auth_url } = outcome else {
            panic!("expected redirect outcome");
        };

        assert!(auth_url.starts_with(&format!("{}/authorize", provider.base_url)));
        assert_eq!(
            query_param(&auth_url, "code_challenge_method").as_deref(),
            Some("S256")
        );
        assert_eq!(query_param(&auth_url, "client_id").as_deref(), Some("cid"));
        assert!(query_param(&auth_url, "state").is_some());
        assert!(
            query_param(&auth_url, "redirect_uri")
                .is_some_and(|uri| uri.ends_with(&format!("/oauth/callback/{id}")))
        );
        assert!(
            store.get_code_verifier(&id).is_some(),
            "verifier must be persisted while the flow is in flight"
        );
    }

    #[tokio::test]
    async fn callback_exchanges_code_and_clears_verifier() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, Some("cid"));

        let AuthOutcome::Redirect { auth_url } =
            manager.initiate_auth(&id).await.expect("initiate")
        else {
            panic!("expected redirect");
        };
        let state = query_param(&auth_url, "state").expect("state param");

        let outcome = manager
            .handle_callback(&id, "auth-code", &state)
            .await
            .expect("callback");
        assert_eq!(outcome, AuthOutcome::Authorized);

        let tokens = store.get_tokens(&id).expect("tokens persisted");
        assert_eq!(tokens.access_token, "access-initial");
        assert_eq!(tokens.refresh_token.as_deref(), Some("refresh-initial"));
        assert!(
            store.get_code_verifier(&id).is_none(),
            "verifier must be cleared once tokens are saved"
        );

        let status = manager.get_auth_status(&id);
        assert!(status.requires_auth);
        assert!(status.is_authenticated);
        assert!(status.has_client_info);
    }

    #[tokio::test]
    async fn callback_rejects_state_mismatch() {
        let provider = spawn_provider().await;
        let (_temp, _store, manager, id) = manager_with_server(&provider.base_url, Some("cid"));

        manager.initiate_auth(&id).await.expect("initiate");
        let err = manager
            .handle_callback(&id, "auth-code", "wrong-state")
            .await
            .expect_err("mismatched state must fail");
        assert_eq!(err.kind, OAuthErrorKind::StateMismatch);
    }

    #[tokio::test]
    async fn dcr_registers_when_no_client_configured() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, None);

        let AuthOutcome::Redirect { auth_url } =
            manager.initiate_auth(&id).await.expect("initiate")
        else {
            panic!("expected redirect");
        };
        assert_eq!(
            query_param(&auth_url, "client_id").as_deref(),
            Some("registered-client")
        );
        let info = store.get_client_info(&id).expect("client info persisted");
        assert_eq!(info.client_id, "registered-client");
    }

    #[tokio::test]
    async fn refresh_preserves_unrotated_refresh_token() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, Some("cid"));

        let AuthOutcome::Redirect { auth_url } =
            manager.initiate_auth(&id).await.expect("initiate")
        else {
            panic!("expected redirect");
        };
        let state = query_param(&auth_url, "state").expect("state param");
        manager
            .handle_callback(&id, "auth-code", &state)
            .await
            .expect("callback");

        let config = store.get_server(&id).expect("config");
        let refreshed = manager
            .get_provider(&config)
            .expect("provider")
            .refresh_tokens()
            .await
            .expect("refresh");
        assert_eq!(refreshed.access_token, "access-refreshed");
        assert_eq!(
            refreshed.refresh_token.as_deref(),
            Some("refresh-initial"),
            "missing rotation must keep the previous refresh token"
        );
    }

    #[tokio::test]
    async fn revoke_clears_everything() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, Some("cid"));

        let AuthOutcome::Redirect { auth_url } =
            manager.initiate_auth(&id).await.expect("initiate")
        else {
            panic!("expected redirect");
        };
        let state = query_param(&auth_url, "state").expect("state param");
        manager
            .handle_callback(&id, "auth-code", &state)
            .await
            .expect("callback");

        manager.revoke_tokens(&id);
        assert!(store.get_tokens(&id).is_none());
        assert!(!manager.get_auth_status(&id).is_authenticated);
    }

    #[tokio::test]
    async fn invalidate_scopes_clear_exact_subsets() {
        let provider = spawn_provider().await;
        let (_temp, store, manager, id) = manager_with_server(&provider.base_url, None);

        let AuthOutcome::Redirect { auth_url } =
            manager.initiate_auth(&id).await.expect("initiate")
        else {
            panic!("expected redirect");
        };
        let state = query_param(&auth_url, "state").expect("state param");
        manager
            .handle_callback(&id, "auth-code", &state)
            .await
            .expect("callback");

        let config = store.get_server(&id).expect("config");
        let provider_handle = manager.get_provider(&config).expect("provider");

        provider_handle.invalidate_credentials(CredentialScope::Tokens);
        assert!(store.get_tokens(&id).is_none());
        assert!(store.get_client_info(&id).is_some());

        provider_handle.invalidate_credentials(CredentialScope::All);
        assert!(store.get_client_info(&id).is_none());
    }
}
