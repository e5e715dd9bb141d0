use std::convert::Infallible;
use std::time::Instant;

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Redirect, Response},
    routing::{get, post},
};
use futures::stream::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use crate::events::EventBus;
use crate::gateway::{Gateway, GatewayError};
use crate::oauth::{AuthOutcome, OAuthManager};
use crate::request_log::{LogFilter, RequestLog};
use crate::store::{NewServer, ServerUpdate};

#[derive(Clone)]
pub struct AppState {
    pub gateway: Gateway,
    pub oauth: OAuthManager,
    pub events: EventBus,
    pub request_log: RequestLog,
    pub started: Instant,
}

#[derive(Debug, Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

fn ok<T: Serialize>(data: T) -> Json<ApiResponse<T>> {
    Json(ApiResponse {
        success: true,
        data: Some(data),
        error: None,
    })
}

struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<GatewayError> for ApiError {
    fn from(err: GatewayError) -> Self {
        let status = match &err {
            GatewayError::ConfigNotFound(_)
            | GatewayError::NoSuchTool(_)
            | GatewayError::NoSuchResource(_)
            | GatewayError::NoSuchPrompt(_) => StatusCode::NOT_FOUND,
            GatewayError::DuplicateName(_)
            | GatewayError::NotConnected(_)
            | GatewayError::AwaitingOauth(_) => StatusCode::CONFLICT,
            GatewayError::InvalidConfig(_) => StatusCode::BAD_REQUEST,
            GatewayError::Upstream { .. }
            | GatewayError::Transport(_)
            | GatewayError::OAuth(_) => StatusCode::BAD_GATEWAY,
            GatewayError::StorePersist(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        Self {
            status,
            message: err.to_string(),
        }
    }
}

impl From<crate::oauth::OAuthError> for ApiError {
    fn from(err: crate::oauth::OAuthError) -> Self {
        Self {
            status: StatusCode::BAD_GATEWAY,
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(ApiResponse::<Value> {
                success: false,
                data: None,
                error: Some(self.message),
            }),
        )
            .into_response()
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/servers", get(list_servers).post(create_server))
        .route(
            "/servers/{id}",
            get(get_server).patch(patch_server).delete(remove_server),
        )
        .route("/servers/{id}/connect", post(connect_server))
        .route("/servers/{id}/disconnect", post(disconnect_server))
        .route("/servers/{id}/reconnect", post(reconnect_server))
        .route("/servers/{id}/refresh", post(refresh_server))
        .route("/servers/{id}/enable", post(enable_server))
        .route("/servers/{id}/disable", post(disable_server))
        .route("/servers/{id}/auth/status", get(auth_status))
        .route("/servers/{id}/auth/initiate", post(auth_initiate))
        .route("/servers/{id}/auth/revoke", post(auth_revoke))
        .route("/tools", get(list_tools))
        .route("/tools/call", post(call_tool))
        .route("/resources", get(list_resources))
        .route("/prompts", get(list_prompts))
        .route("/events", get(event_stream))
        .route("/logs", get(list_logs).delete(clear_logs))
        .route("/logs/stats", get(log_stats))
        .route("/logs/{id}", get(get_log))
        .route("/oauth/callback/{server_id}", get(oauth_callback))
        .with_state(state)
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let (total, connected) = state.gateway.connected_count().await;
    ok(json!({
        "status": "ok",
        "servers": {"total": total, "connected": connected},
        "uptime": state.started.elapsed().as_secs(),
    }))
}

async fn list_servers(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.gateway.get_all_server_statuses().await)
}

async fn create_server(
    State(state): State<AppState>,
    Json(new): Json<NewServer>,
) -> Result<impl IntoResponse, ApiError> {
    let config = state.gateway.register_server(new).await?;
    let view = state.gateway.get_server_status(&config.id).await?;
    Ok((StatusCode::CREATED, ok(view)))
}

async fn get_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn patch_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(update): Json<ServerUpdate>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.update_server(&id, update).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn remove_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.remove_server(&id).await?;
    Ok(ok(json!({"removed": id})))
}

async fn connect_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.connect_server(&id).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn disconnect_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.disconnect_server(&id).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn reconnect_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.reconnect_server(&id).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn refresh_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.refresh_server(&id).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn enable_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.set_server_enabled(&id, true).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn disable_server(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.set_server_enabled(&id, false).await?;
    Ok(ok(state.gateway.get_server_status(&id).await?))
}

async fn auth_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.get_server_status(&id).await?;
    Ok(ok(state.oauth.get_auth_status(&id)))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InitiateResponse {
    result: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth_url: Option<String>,
}

async fn auth_initiate(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.get_server_status(&id).await?;
    let outcome = state.oauth.initiate_auth(&id).await?;
    let response = match outcome {
        AuthOutcome::Authorized => InitiateResponse {
            result: "AUTHORIZED",
            auth_url: None,
        },
        AuthOutcome::Redirect { auth_url } => InitiateResponse {
            result: "REDIRECT",
            auth_url: Some(auth_url),
        },
    };
    Ok(ok(response))
}

async fn auth_revoke(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.gateway.get_server_status(&id).await?;
    state.oauth.revoke_tokens(&id);
    Ok(ok(json!({"revoked": id})))
}

async fn list_tools(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.gateway.get_all_tools().await)
}

#[derive(Debug, Deserialize)]
struct CallToolRequest {
    name: String,
    #[serde(default)]
    arguments: Option<Map<String, Value>>,
}

async fn call_tool(
    State(state): State<AppState>,
    Json(request): Json<CallToolRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let result = state
        .gateway
        .call_tool_by_name(
            &request.name,
            request.arguments,
            tokio_util::sync::CancellationToken::new(),
        )
        .await?;
    Ok(ok(result))
}

async fn list_resources(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.gateway.get_all_resources().await)
}

async fn list_prompts(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.gateway.get_all_prompts().await)
}

/// SSE mapping of the event bus: one JSON-encoded `GatewayEvent` per event.
async fn event_stream(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let event = match Event::default().json_data(&event) {
                        Ok(event) => event,
                        Err(err) => {
                            warn!(error = %err, "failed to encode gateway event for SSE");
                            continue;
                        }
                    };
                    return Some((Ok(event), rx));
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn list_logs(
    State(state): State<AppState>,
    Query(filter): Query<LogFilter>,
) -> impl IntoResponse {
    ok(state.request_log.snapshot(&filter))
}

async fn log_stats(State(state): State<AppState>) -> impl IntoResponse {
    ok(state.request_log.stats())
}

async fn get_log(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    state.request_log.get(&id).map(ok).ok_or(ApiError {
        status: StatusCode::NOT_FOUND,
        message: format!("log entry '{id}' not found"),
    })
}

async fn clear_logs(State(state): State<AppState>) -> impl IntoResponse {
    state.request_log.clear();
    ok(json!({"cleared": true}))
}

#[derive(Debug, Deserialize)]
struct OAuthCallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

/// The OAuth redirect target. Success resumes the suspended session and
/// bounces the browser back to the UI; every failure mode lands on the UI
/// with an error message instead of a bare 500.
async fn oauth_callback(
    State(state): State<AppState>,
    Path(server_id): Path<String>,
    Query(query): Query<OAuthCallbackQuery>,
) -> Redirect {
    if let Some(error) = query.error {
        let detail = query.error_description.unwrap_or(error);
        return error_redirect(&server_id, &detail);
    }
    let (Some(code), Some(auth_state)) = (query.code, query.state) else {
        return error_redirect(&server_id, "missing code or state parameter");
    };

    match state
        .oauth
        .handle_callback(&server_id, &code, &auth_state)
        .await
    {
        Ok(_) => {
            info!(server_id = %server_id, "oauth callback completed; reconnecting");
            let gateway = state.gateway.clone();
            let server_id_for_connect = server_id.clone();
            tokio::spawn(async move {
                if let Err(err) = gateway.on_oauth_complete(&server_id_for_connect).await {
                    warn!(
                        server_id = %server_id_for_connect,
                        error = %err,
                        "reconnect after oauth completion failed"
                    );
                }
            });
            Redirect::to(&format!(
                "/?oauth=success&serverId={}",
                urlencode(&server_id)
            ))
        }
        Err(err) => error_redirect(&server_id, &err.to_string()),
    }
}

fn error_redirect(server_id: &str, message: &str) -> Redirect {
    Redirect::to(&format!(
        "/?oauth=error&serverId={}&message={}",
        urlencode(server_id),
        urlencode(message)
    ))
}

fn urlencode(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes()).collect()
}
