use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use futures::StreamExt;
use futures::stream::BoxStream;
use rmcp::RoleClient;
use rmcp::model::{ClientJsonRpcMessage, ServerJsonRpcMessage};
use rmcp::transport::worker::{Worker, WorkerConfig, WorkerContext, WorkerQuitReason};
use tokio::time::timeout;
use tracing::debug;
use url::Url;

const STREAM_OPEN_TIMEOUT: Duration = Duration::from_secs(10);
const ENDPOINT_WAIT: Duration = Duration::from_secs(15);
const POST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug)]
pub enum SseError {
    StreamOpen { detail: String },
    StreamFailed { detail: String },
    NoEndpoint,
    Post {
        status: Option<reqwest::StatusCode>,
        detail: String,
    },
    Decode(String),
    HandlerGone,
}

impl fmt::Display for SseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::StreamOpen { detail } => write!(f, "failed to open SSE stream: {detail}"),
            Self::StreamFailed { detail } => write!(f, "SSE stream failed: {detail}"),
            Self::NoEndpoint => write!(f, "upstream never announced a message endpoint"),
            Self::Post {
                status: Some(status),
                detail,
            } => write!(f, "message POST rejected with HTTP {status}: {detail}"),
            Self::Post {
                status: None,
                detail,
            } => write!(f, "message POST failed: {detail}"),
            Self::Decode(detail) => write!(f, "{detail}"),
            Self::HandlerGone => write!(f, "handler channel closed"),
        }
    }
}

impl std::error::Error for SseError {}

impl SseError {
    fn quit(self, context: &'static str) -> WorkerQuitReason<SseError> {
        WorkerQuitReason::Fatal {
            error: self,
            context: Cow::Borrowed(context),
        }
    }
}

/// Server-to-client half of the legacy SSE transport. Wraps the long-lived
/// GET response body and decodes its events.
struct EventStream {
    inner: BoxStream<'static, Result<sse_stream::Sse, sse_stream::Error>>,
}

impl EventStream {
    fn from_response(response: reqwest::Response) -> Self {
        let bytes = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        Self {
            inner: sse_stream::SseStream::from_byte_stream(bytes).boxed(),
        }
    }

    /// The first `endpoint` event names the URL that accepts our POSTed
    /// messages; nothing can be sent upstream until it arrives.
    async fn await_endpoint(&mut self) -> Result<String, SseError> {
        while let Some(event) = self.inner.next().await {
            let event = event.map_err(|err| SseError::StreamFailed {
                detail: err.to_string(),
            })?;
            if event.event.as_deref() != Some("endpoint") {
                continue;
            }
            return event
                .data
                .map(|data| data.trim().to_string())
                .filter(|endpoint| !endpoint.is_empty())
                .ok_or(SseError::NoEndpoint);
        }
        Err(SseError::NoEndpoint)
    }

    /// Next JSON-RPC message from the upstream. `Ok(None)` is an orderly
    /// end of stream; repeated `endpoint` events and dataless keep-alives
    /// are skipped.
    async fn next_server_message(&mut self) -> Result<Option<ServerJsonRpcMessage>, SseError> {
        while let Some(event) = self.inner.next().await {
            let event = event.map_err(|err| SseError::StreamFailed {
                detail: err.to_string(),
            })?;
            if event.event.as_deref() == Some("endpoint") {
                continue;
            }
            let Some(data) = event.data else {
                continue;
            };
            let message = serde_json::from_str(&data)
                .map_err(|err| SseError::Decode(format!("invalid server message: {err}")))?;
            return Ok(Some(message));
        }
        Ok(None)
    }
}

/// Legacy SSE upstream transport: one long-lived GET carries server
/// messages, client messages go out as POSTs to the endpoint the stream
/// announces. The MCP initialize exchange needs no special casing; it
/// flows through the same relay loop as every later message.
pub struct SseUpstreamWorker {
    http: reqwest::Client,
    stream_url: String,
    headers: BTreeMap<String, String>,
}

impl SseUpstreamWorker {
    pub fn new(
        http: reqwest::Client,
        stream_url: String,
        headers: BTreeMap<String, String>,
    ) -> Self {
        Self {
            http,
            stream_url,
            headers,
        }
    }

    fn decorated(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(name, value);
        }
        request
    }

    async fn open_event_stream(&self) -> Result<EventStream, SseError> {
        debug!(url = %self.stream_url, "opening SSE event stream");
        // Bound the open, not the stream: the response body stays live for
        // the whole session.
        let response = timeout(
            STREAM_OPEN_TIMEOUT,
            self.decorated(self.http.get(&self.stream_url)).send(),
        )
        .await
        .map_err(|_| SseError::StreamOpen {
            detail: format!("no response within {STREAM_OPEN_TIMEOUT:?}"),
        })?
        .map_err(|err| SseError::StreamOpen {
            detail: err.to_string(),
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(SseError::StreamOpen {
                detail: format!("upstream returned HTTP {status}"),
            });
        }
        Ok(EventStream::from_response(response))
    }

    /// Endpoint events may carry an absolute URL or a path relative to the
    /// stream URL; `Url::join` covers both.
    fn message_url(&self, endpoint: &str) -> Result<String, SseError> {
        let endpoint = endpoint.trim();
        if endpoint.is_empty() {
            return Err(SseError::NoEndpoint);
        }
        Url::parse(&self.stream_url)
            .and_then(|base| base.join(endpoint))
            .map(|resolved| resolved.to_string())
            .map_err(|err| {
                SseError::Decode(format!("cannot resolve endpoint '{endpoint}': {err}"))
            })
    }

    async fn post_message(
        &self,
        url: &str,
        message: &ClientJsonRpcMessage,
    ) -> Result<(), SseError> {
        let body = serde_json::to_vec(message)
            .map_err(|err| SseError::Decode(format!("cannot encode outgoing message: {err}")))?;

        let response = self
            .decorated(self.http.post(url))
            .timeout(POST_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .await
            .map_err(|err| SseError::Post {
                status: None,
                detail: err.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(SseError::Post {
                status: Some(status),
                detail,
            });
        }
        Ok(())
    }
}

impl Worker for SseUpstreamWorker {
    type Error = SseError;
    type Role = RoleClient;

    fn err_closed() -> Self::Error {
        SseError::HandlerGone
    }

    fn err_join(e: tokio::task::JoinError) -> Self::Error {
        SseError::StreamFailed {
            detail: format!("worker task failed: {e}"),
        }
    }

    fn config(&self) -> WorkerConfig {
        WorkerConfig {
            name: Some("sse-upstream".to_string()),
            channel_buffer_capacity: 16,
        }
    }

    async fn run(
        self,
        mut context: WorkerContext<Self>,
    ) -> Result<(), WorkerQuitReason<Self::Error>> {
        let mut events = self
            .open_event_stream()
            .await
            .map_err(|err| err.quit("open SSE stream"))?;

        let endpoint = timeout(ENDPOINT_WAIT, events.await_endpoint())
            .await
            .map_err(|_| SseError::NoEndpoint.quit("endpoint discovery"))?
            .map_err(|err| err.quit("endpoint discovery"))?;
        let post_url = self
            .message_url(&endpoint)
            .map_err(|err| err.quit("endpoint discovery"))?;
        debug!(post_url = %post_url, "SSE transport ready");

        loop {
            tokio::select! {
                biased;

                _ = context.cancellation_token.cancelled() => {
                    debug!("SSE worker cancelled");
                    return Err(WorkerQuitReason::Cancelled);
                }

                incoming = events.next_server_message() => match incoming {
                    Ok(Some(message)) => context.send_to_handler(message).await?,
                    Ok(None) => {
                        debug!("SSE stream ended");
                        return Ok(());
                    }
                    Err(err) => return Err(err.quit("SSE stream")),
                },

                outgoing = context.from_handler_rx.recv() => match outgoing {
                    Some(request) => {
                        self.post_message(&post_url, &request.message)
                            .await
                            .map_err(|err| err.quit("post message"))?;
                        let _ = request.responder.send(Ok(()));
                    }
                    None => return Err(WorkerQuitReason::HandlerTerminated),
                },
            }
        }
    }
}
