use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::events::{EventBus, GatewayEvent};
use crate::store::now_epoch_ms;

pub const DEFAULT_LOG_CAPACITY: usize = 500;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestKind {
    Tool,
    Resource,
    Prompt,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStatus {
    Pending,
    Success,
    Error,
}

impl LogStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UpstreamRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogResponse {
    pub content: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_error: Option<bool>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestLogEntry {
    pub id: String,
    pub timestamp: u64,
    #[serde(rename = "type")]
    pub kind: RequestKind,
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub original_method: Option<String>,
    pub upstream: UpstreamRef,
    pub arguments: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<LogResponse>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub downstream_session_id: Option<String>,
    pub status: LogStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip)]
    started_at: Option<Instant>,
}

pub struct LogStart {
    pub kind: RequestKind,
    pub method: String,
    pub original_method: Option<String>,
    pub server_id: String,
    pub server_name: String,
    pub arguments: Value,
    pub downstream_session_id: Option<String>,
}

#[derive(Debug, Default, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LogFilter {
    #[serde(rename = "type")]
    pub kind: Option<RequestKind>,
    pub server_id: Option<String>,
    pub status: Option<LogStatus>,
    pub query: Option<String>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub offset: Option<usize>,
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogStats {
    pub total: usize,
    pub pending: usize,
    pub success: usize,
    pub error: usize,
    pub tools: usize,
    pub resources: usize,
    pub prompts: usize,
}

/// Bounded newest-first ring of proxied upstream calls.
#[derive(Clone)]
pub struct RequestLog {
    inner: Arc<Mutex<VecDeque<RequestLogEntry>>>,
    capacity: usize,
    events: EventBus,
}

impl RequestLog {
    pub fn new(capacity: usize, events: EventBus) -> Self {
        let capacity = if capacity == 0 {
            DEFAULT_LOG_CAPACITY
        } else {
            capacity
        };
        Self {
            inner: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
            events,
        }
    }

    pub fn start(&self, params: LogStart) -> String {
        let id = crate::store::new_opaque_id();
        let entry = RequestLogEntry {
            id: id.clone(),
            timestamp: now_epoch_ms(),
            kind: params.kind,
            method: params.method,
            original_method: params.original_method,
            upstream: UpstreamRef {
                id: params.server_id,
                name: params.server_name,
            },
            arguments: params.arguments,
            response: None,
            duration_ms: None,
            downstream_session_id: params.downstream_session_id,
            status: LogStatus::Pending,
            error_message: None,
            started_at: Some(Instant::now()),
        };

        if let Ok(mut guard) = self.inner.lock() {
            while guard.len() >= self.capacity {
                let _ = guard.pop_back();
            }
            guard.push_front(entry);
        }

        self.events.publish(GatewayEvent::LogStarted {
            log_id: id.clone(),
        });
        id
    }

    pub fn complete(&self, id: &str, content: Value, is_error: bool) {
        self.finish(id, LogStatus::Success, Some((content, is_error)), None);
    }

    pub fn fail(&self, id: &str, error_message: impl Into<String>) {
        self.finish(id, LogStatus::Error, None, Some(error_message.into()));
    }

    fn finish(
        &self,
        id: &str,
        status: LogStatus,
        response: Option<(Value, bool)>,
        error_message: Option<String>,
    ) {
        if let Ok(mut guard) = self.inner.lock()
            && let Some(entry) = guard.iter_mut().find(|entry| entry.id == id)
        {
            entry.status = status;
            entry.duration_ms = entry
                .started_at
                .map(|started| started.elapsed().as_millis() as u64);
            entry.error_message = error_message;
            entry.response = response.map(|(content, is_error)| LogResponse {
                content,
                is_error: is_error.then_some(true),
            });
        }

        self.events.publish(GatewayEvent::LogCompleted {
            log_id: id.to_string(),
            status: status.as_str().to_string(),
        });
    }

    pub fn get(&self, id: &str) -> Option<RequestLogEntry> {
        self.inner
            .lock()
            .ok()?
            .iter()
            .find(|entry| entry.id == id)
            .cloned()
    }

    pub fn snapshot(&self, filter: &LogFilter) -> Vec<RequestLogEntry> {
        let Ok(guard) = self.inner.lock() else {
            return Vec::new();
        };

        let query = filter.query.as_deref().map(str::to_lowercase);
        let matches = guard.iter().filter(|entry| {
            if filter.kind.is_some_and(|kind| kind != entry.kind) {
                return false;
            }
            if filter
                .server_id
                .as_deref()
                .is_some_and(|id| id != entry.upstream.id)
            {
                return false;
            }
            if filter.status.is_some_and(|status| status != entry.status) {
                return false;
            }
            if filter.since.is_some_and(|since| entry.timestamp < since) {
                return false;
            }
            if filter.until.is_some_and(|until| entry.timestamp > until) {
                return false;
            }
            if let Some(query) = &query {
                let haystack = format!(
                    "{} {} {}",
                    entry.method.to_lowercase(),
                    entry.upstream.name.to_lowercase(),
                    entry
                        .error_message
                        .as_deref()
                        .unwrap_or_default()
                        .to_lowercase()
                );
                if !haystack.contains(query) {
                    return false;
                }
            }
            true
        });

        matches
            .skip(filter.offset.unwrap_or(0))
            .take(filter.limit.unwrap_or(usize::MAX))
            .cloned()
            .collect()
    }

    pub fn stats(&self) -> LogStats {
        let Ok(guard) = self.inner.lock() else {
            return LogStats {
                total: 0,
                pending: 0,
                success: 0,
                error: 0,
                tools: 0,
                resources: 0,
                prompts: 0,
            };
        };

        let mut stats = LogStats {
            total: guard.len(),
            pending: 0,
            success: 0,
            error: 0,
            tools: 0,
            resources: 0,
            prompts: 0,
        };
        for entry in guard.iter() {
            match entry.status {
                LogStatus::Pending => stats.pending += 1,
                LogStatus::Success => stats.success += 1,
                LogStatus::Error => stats.error += 1,
            }
            match entry.kind {
                RequestKind::Tool => stats.tools += 1,
                RequestKind::Resource => stats.resources += 1,
                RequestKind::Prompt => stats.prompts += 1,
            }
        }
        stats
    }

    pub fn clear(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.clear();
        }
    }
}
