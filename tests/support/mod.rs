#![allow(dead_code)]

use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde_json::{Value, json};
use tokio::process::{Child, Command};

const START_TIMEOUT: Duration = Duration::from_secs(15);
const POLL_INTERVAL: Duration = Duration::from_millis(100);

pub fn gatehouse_bin() -> &'static str {
    env!("CARGO_BIN_EXE_gatehouse")
}

/// A gateway daemon spawned on an ephemeral port with an isolated data dir.
pub struct GatewayProc {
    pub base_url: String,
    pub http: reqwest::Client,
    child: Child,
    _temp: Option<tempfile::TempDir>,
}

impl GatewayProc {
    pub async fn spawn() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let mut proc = Self::spawn_in(temp.path()).await?;
        proc._temp = Some(temp);
        Ok(proc)
    }

    /// Spawns against an existing data dir; used to exercise restarts.
    pub async fn spawn_in(data_dir: &std::path::Path) -> Result<Self> {
        let port = free_port()?;
        let base_url = format!("http://127.0.0.1:{port}");

        let mut command = Command::new(gatehouse_bin());
        command
            .arg("serve")
            .arg("--host")
            .arg("127.0.0.1")
            .arg("--port")
            .arg(port.to_string())
            .arg("--data-dir")
            .arg(data_dir)
            .kill_on_drop(true);
        let child = command.spawn().context("failed to spawn gatehouse")?;

        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(10))
            .build()
            .context("failed to build test HTTP client")?;

        let proc = Self {
            base_url,
            http,
            child,
            _temp: None,
        };
        proc.wait_for_health().await?;
        Ok(proc)
    }

    async fn wait_for_health(&self) -> Result<()> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        while tokio::time::Instant::now() < deadline {
            if let Ok(response) = self
                .http
                .get(format!("{}/health", self.base_url))
                .send()
                .await
                && response.status().is_success()
            {
                return Ok(());
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("gatehouse did not become healthy within {START_TIMEOUT:?}")
    }

    pub async fn get(&self, path: &str) -> Result<(u16, Value)> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn post(&self, path: &str, body: Value) -> Result<(u16, Value)> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn patch(&self, path: &str, body: Value) -> Result<(u16, Value)> {
        let response = self
            .http
            .patch(format!("{}{path}", self.base_url))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("PATCH {path} failed"))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    pub async fn delete(&self, path: &str) -> Result<(u16, Value)> {
        let response = self
            .http
            .delete(format!("{}{path}", self.base_url))
            .send()
            .await
            .with_context(|| format!("DELETE {path} failed"))?;
        let status = response.status().as_u16();
        let body = response.json().await.unwrap_or(Value::Null);
        Ok((status, body))
    }

    /// Polls the server view until it reports the wanted status.
    pub async fn wait_for_server_status(&self, id: &str, wanted: &str) -> Result<Value> {
        let deadline = tokio::time::Instant::now() + START_TIMEOUT;
        let mut last = Value::Null;
        while tokio::time::Instant::now() < deadline {
            let (status, body) = self.get(&format!("/servers/{id}")).await?;
            if status == 200 {
                last = body["data"].clone();
                if last["status"] == wanted {
                    return Ok(last);
                }
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        bail!("server '{id}' never reached status '{wanted}'; last view: {last}")
    }

    pub fn stop(mut self) {
        let _ = self.child.start_kill();
    }

    /// Kills the daemon and waits for the process to be reaped, releasing
    /// its store lock.
    pub async fn shutdown(mut self) {
        let _ = self.child.start_kill();
        let _ = self.child.wait().await;
    }
}

impl Drop for GatewayProc {
    fn drop(&mut self) {
        let _ = self.child.start_kill();
    }
}

/// Registration body for a stdio upstream backed by the hidden fixture
/// subcommand of the gatehouse binary itself.
pub fn fixture_server_body(name: &str, enabled: bool) -> Value {
    json!({
        "name": name,
        "enabled": enabled,
        "transport": "stdio",
        "command": gatehouse_bin(),
        "args": ["__fixture_server"],
    })
}

fn free_port() -> Result<u16> {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).context("failed to bind probe socket")?;
    Ok(listener.local_addr()?.port())
}
