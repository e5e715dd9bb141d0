mod support;

use anyhow::Result;
use serde_json::json;

use support::{GatewayProc, fixture_server_body};

#[tokio::test]
async fn health_reports_server_counts_and_uptime() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let (status, body) = gateway.get("/health").await?;
    assert_eq!(status, 200);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["status"], "ok");
    assert_eq!(body["data"]["servers"]["total"], 0);
    assert_eq!(body["data"]["servers"]["connected"], 0);
    assert!(body["data"]["uptime"].is_u64());

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn server_crud_lifecycle() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let (status, body) = gateway
        .post("/servers", fixture_server_body("fs", false))
        .await?;
    assert_eq!(status, 201);
    assert_eq!(body["success"], true);
    let created = &body["data"];
    assert_eq!(created["name"], "fs");
    assert_eq!(created["prefix"], "fs");
    assert_eq!(created["transport"], "stdio");
    assert_eq!(created["status"], "disconnected");
    assert_eq!(created["enabled"], false);
    let id = created["id"].as_str().expect("id").to_string();

    let (status, body) = gateway.get("/servers").await?;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(1));

    // Renaming changes the routing prefix.
    let (status, body) = gateway
        .patch(&format!("/servers/{id}"), json!({"name": "local files"}))
        .await?;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["prefix"], "local_files");

    // Transport is immutable after creation.
    let (status, body) = gateway
        .patch(&format!("/servers/{id}"), json!({"transport": "sse"}))
        .await?;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    let (status, _body) = gateway.delete(&format!("/servers/{id}")).await?;
    assert_eq!(status, 200);
    let (status, body) = gateway.get(&format!("/servers/{id}")).await?;
    assert_eq!(status, 404);
    assert_eq!(body["success"], false);

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn names_colliding_after_normalization_are_rejected() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let (status, _) = gateway
        .post("/servers", fixture_server_body("Foo Bar", false))
        .await?;
    assert_eq!(status, 201);

    // "Foo-Bar" normalizes to the same foo_bar prefix as "Foo Bar".
    let (status, body) = gateway
        .post("/servers", fixture_server_body("Foo-Bar", false))
        .await?;
    assert_eq!(status, 409);
    assert_eq!(body["success"], false);
    assert!(
        body["error"]
            .as_str()
            .unwrap_or_default()
            .contains("already taken")
    );

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn symbol_only_names_are_rejected() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let (status, body) = gateway
        .post("/servers", fixture_server_body("!!!", false))
        .await?;
    assert_eq!(status, 400);
    assert_eq!(body["success"], false);

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn logs_start_empty_and_clear() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let (status, body) = gateway.get("/logs").await?;
    assert_eq!(status, 200);
    assert_eq!(body["data"].as_array().map(Vec::len), Some(0));

    let (status, body) = gateway.get("/logs/stats").await?;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["total"], 0);

    let (status, _body) = gateway.delete("/logs").await?;
    assert_eq!(status, 200);

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn event_stream_responds_with_sse_content_type() -> Result<()> {
    let gateway = GatewayProc::spawn().await?;

    let response = gateway
        .http
        .get(format!("{}/events", gateway.base_url))
        .send()
        .await?;
    assert_eq!(response.status().as_u16(), 200);
    let content_type = response
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    assert!(content_type.starts_with("text/event-stream"));

    gateway.stop();
    Ok(())
}

#[tokio::test]
async fn config_survives_restart() -> Result<()> {
    let data_dir = tempfile::tempdir()?;

    let first = GatewayProc::spawn_in(data_dir.path()).await?;
    let (status, body) = first
        .post("/servers", fixture_server_body("persistent", false))
        .await?;
    assert_eq!(status, 201);
    let id = body["data"]["id"].as_str().expect("id").to_string();

    // The store coalesces writes; give the flush window a moment before
    // killing the process.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    first.shutdown().await;

    let second = GatewayProc::spawn_in(data_dir.path()).await?;
    let (status, body) = second.get(&format!("/servers/{id}")).await?;
    assert_eq!(status, 200);
    assert_eq!(body["data"]["name"], "persistent");
    assert_eq!(body["data"]["status"], "disconnected");

    second.stop();
    Ok(())
}
