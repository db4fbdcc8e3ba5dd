//! Integration tests for the sensor-agent HTTP/WebSocket server

use focus_sensor_agent::agent::{run_background, Agent};
use focus_sensor_agent::capture::StaticCameras;
use focus_sensor_agent::config::Config;
use focus_sensor_agent::core::JsonProfileStore;
use focus_sensor_agent::server::run;
use focus_sensor_agent::TransparencyLog;
use std::sync::Arc;
use std::time::Duration;

fn test_agent(dir: &tempfile::TempDir) -> Arc<Agent> {
    Arc::new(Agent::new(
        Config::default(),
        Box::new(JsonProfileStore::new(dir.path().join("calibration.json"))),
        Box::new(StaticCameras::new(vec![0])),
        Arc::new(TransparencyLog::new()),
    ))
}

#[tokio::test]
async fn test_health_endpoint() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(&dir);

    let (addr, handle) = run(agent.clone(), 0).await.expect("Failed to start server");
    assert!(addr.ip().is_loopback());

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{}/health", addr))
        .send()
        .await
        .expect("Failed to send request");

    assert!(response.status().is_success());

    let body: serde_json::Value = response.json().await.expect("Failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["version"], focus_sensor_agent::VERSION);

    agent.request_shutdown();
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("server did not stop")
        .unwrap();
}

#[tokio::test]
async fn test_cors_headers() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(&dir);
    let (addr, handle) = run(agent.clone(), 0).await.expect("Failed to start server");

    let client = reqwest::Client::new();
    let response = client
        .request(reqwest::Method::OPTIONS, format!("http://{}/health", addr))
        .header("Origin", "http://localhost")
        .header("Access-Control-Request-Method", "GET")
        .send()
        .await
        .expect("Failed to send request");

    assert!(
        response.status().is_success(),
        "CORS preflight failed: {}",
        response.status()
    );
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        "http://localhost"
    );

    agent.request_shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_websocket_route_requires_upgrade() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(&dir);
    let (addr, handle) = run(agent.clone(), 0).await.expect("Failed to start server");

    // A plain GET without upgrade headers is rejected by the WebSocket extractor.
    let response = reqwest::get(format!("http://{}/ws", addr)).await.unwrap();
    assert!(response.status().is_client_error());

    agent.request_shutdown();
    let _ = tokio::time::timeout(Duration::from_secs(5), handle).await;
}

#[tokio::test]
async fn test_background_tasks_stop_on_shutdown() {
    let dir = tempfile::tempdir().unwrap();
    let agent = test_agent(&dir);
    let background = tokio::spawn(run_background(agent.clone()));

    tokio::time::sleep(Duration::from_millis(50)).await;
    agent.request_shutdown();

    tokio::time::timeout(Duration::from_secs(5), background)
        .await
        .expect("background tasks did not stop")
        .unwrap();
}
