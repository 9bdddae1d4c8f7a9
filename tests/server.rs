use once_cell::sync::Lazy;
use std::sync::Mutex;

use reqwest::Client;
use serde_json::json;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::task::JoinHandle;

use redprobe::app;
use redprobe::engine::ProgressEvent;

mod common;
use common::{json_blueprint, spawn_ok_target, spawn_refusing_target, EnvGuard};

static ENV_MUTEX: Lazy<Mutex<()>> = Lazy::new(|| Mutex::new(()));

// Helper to spawn an instance of the app bound to an available port.
async fn spawn_app() -> (String, JoinHandle<()>) {
    let listener = TokioTcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let state = {
        let _guard = ENV_MUTEX.lock().unwrap();
        let mut env = EnvGuard::new();
        env.remove("REDPROBE_DATASET_DIR");
        env.remove("REDPROBE_POLICY");
        env.remove("FAILURES_FILE");
        env.remove("STRICT_AUTH_ALLOWED_TOKENS");
        let config = redprobe::AppConfig::from_env().unwrap();
        redprobe::build_state(&config)
    };
    let app = app(state);
    let handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{}", addr), handle)
}

#[tokio::test]
async fn scan_requires_authorization() {
    let (addr, _h) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/scan"))
        .json(&json!({"llmSpec": "POST https://x/\n\n"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 401);
}

#[tokio::test]
async fn scan_streams_newline_delimited_events() {
    let (addr, _h) = spawn_app().await;
    let target = spawn_refusing_target().await;
    let body = json!({
        "llmSpec": json_blueprint(&target),
        "maxBudget": 100000,
        "datasets": [{"name": "prompt-injection", "selected": true}],
    });
    let resp = Client::new()
        .post(format!("{addr}/scan"))
        .header("Authorization", "Bearer test")
        .json(&body)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    assert_eq!(
        resp.headers()
            .get("content-type")
            .and_then(|v| v.to_str().ok()),
        Some("application/x-ndjson")
    );

    let text = resp.text().await.unwrap();
    let events: Vec<ProgressEvent> = text
        .lines()
        .map(|line| serde_json::from_str(line).expect("every line is one event"))
        .collect();
    assert!(events
        .iter()
        .any(|e| matches!(e, ProgressEvent::Tick { .. }) && e.module() == "prompt-injection"));
    assert_eq!(
        events.last().unwrap(),
        &ProgressEvent::status("scan", "done")
    );
}

#[tokio::test]
async fn scan_rejects_bad_blueprints() {
    let (addr, _h) = spawn_app().await;
    let resp = Client::new()
        .post(format!("{addr}/scan"))
        .header("Authorization", "Bearer test")
        .json(&json!({"llmSpec": "garbage"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test]
async fn verify_issues_a_canary_probe() {
    let (addr, _h) = spawn_app().await;
    let target = spawn_ok_target().await;
    let resp = Client::new()
        .post(format!("{addr}/verify"))
        .header("Authorization", "Bearer test")
        .body(json_blueprint(&target))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    assert_eq!(json.get("ok").unwrap(), &serde_json::json!(true));
    assert_eq!(json.get("bodyPreview").unwrap(), &serde_json::json!("ok"));
}

#[tokio::test]
async fn datasets_listing_is_open_and_typed() {
    let (addr, _h) = spawn_app().await;
    let resp = Client::new()
        .get(format!("{addr}/datasets"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200);
    let json: serde_json::Value = resp.json().await.unwrap();
    let list = json.as_array().unwrap();
    assert!(list.len() >= 5);
    let injection = list
        .iter()
        .find(|d| d["name"] == "prompt-injection")
        .unwrap();
    assert!(injection["numPrompts"].as_u64().unwrap() > 0);
    assert_eq!(injection["selected"], serde_json::json!(true));
    assert_eq!(injection["modality"], serde_json::json!("text"));
    assert_eq!(injection["dynamic"], serde_json::json!(false));
}

#[tokio::test]
async fn failures_endpoint_streams_records() {
    let (addr, _h) = spawn_app().await;
    let resp = Client::new()
        .get(format!("{addr}/failures"))
        .header("Authorization", "Bearer test")
        .send()
        .await
        .unwrap();
    // No sink configured: empty NDJSON body.
    assert_eq!(resp.status(), 200);
    assert_eq!(resp.text().await.unwrap(), "");
}

#[tokio::test]
async fn stop_is_idempotent_over_http() {
    let (addr, _h) = spawn_app().await;
    for _ in 0..2 {
        let resp = Client::new()
            .post(format!("{addr}/stop"))
            .header("Authorization", "Bearer test")
            .send()
            .await
            .unwrap();
        assert_eq!(resp.status(), 200);
        let json: serde_json::Value = resp.json().await.unwrap();
        assert_eq!(json["stopped"], serde_json::json!(true));
    }
}

#[tokio::test]
async fn health_and_metrics_expose_basics() {
    let (addr, _h) = spawn_app().await;
    let health: serde_json::Value = Client::new()
        .get(format!("{addr}/healthz"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(health["status"], serde_json::json!("ok"));
    assert!(health["datasetCount"].as_u64().unwrap() > 0);

    let metrics = Client::new()
        .get(format!("{addr}/metrics"))
        .send()
        .await
        .unwrap()
        .text()
        .await
        .unwrap();
    assert!(metrics.contains("redprobe_scans_total"));
    assert!(metrics.contains("redprobe_process_uptime_seconds"));
}
