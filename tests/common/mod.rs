use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::{routing::post, Router};

use redprobe::datasets::{DatasetSource, PromptDataset};
use redprobe::httpspec::Modality;

/// Tracks environment variable mutations and restores the previous values
/// when dropped, so tests can touch process-wide configuration safely.
#[allow(dead_code)]
pub struct EnvGuard {
    saved: HashMap<String, Option<String>>,
}

#[allow(dead_code)]
impl EnvGuard {
    pub fn new() -> Self {
        Self {
            saved: HashMap::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        self.save(key);
        std::env::set_var(key, value);
    }

    #[allow(dead_code)]
    pub fn remove(&mut self, key: &str) {
        self.save(key);
        std::env::remove_var(key);
    }

    fn save(&mut self, key: &str) {
        self.saved
            .entry(key.to_string())
            .or_insert_with(|| std::env::var(key).ok());
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for (key, previous) in self.saved.drain() {
            match previous {
                Some(value) => std::env::set_var(&key, value),
                None => std::env::remove_var(&key),
            }
        }
    }
}

#[allow(dead_code)]
pub const REFUSAL_BODY: &str = "I cannot help with that";

/// Spawn a mock target whose reply is computed from the raw request body
/// and a running request counter.
#[allow(dead_code)]
pub async fn spawn_target<F>(reply: F) -> String
where
    F: Fn(u64, &str) -> String + Send + Sync + 'static,
{
    spawn_target_with_delay(reply, Duration::ZERO).await
}

#[allow(dead_code)]
pub async fn spawn_target_with_delay<F>(reply: F, delay: Duration) -> String
where
    F: Fn(u64, &str) -> String + Send + Sync + 'static,
{
    let counter = Arc::new(AtomicU64::new(0));
    let reply = Arc::new(reply);
    let handler = move |body: String| {
        let counter = counter.clone();
        let reply = reply.clone();
        async move {
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let n = counter.fetch_add(1, Ordering::SeqCst);
            reply(n, &body)
        }
    };
    let app = Router::new().route("/", post(handler));
    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}/")
}

/// Target that always answers compliantly.
#[allow(dead_code)]
pub async fn spawn_ok_target() -> String {
    spawn_target(|_, _| "ok".to_string()).await
}

/// Target that alternates compliance and refusal.
#[allow(dead_code)]
pub async fn spawn_alternating_target() -> String {
    spawn_target(|n, _| {
        if n % 2 == 0 {
            "ok".to_string()
        } else {
            REFUSAL_BODY.to_string()
        }
    })
    .await
}

/// Target that refuses everything.
#[allow(dead_code)]
pub async fn spawn_refusing_target() -> String {
    spawn_target(|_, _| REFUSAL_BODY.to_string()).await
}

/// Target that complies only when the request body carries the keyword.
#[allow(dead_code)]
pub async fn spawn_keyword_target(keyword: &'static str) -> String {
    spawn_target(move |_, body| {
        if body.contains(keyword) {
            "sure, here you go".to_string()
        } else {
            REFUSAL_BODY.to_string()
        }
    })
    .await
}

/// Target that records every request body it sees, then complies.
#[allow(dead_code)]
pub async fn spawn_recording_target() -> (String, Arc<Mutex<Vec<String>>>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen_in = seen.clone();
    let url = spawn_target(move |_, body| {
        seen_in.lock().unwrap().push(body.to_string());
        "ok".to_string()
    })
    .await;
    (url, seen)
}

/// S1-style JSON blueprint aimed at a mock target.
#[allow(dead_code)]
pub fn json_blueprint(url: &str) -> String {
    format!("POST {url}\nContent-Type: application/json\n\n{{\"p\":\"<<PROMPT>>\"}}")
}

#[allow(dead_code)]
pub fn text_dataset(name: &str, prompts: &[&str]) -> PromptDataset {
    PromptDataset::new(
        name,
        prompts.iter().map(|p| p.to_string()).collect(),
        Modality::Text,
        DatasetSource::Registry,
        true,
    )
}
