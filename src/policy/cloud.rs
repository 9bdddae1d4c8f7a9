use std::time::Duration;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};

use super::{unguarded_indices, CycleGuard, Policy};

pub const DEFAULT_CLOUD_TIMEOUT_MS: u64 = 5_000;

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudConfig {
    pub url: String,
    #[serde(default)]
    pub bearer_token: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_timeout_ms() -> u64 {
    DEFAULT_CLOUD_TIMEOUT_MS
}

/// Delegates prompt selection to a remote service.  The wire shape is
/// opaque JSON: we POST `{"state": .., "candidates": [..]}` and accept
/// either `{"index": n}` or `{"prompt": s}` back.  Any transport, HTTP or
/// shape failure falls back to a uniform local pick for that step and
/// bumps the fallbacks counter surfaced through progress events.
pub struct CloudPolicy {
    prompts: Vec<String>,
    guard: CycleGuard,
    rng: StdRng,
    client: reqwest::Client,
    cfg: CloudConfig,
    fallbacks: u64,
}

impl CloudPolicy {
    pub fn new(
        prompts: Vec<String>,
        guard_capacity: usize,
        seed: Option<u64>,
        cfg: CloudConfig,
    ) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .build()
            .expect("failed to build reqwest client");
        Self {
            prompts,
            guard: CycleGuard::new(guard_capacity),
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
            client,
            cfg,
            fallbacks: 0,
        }
    }

    async fn remote_pick(
        &self,
        current: Option<&str>,
        candidates: &[&str],
    ) -> Option<usize> {
        let body = serde_json::json!({
            "state": current,
            "candidates": candidates,
        });
        let mut rb = self.client.post(&self.cfg.url).json(&body);
        if let Some(token) = &self.cfg.bearer_token {
            rb = rb.bearer_auth(token);
        }
        let resp = match rb.send().await {
            Ok(r) => r,
            Err(err) => {
                tracing::warn!(error = %err, "cloud policy transport error");
                return None;
            }
        };
        if !resp.status().is_success() {
            tracing::warn!(status = %resp.status(), "cloud policy non-2xx");
            return None;
        }
        let value: serde_json::Value = match resp.json().await {
            Ok(v) => v,
            Err(err) => {
                tracing::warn!(error = %err, "cloud policy returned invalid JSON");
                return None;
            }
        };
        if let Some(idx) = value.get("index").and_then(|v| v.as_u64()) {
            let idx = idx as usize;
            if idx < candidates.len() {
                return Some(idx);
            }
        }
        if let Some(prompt) = value.get("prompt").and_then(|v| v.as_str()) {
            return candidates.iter().position(|c| *c == prompt);
        }
        None
    }
}

#[async_trait::async_trait]
impl Policy for CloudPolicy {
    fn name(&self) -> &str {
        "cloud"
    }

    async fn next(&mut self, current: Option<&str>, _passed_guard: bool) -> Option<String> {
        if self.prompts.is_empty() {
            return None;
        }
        let indices = unguarded_indices(&self.prompts, &self.guard);
        let candidates: Vec<&str> = indices.iter().map(|&i| self.prompts[i].as_str()).collect();

        let picked = match self.remote_pick(current, &candidates).await {
            Some(pos) => indices[pos],
            None => {
                self.fallbacks += 1;
                *indices.choose(&mut self.rng)?
            }
        };
        let prompt = self.prompts[picked].clone();
        self.guard.remember(&prompt);
        Some(prompt)
    }

    fn fallbacks(&self) -> u64 {
        self.fallbacks
    }
}
