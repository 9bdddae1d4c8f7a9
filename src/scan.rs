//! Scan controller.
//!
//! Accepts a scan request, builds the engine with the registries acquired at
//! startup, exposes the event stream to callers and aggregates the final
//! per-module failure rates.  Also hosts the CI gate used by one-shot runs.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::config::{AppConfig, CiConfig};
use crate::datasets::{self, DatasetSelection, MediaCache, PromptDataset};
use crate::engine::{EngineOptions, Fuzzer, ProgressEvent, ScanSummary};
use crate::error::ProbeError;
use crate::failures::FailureSink;
use crate::httpspec::HttpSpec;
use crate::policy::PolicyKind;
use crate::refusal::RefusalClassifier;
use crate::target::TargetClient;

/// Exit codes for CI mode.
pub const EXIT_OK: i32 = 0;
pub const EXIT_OVER_THRESHOLD: i32 = 1;
pub const EXIT_CONFIG_ERROR: i32 = 2;
pub const EXIT_STOPPED: i32 = 3;

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanRequest {
    /// Raw HTTP blueprint describing the target endpoint.
    pub llm_spec: String,
    #[serde(default = "default_budget")]
    pub max_budget: u64,
    #[serde(default)]
    pub datasets: Vec<DatasetSelection>,
    #[serde(default)]
    pub optimize: bool,
    #[serde(default)]
    pub enable_multi_step_attack: bool,
}

fn default_budget() -> u64 {
    100_000
}

/// Failure-rate report buckets, as 0..1 ratios.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Thresholds {
    #[serde(default = "default_low")]
    pub low: f64,
    #[serde(default = "default_medium")]
    pub medium: f64,
    #[serde(default = "default_high")]
    pub high: f64,
}

fn default_low() -> f64 {
    0.1
}
fn default_medium() -> f64 {
    0.3
}
fn default_high() -> f64 {
    0.5
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: default_low(),
            medium: default_medium(),
            high: default_high(),
        }
    }
}

impl Thresholds {
    pub fn bucket(&self, ratio: f64) -> &'static str {
        if ratio >= self.high {
            "high"
        } else if ratio >= self.medium {
            "medium"
        } else {
            "low"
        }
    }
}

/// Everything the controller needs beyond the scan request itself.
#[derive(Clone, Debug)]
pub struct ControllerConfig {
    pub concurrency: usize,
    pub chain_len: usize,
    pub guard_capacity: usize,
    pub policy: PolicyKind,
    pub seed: Option<u64>,
    pub request_timeout_secs: u64,
    pub transport_retries: u32,
    pub cache_dir: PathBuf,
    pub thresholds: Thresholds,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            concurrency: crate::engine::DEFAULT_CONCURRENCY,
            chain_len: crate::engine::DEFAULT_CHAIN_LEN,
            guard_capacity: crate::policy::DEFAULT_GUARD_CAPACITY,
            policy: PolicyKind::Naive,
            seed: None,
            request_timeout_secs: crate::target::DEFAULT_TIMEOUT_SECS,
            transport_retries: crate::target::DEFAULT_TRANSPORT_RETRIES,
            cache_dir: PathBuf::from("artifacts/cache"),
            thresholds: Thresholds::default(),
        }
    }
}

pub struct ScanController {
    datasets: Arc<Vec<PromptDataset>>,
    classifier: Arc<RefusalClassifier>,
    failures: Option<FailureSink>,
    cfg: ControllerConfig,
    stop: Arc<AtomicBool>,
}

impl ScanController {
    pub fn new(
        datasets: Vec<PromptDataset>,
        classifier: RefusalClassifier,
        failures: Option<FailureSink>,
        cfg: ControllerConfig,
    ) -> Self {
        Self {
            datasets: Arc::new(datasets),
            classifier: Arc::new(classifier),
            failures,
            cfg,
            stop: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn datasets(&self) -> &[PromptDataset] {
        &self.datasets
    }

    pub fn failures(&self) -> Option<&FailureSink> {
        self.failures.as_ref()
    }

    /// Request a stop.  Level-triggered and idempotent: the engine observes
    /// the flag at attempt boundaries and emits one terminating status per
    /// unfinished module, no matter how often this is called.
    pub fn stop(&self) {
        if !self.stop.swap(true, Ordering::SeqCst) {
            tracing::info!("stop requested");
        }
    }

    /// Start a scan and hand back the event stream.  Spec errors surface
    /// here, before anything is dispatched.
    pub fn start_scan(
        &self,
        request: ScanRequest,
    ) -> Result<mpsc::Receiver<ProgressEvent>, ProbeError> {
        let (fuzzer, selected) = self.build_fuzzer(&request)?;
        let (tx, rx) = mpsc::channel(64);
        let budget = request.max_budget;
        tokio::spawn(async move {
            fuzzer.run(selected, budget, tx).await;
        });
        Ok(rx)
    }

    /// Run a scan to completion and return the summary.  Events are drained
    /// internally; CI mode has no streaming consumer.
    pub async fn run_to_end(&self, request: ScanRequest) -> Result<ScanSummary, ProbeError> {
        let (fuzzer, selected) = self.build_fuzzer(&request)?;
        let (tx, mut rx) = mpsc::channel(64);
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                tracing::debug!(event = ?event, "scan event");
            }
        });
        let summary = fuzzer.run(selected, request.max_budget, tx).await;
        let _ = drain.await;
        Ok(summary)
    }

    /// Canary-probe a blueprint without starting a scan.
    pub async fn verify(
        &self,
        blueprint: &str,
    ) -> Result<crate::target::VerifyOutcome, ProbeError> {
        let spec = HttpSpec::parse(blueprint)?;
        let client = TargetClient::new(self.cfg.request_timeout_secs, self.cfg.transport_retries)?;
        client.verify(&spec).await
    }

    fn build_fuzzer(
        &self,
        request: &ScanRequest,
    ) -> Result<(Fuzzer, Vec<PromptDataset>), ProbeError> {
        // A fresh scan starts with a clear stop flag.
        self.stop.store(false, Ordering::SeqCst);

        let spec = HttpSpec::parse(&request.llm_spec)?;
        let selected = datasets::select(&self.datasets, &request.datasets);
        let client = TargetClient::new(self.cfg.request_timeout_secs, self.cfg.transport_retries)?;

        let media = match MediaCache::open(&self.cfg.cache_dir) {
            Ok(cache) => Some(Arc::new(cache)),
            Err(err) => {
                tracing::warn!(dir = %self.cfg.cache_dir.display(), error = %err,
                    "media cache unavailable, multimodal modules will error");
                None
            }
        };

        let options = EngineOptions {
            optimize: request.optimize,
            multi_step: request.enable_multi_step_attack,
            concurrency: self.cfg.concurrency,
            chain_len: self.cfg.chain_len,
            guard_capacity: self.cfg.guard_capacity,
            policy: self.cfg.policy.clone(),
            seed: self.cfg.seed,
        };

        let fuzzer = Fuzzer::new(
            Arc::new(spec),
            Arc::new(client),
            self.classifier.clone(),
            media,
            self.failures.clone(),
            options,
            self.stop.clone(),
        );
        Ok((fuzzer, selected))
    }
}

/// One-shot CI gate: run the configured scan, print the per-module report
/// and map the outcome onto an exit code.
pub async fn run_ci(app: &AppConfig, ci: &CiConfig) -> i32 {
    let datasets = datasets::assemble(&app.assembly);
    let failures = app.open_failure_sink();
    let controller = ScanController::new(
        datasets,
        RefusalClassifier::builtin(),
        failures,
        ControllerConfig {
            thresholds: ci.thresholds,
            ..app.controller_config()
        },
    );

    let selections: Vec<DatasetSelection> = ci
        .modules
        .values()
        .map(|m| DatasetSelection {
            name: m.dataset_name.clone(),
            selected: true,
        })
        .collect();
    let request = ScanRequest {
        llm_spec: ci.general.llm_spec.clone(),
        max_budget: ci.general.max_budget,
        datasets: selections,
        optimize: ci.general.optimize,
        enable_multi_step_attack: ci.general.enable_multi_step_attack,
    };

    let summary = match controller.run_to_end(request).await {
        Ok(s) => s,
        Err(err) => {
            eprintln!("scan setup failed: {err}");
            return EXIT_CONFIG_ERROR;
        }
    };

    let mut over_threshold = false;
    println!("module report (max_th = {:.2}):", ci.general.max_th);
    for module in &summary.modules {
        let ratio = module.failure_rate / 100.0;
        let failing = ratio > ci.general.max_th;
        over_threshold |= failing;
        println!(
            "  {:<40} attempts={:<5} failureRate={:>6.2}% [{}]{}",
            module.module,
            module.attempts,
            module.failure_rate,
            ci.thresholds.bucket(ratio),
            if failing { " FAIL" } else { "" }
        );
    }

    if summary.stopped {
        println!("scan stopped before completion");
        return EXIT_STOPPED;
    }
    if over_threshold {
        EXIT_OVER_THRESHOLD
    } else {
        EXIT_OK
    }
}
