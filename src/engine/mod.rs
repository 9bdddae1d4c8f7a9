//! The fuzzing engine.
//!
//! One scan traverses its modules (datasets) sequentially so the global
//! token budget stays monotonic.  Within a module, attempts are dispatched
//! by a bounded worker pool; results flow through a channel back to a single
//! accounting owner which updates counters, feeds the policy and emits
//! progress events in acceptance order.  The stop signal is level-triggered
//! and observed at every attempt boundary; in-flight requests drain.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;

use crate::datasets::{MediaCache, PromptDataset};
use crate::failures::{FailureRecord, FailureSink};
use crate::httpspec::{FilePart, HttpSpec, Modality, PromptPayload};
use crate::policy::{build_policy, BayesianOptimizer, OptimizerSignal, PolicyKind};
use crate::refusal::RefusalClassifier;
use crate::target::TargetClient;
use crate::util::approx_tokens;

pub mod accounting;
pub mod events;

pub use accounting::ModuleAccounting;
pub use events::{ModuleState, ProgressEvent, SCAN_MODULE};

pub const DEFAULT_CONCURRENCY: usize = 8;
pub const DEFAULT_CHAIN_LEN: usize = 4;

const TICK_INTERVAL_TEXT: u64 = 1;
const TICK_INTERVAL_MEDIA: u64 = 4;
const MAX_CONSECUTIVE_TRANSPORT_ERRORS: u32 = 3;

#[derive(Clone, Debug)]
pub struct EngineOptions {
    pub optimize: bool,
    pub multi_step: bool,
    pub concurrency: usize,
    pub chain_len: usize,
    pub guard_capacity: usize,
    pub policy: PolicyKind,
    /// Fixed seed for policies and the optimizer; `None` means entropy.
    pub seed: Option<u64>,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            optimize: false,
            multi_step: false,
            concurrency: DEFAULT_CONCURRENCY,
            chain_len: DEFAULT_CHAIN_LEN,
            guard_capacity: crate::policy::DEFAULT_GUARD_CAPACITY,
            policy: PolicyKind::Naive,
            seed: None,
        }
    }
}

#[derive(Clone, Debug, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleSummary {
    pub module: String,
    pub attempts: u64,
    pub failure_rate: f64,
    pub tokens: u64,
    pub cost: f64,
    pub state: ModuleState,
}

#[derive(Clone, Debug, Default, serde::Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanSummary {
    pub modules: Vec<ModuleSummary>,
    pub stopped: bool,
    pub budget_exhausted: bool,
}

struct Attempt {
    /// Prompt as selected from the dataset.
    prompt: String,
    /// What actually went over the wire (chain prefix included).
    sent: String,
    /// Prompt selected before this one, for policy updates.
    prev: Option<String>,
    /// Optimizer parameter that produced this attempt, if any.
    x: Option<f64>,
    prompt_tokens: u64,
}

enum AttemptOutcome {
    Response { body: String },
    Transport(String),
}

struct AttemptResult {
    attempt: Attempt,
    outcome: AttemptOutcome,
}

struct ModuleOutcome {
    summary: ModuleSummary,
    state: ModuleState,
}

pub struct Fuzzer {
    spec: Arc<HttpSpec>,
    client: Arc<TargetClient>,
    classifier: Arc<RefusalClassifier>,
    media: Option<Arc<MediaCache>>,
    failures: Option<FailureSink>,
    options: EngineOptions,
    stop: Arc<AtomicBool>,
}

impl Fuzzer {
    pub fn new(
        spec: Arc<HttpSpec>,
        client: Arc<TargetClient>,
        classifier: Arc<RefusalClassifier>,
        media: Option<Arc<MediaCache>>,
        failures: Option<FailureSink>,
        options: EngineOptions,
        stop: Arc<AtomicBool>,
    ) -> Self {
        Self {
            spec,
            client,
            classifier,
            media,
            failures,
            options,
            stop,
        }
    }

    /// Drive the whole scan.  Events go out through `tx` in accounting
    /// order; the returned summary holds the final per-module numbers.
    pub async fn run(
        self,
        datasets: Vec<PromptDataset>,
        budget: u64,
        tx: mpsc::Sender<ProgressEvent>,
    ) -> ScanSummary {
        let mut budget_left = budget;
        let mut summary = ScanSummary::default();

        for dataset in &datasets {
            if self.stop.load(Ordering::Relaxed) {
                summary.stopped = true;
            }
            if summary.stopped || summary.budget_exhausted {
                let state = if summary.stopped {
                    ModuleState::Stopped
                } else {
                    ModuleState::BudgetExhausted
                };
                let _ = tx
                    .send(ProgressEvent::status(&dataset.name, state.as_status()))
                    .await;
                summary.modules.push(ModuleSummary {
                    module: dataset.name.clone(),
                    attempts: 0,
                    failure_rate: 0.0,
                    tokens: 0,
                    cost: 0.0,
                    state,
                });
                continue;
            }

            let outcome = self.run_module(dataset, &mut budget_left, &tx).await;
            match outcome.state {
                ModuleState::Stopped => summary.stopped = true,
                ModuleState::BudgetExhausted => summary.budget_exhausted = true,
                _ => {}
            }
            summary.modules.push(outcome.summary);
        }

        let scan_status = if summary.stopped {
            "stopped"
        } else if summary.budget_exhausted {
            "budget-exhausted"
        } else {
            "done"
        };
        let _ = tx.send(ProgressEvent::status(SCAN_MODULE, scan_status)).await;
        summary
    }

    async fn run_module(
        &self,
        dataset: &PromptDataset,
        budget_left: &mut u64,
        tx: &mpsc::Sender<ProgressEvent>,
    ) -> ModuleOutcome {
        let planned = dataset.len() as u64;
        let mut acct = ModuleAccounting::new(&dataset.name, planned);
        tracing::info!(module = %dataset.name, prompts = planned, modality = %dataset.modality, "module start");

        if dataset.is_empty() {
            acct.state = ModuleState::Done;
            let _ = tx
                .send(ProgressEvent::status(&dataset.name, ModuleState::Done.as_status()))
                .await;
            return ModuleOutcome {
                summary: summarize(&acct),
                state: ModuleState::Done,
            };
        }

        let tick_interval = match dataset.modality {
            Modality::Text => TICK_INTERVAL_TEXT,
            _ => TICK_INTERVAL_MEDIA,
        };
        // Chained attempts depend on the previous response, so many-shot
        // mode runs the pool at width one.
        let concurrency = if self.options.multi_step {
            1
        } else {
            self.options.concurrency.max(1)
        };

        let mut policy = build_policy(
            &self.options.policy,
            dataset,
            self.options.guard_capacity,
            self.options.seed,
        );
        let mut optimizer = self
            .options
            .optimize
            .then(|| BayesianOptimizer::new(self.options.seed));

        let (res_tx, mut res_rx) = mpsc::channel::<AttemptResult>(concurrency);

        let mut scheduled: u64 = 0;
        let mut in_flight: usize = 0;
        let mut last_selected: Option<String> = None;
        let mut last_passed_guard = true;
        let mut chain_ctx: Option<String> = None;
        let mut chain_pos: usize = 0;
        let mut consecutive_errors: u32 = 0;
        let mut last_fallbacks: u64 = 0;
        let mut optimizer_stopped = false;
        let mut terminal: Option<ModuleState> = None;

        loop {
            if self.stop.load(Ordering::Relaxed) && terminal.is_none() {
                terminal = Some(ModuleState::Stopped);
            }

            while terminal.is_none() && in_flight < concurrency && scheduled < planned {
                if self.stop.load(Ordering::Relaxed) {
                    terminal = Some(ModuleState::Stopped);
                    break;
                }

                let (prompt, x) = match &mut optimizer {
                    Some(opt) => {
                        let x = opt.suggest();
                        let idx = (x * (dataset.len() - 1) as f64).round() as usize;
                        (dataset.prompts[idx].clone(), Some(x))
                    }
                    None => match policy.next(last_selected.as_deref(), last_passed_guard).await {
                        Some(p) => (p, None),
                        None => {
                            terminal = Some(ModuleState::Exhausted);
                            break;
                        }
                    },
                };

                let sent = match &chain_ctx {
                    Some(prev_response) if self.options.multi_step => {
                        format!("{prev_response}\n{prompt}")
                    }
                    _ => prompt.clone(),
                };
                let prompt_tokens = approx_tokens(&sent);
                if prompt_tokens > *budget_left {
                    terminal = Some(ModuleState::BudgetExhausted);
                    break;
                }
                *budget_left -= prompt_tokens;

                let attempt = Attempt {
                    prompt: prompt.clone(),
                    sent,
                    prev: last_selected.clone(),
                    x,
                    prompt_tokens,
                };
                last_selected = Some(prompt);
                self.spawn_attempt(attempt, res_tx.clone());
                scheduled += 1;
                in_flight += 1;
            }

            if in_flight == 0 {
                break;
            }

            let Some(result) = res_rx.recv().await else {
                break;
            };
            in_flight -= 1;
            // A stop that fired while this attempt was in flight still
            // counts the attempt, but suppresses any further ticks.
            if self.stop.load(Ordering::Relaxed) && terminal.is_none() {
                terminal = Some(ModuleState::Stopped);
            }

            match result.outcome {
                AttemptOutcome::Response { body } => {
                    consecutive_errors = 0;
                    let verdict = self.classifier.classify(&body);
                    for warning in &verdict.warnings {
                        let _ = tx
                            .send(ProgressEvent::status(
                                &dataset.name,
                                format!("warning: {warning}"),
                            ))
                            .await;
                    }
                    let response_tokens = approx_tokens(&body);
                    if verdict.refusal {
                        acct.record_refusal(result.attempt.prompt_tokens, response_tokens);
                        chain_ctx = None;
                        chain_pos = 0;
                    } else {
                        acct.record_compliance(result.attempt.prompt_tokens, response_tokens);
                        if let Some(sink) = &self.failures {
                            sink.append(&FailureRecord::now(
                                &dataset.name,
                                &result.attempt.sent,
                                &body,
                            ));
                        }
                        if self.options.multi_step {
                            chain_pos += 1;
                            if chain_pos >= self.options.chain_len.max(1) {
                                chain_ctx = None;
                                chain_pos = 0;
                            } else {
                                chain_ctx = Some(body.clone());
                            }
                        }
                    }
                    last_passed_guard = verdict.refusal;

                    let reward = if verdict.refusal { -1.0 } else { 1.0 };
                    policy.update(
                        result.attempt.prev.as_deref().unwrap_or(""),
                        &result.attempt.prompt,
                        reward,
                        verdict.refusal,
                    );
                    if policy.fallbacks() > last_fallbacks {
                        last_fallbacks = policy.fallbacks();
                        let _ = tx
                            .send(ProgressEvent::status(
                                &dataset.name,
                                format!("cloud policy fallbacks: {last_fallbacks}"),
                            ))
                            .await;
                    }

                    if let (Some(opt), Some(x)) = (&mut optimizer, result.attempt.x) {
                        if opt.observe(x, -acct.failure_ratio()) == OptimizerSignal::Stop
                            && terminal.is_none()
                        {
                            optimizer_stopped = true;
                            terminal = Some(ModuleState::Done);
                        }
                    }
                }
                AttemptOutcome::Transport(message) => {
                    acct.record_transport_error(result.attempt.prompt_tokens);
                    consecutive_errors += 1;
                    tracing::warn!(module = %dataset.name, error = %message, "attempt failed");
                    if consecutive_errors >= MAX_CONSECUTIVE_TRANSPORT_ERRORS
                        && terminal.is_none()
                    {
                        let _ = tx
                            .send(ProgressEvent::error(
                                &dataset.name,
                                format!(
                                    "{MAX_CONSECUTIVE_TRANSPORT_ERRORS} consecutive transport errors, \
                                     skipping remaining prompts: {message}"
                                ),
                            ))
                            .await;
                        terminal = Some(ModuleState::Errored);
                    }
                }
            }

            if terminal.is_none() {
                if let Some(tick) = acct.tick_if_due(tick_interval) {
                    let _ = tx.send(tick).await;
                }
            }

            if terminal.is_none() && scheduled == planned && in_flight == 0 {
                break;
            }
        }

        let state = terminal.unwrap_or(ModuleState::Done);
        acct.state = state;
        match state {
            ModuleState::Done if optimizer_stopped => {
                let _ = tx
                    .send(ProgressEvent::status(&dataset.name, "optimizer-stop"))
                    .await;
            }
            ModuleState::Done => {
                if let Some(tick) = acct.final_tick() {
                    let _ = tx.send(tick).await;
                }
                let _ = tx
                    .send(ProgressEvent::status(&dataset.name, state.as_status()))
                    .await;
            }
            other => {
                let _ = tx
                    .send(ProgressEvent::status(&dataset.name, other.as_status()))
                    .await;
            }
        }
        tracing::info!(
            module = %dataset.name,
            attempts = acct.attempts,
            failure_rate = acct.failure_rate(),
            state = state.as_status(),
            "module finished"
        );

        ModuleOutcome {
            summary: summarize(&acct),
            state,
        }
    }

    fn spawn_attempt(&self, attempt: Attempt, res_tx: mpsc::Sender<AttemptResult>) {
        let spec = self.spec.clone();
        let client = self.client.clone();
        let media = self.media.clone();
        tokio::spawn(async move {
            let outcome = perform_attempt(&spec, &client, media, &attempt.sent).await;
            let _ = res_tx.send(AttemptResult { attempt, outcome }).await;
        });
    }
}

fn summarize(acct: &ModuleAccounting) -> ModuleSummary {
    ModuleSummary {
        module: acct.module.clone(),
        attempts: acct.attempts,
        failure_rate: acct.failure_rate(),
        tokens: acct.tokens,
        cost: acct.cost,
        state: acct.state,
    }
}

async fn perform_attempt(
    spec: &HttpSpec,
    client: &TargetClient,
    media: Option<Arc<MediaCache>>,
    sent: &str,
) -> AttemptOutcome {
    let payload = match build_payload(spec.modality, media, sent).await {
        Ok(p) => p,
        Err(err) => return AttemptOutcome::Transport(format!("payload: {err}")),
    };
    let request = match spec.materialize(&payload) {
        Ok(r) => r,
        Err(err) => return AttemptOutcome::Transport(format!("materialize: {err}")),
    };
    match client.probe(&request).await {
        Ok(resp) => AttemptOutcome::Response { body: resp.body },
        Err(err) => AttemptOutcome::Transport(err.to_string()),
    }
}

async fn build_payload(
    modality: Modality,
    media: Option<Arc<MediaCache>>,
    prompt: &str,
) -> anyhow::Result<PromptPayload> {
    use anyhow::Context;

    match modality {
        Modality::Text => Ok(PromptPayload::Text {
            prompt: prompt.to_string(),
        }),
        Modality::Image => {
            let cache = media.context("no media cache configured for image spec")?;
            let owned = prompt.to_string();
            let image_b64 =
                tokio::task::spawn_blocking(move || cache.image_b64(&owned)).await??;
            Ok(PromptPayload::Image {
                prompt: prompt.to_string(),
                image_b64,
            })
        }
        Modality::Audio => {
            let cache = media.context("no media cache configured for audio spec")?;
            let owned = prompt.to_string();
            let audio_b64 =
                tokio::task::spawn_blocking(move || cache.audio_b64(&owned)).await??;
            Ok(PromptPayload::Audio {
                prompt: prompt.to_string(),
                audio_b64,
            })
        }
        Modality::Files => Ok(PromptPayload::Files {
            prompt: prompt.to_string(),
            files: vec![FilePart {
                field: "file".to_string(),
                filename: "prompt.txt".to_string(),
                mime: "text/plain".to_string(),
                data: prompt.as_bytes().to_vec(),
            }],
        }),
    }
}
