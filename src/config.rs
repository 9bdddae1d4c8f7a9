use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use serde::Deserialize;

use crate::datasets::{stenography, AssemblyConfig, Transform};
use crate::failures::{FailureSink, RotationConfig};
use crate::policy::{CloudConfig, PolicyKind, DEFAULT_GUARD_CAPACITY};
use crate::scan::{ControllerConfig, Thresholds};

/// Service configuration resolved from environment variables.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub assembly: AssemblyConfig,
    pub cache_dir: PathBuf,
    pub failures_file: Option<String>,
    pub rotation: RotationConfig,
    pub allowed_tokens: Option<HashSet<String>>,
    pub concurrency: usize,
    pub chain_len: usize,
    pub guard_capacity: usize,
    pub request_timeout_secs: u64,
    pub transport_retries: u32,
    pub policy: PolicyKind,
    pub seed: Option<u64>,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let dataset_dir = env::var("REDPROBE_DATASET_DIR").ok().map(PathBuf::from);
        let cache_dir = env::var("REDPROBE_CACHE_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("artifacts/cache"));

        let mutators = parse_mutators()?;
        let mutator_fraction = parse_optional_f64("REDPROBE_MUTATOR_FRACTION")?
            .unwrap_or(stenography::DEFAULT_SAMPLE_FRACTION);

        let failures_file = env::var("FAILURES_FILE").ok();
        let rotation = RotationConfig {
            max_bytes: parse_optional_u64("LOG_MAX_BYTES")?,
            keep: parse_optional_u64("LOG_ROTATE_KEEP")?.unwrap_or(1) as usize,
            compress: parse_bool_env("LOG_ROTATE_COMPRESS")?.unwrap_or(false),
        };

        let allowed_tokens = env::var("STRICT_AUTH_ALLOWED_TOKENS")
            .ok()
            .map(|raw| {
                raw.split(',')
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(|s| s.to_string())
                    .collect::<HashSet<_>>()
            })
            .filter(|set: &HashSet<String>| !set.is_empty());

        let concurrency = parse_optional_u64("REDPROBE_CONCURRENCY")?
            .unwrap_or(crate::engine::DEFAULT_CONCURRENCY as u64) as usize;
        let chain_len = parse_optional_u64("REDPROBE_CHAIN_LEN")?
            .unwrap_or(crate::engine::DEFAULT_CHAIN_LEN as u64) as usize;
        let guard_capacity = parse_optional_u64("REDPROBE_GUARD_CAPACITY")?
            .unwrap_or(DEFAULT_GUARD_CAPACITY as u64) as usize;
        let request_timeout_secs = parse_optional_u64("REDPROBE_REQUEST_TIMEOUT_SECS")?
            .unwrap_or(crate::target::DEFAULT_TIMEOUT_SECS);
        let transport_retries = parse_optional_u64("REDPROBE_TRANSPORT_RETRIES")?
            .unwrap_or(crate::target::DEFAULT_TRANSPORT_RETRIES as u64)
            as u32;
        let seed = parse_optional_u64("REDPROBE_SEED")?;

        let policy = parse_policy()?;

        Ok(Self {
            assembly: AssemblyConfig {
                dataset_dir,
                mutators,
                mutator_fraction,
                mutator_seed: seed,
            },
            cache_dir,
            failures_file,
            rotation,
            allowed_tokens,
            concurrency,
            chain_len,
            guard_capacity,
            request_timeout_secs,
            transport_retries,
            policy,
            seed,
        })
    }

    pub fn controller_config(&self) -> ControllerConfig {
        ControllerConfig {
            concurrency: self.concurrency,
            chain_len: self.chain_len,
            guard_capacity: self.guard_capacity,
            policy: self.policy.clone(),
            seed: self.seed,
            request_timeout_secs: self.request_timeout_secs,
            transport_retries: self.transport_retries,
            cache_dir: self.cache_dir.clone(),
            thresholds: Thresholds::default(),
        }
    }

    /// Open the failures sink when a path is configured.  Like the
    /// telemetry writers this degrades to a warning rather than refusing
    /// to start.
    pub fn open_failure_sink(&self) -> Option<FailureSink> {
        match self.failures_file.as_deref() {
            Some(path) => match FailureSink::open(path, self.rotation.clone()) {
                Ok(sink) => Some(sink),
                Err(err) => {
                    tracing::warn!(path = %path, error = %err,
                        "failed to open FAILURES_FILE; failure records disabled");
                    None
                }
            },
            None => {
                tracing::warn!("failure persistence disabled: FAILURES_FILE not set");
                None
            }
        }
    }
}

fn parse_policy() -> Result<PolicyKind> {
    let name = match env::var("REDPROBE_POLICY") {
        Ok(v) => v.trim().to_ascii_lowercase(),
        Err(_) => return Ok(PolicyKind::Naive),
    };
    match name.as_str() {
        "" | "naive" => Ok(PolicyKind::Naive),
        "random" => Ok(PolicyKind::Random),
        "qlearning" | "q-learning" => Ok(PolicyKind::QLearning),
        "cloud" => {
            let url = env::var("REDPROBE_CLOUD_POLICY_URL")
                .map_err(|_| anyhow!("REDPROBE_POLICY=cloud requires REDPROBE_CLOUD_POLICY_URL"))?;
            Ok(PolicyKind::Cloud(CloudConfig {
                url,
                bearer_token: env::var("REDPROBE_CLOUD_POLICY_TOKEN").ok(),
                timeout_ms: parse_optional_u64("REDPROBE_CLOUD_POLICY_TIMEOUT_MS")?
                    .unwrap_or(crate::policy::cloud::DEFAULT_CLOUD_TIMEOUT_MS),
            }))
        }
        other => Err(anyhow!("unknown policy {other:?}")),
    }
}

fn parse_mutators() -> Result<Vec<Transform>> {
    match env::var("REDPROBE_MUTATORS") {
        Ok(raw) => raw
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| Transform::from_str(s).map_err(|e| anyhow!(e)))
            .collect(),
        Err(_) => Ok(Vec::new()),
    }
}

fn parse_optional_u64(var: &str) -> Result<Option<u64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a positive integer", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_optional_f64(var: &str) -> Result<Option<f64>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => value
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| anyhow!("{} must be a number", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool_env(var: &str) -> Result<Option<bool>> {
    match env::var(var) {
        Ok(value) if !value.trim().is_empty() => parse_bool(&value)
            .map(Some)
            .ok_or_else(|| anyhow!("{} must be a boolean (true/false/1/0)", var)),
        Ok(_) => Ok(None),
        Err(env::VarError::NotPresent) => Ok(None),
        Err(err) => Err(err.into()),
    }
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

/// CI-mode configuration file (TOML).
///
/// ```toml
/// [general]
/// llmSpec = "POST https://target/api\nContent-Type: application/json\n\n{\"p\":\"<<PROMPT>>\"}"
/// maxBudget = 100000
/// max_th = 0.3
///
/// [modules.injection]
/// dataset_name = "prompt-injection"
///
/// [thresholds]
/// low = 0.1
/// medium = 0.3
/// high = 0.5
/// ```
#[derive(Debug, Clone, Deserialize)]
pub struct CiConfig {
    pub general: CiGeneral,
    #[serde(default)]
    pub modules: BTreeMap<String, CiModule>,
    #[serde(default)]
    pub thresholds: Thresholds,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CiGeneral {
    #[serde(rename = "llmSpec")]
    pub llm_spec: String,
    #[serde(rename = "maxBudget", default = "default_ci_budget")]
    pub max_budget: u64,
    #[serde(default = "default_max_th")]
    pub max_th: f64,
    #[serde(default)]
    pub optimize: bool,
    #[serde(rename = "enableMultiStepAttack", default)]
    pub enable_multi_step_attack: bool,
}

fn default_ci_budget() -> u64 {
    100_000
}

fn default_max_th() -> f64 {
    0.5
}

#[derive(Debug, Clone, Deserialize)]
pub struct CiModule {
    pub dataset_name: String,
    /// Opaque per-module options, passed through untouched.
    #[serde(default)]
    pub opts: toml::Table,
}

impl CiConfig {
    pub fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read CI config '{path}'"))?;
        toml::from_str::<CiConfig>(&content)
            .with_context(|| format!("failed to parse CI config '{path}': invalid TOML"))
    }
}
