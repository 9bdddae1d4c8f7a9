//! Prompt-selection policies.
//!
//! A policy decides which prompt a module tries next and learns from the
//! outcome of each attempt.  Selection is asynchronous because the cloud
//! policy consults a remote service; the local policies resolve immediately.
//!
//! Policies that explore (random, Q-learning, cloud) carry a cycle guard: a
//! bounded FIFO of recently selected prompts, keyed by content hash.  A
//! guarded prompt is only returned again once the rest of the pool has been
//! exhausted.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::datasets::PromptDataset;
use crate::util::content_hash;

pub mod bayes;
pub mod cloud;
pub mod naive;
pub mod qlearning;
pub mod random;

pub use bayes::{BayesianOptimizer, OptimizerSignal, INIT_POINTS};
pub use cloud::{CloudConfig, CloudPolicy};
pub use naive::NaivePolicy;
pub use qlearning::QLearningPolicy;
pub use random::RandomPolicy;

pub const DEFAULT_GUARD_CAPACITY: usize = 300;

#[async_trait::async_trait]
pub trait Policy: Send {
    fn name(&self) -> &str;

    /// Select the next prompt given the most recent one and whether the
    /// target's guard held (refusal).  `None` means the policy has nothing
    /// left to offer for this module.
    async fn next(&mut self, current: Option<&str>, passed_guard: bool) -> Option<String>;

    /// Learn from an observed transition.  Reward is +1 when the target
    /// complied, -1 when it refused.
    fn update(&mut self, _prev: &str, _curr: &str, _reward: f64, _passed_guard: bool) {}

    /// How many times a remote selector fell back to a local pick.
    fn fallbacks(&self) -> u64 {
        0
    }
}

/// Bounded FIFO of recent prompt identities.
#[derive(Clone, Debug)]
pub struct CycleGuard {
    capacity: usize,
    ring: VecDeque<u64>,
}

impl CycleGuard {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ring: VecDeque::with_capacity(capacity.min(1024)),
        }
    }

    pub fn remember(&mut self, prompt: &str) {
        if self.capacity == 0 {
            return;
        }
        if self.ring.len() == self.capacity {
            self.ring.pop_front();
        }
        self.ring.push_back(content_hash(prompt));
    }

    pub fn contains(&self, prompt: &str) -> bool {
        let key = content_hash(prompt);
        self.ring.iter().any(|h| *h == key)
    }

    pub fn len(&self) -> usize {
        self.ring.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }
}

/// Indices of `prompts` currently allowed by the guard.  Falls back to the
/// whole pool when everything is guarded, so selection never starves.
pub(crate) fn unguarded_indices(prompts: &[String], guard: &CycleGuard) -> Vec<usize> {
    let open: Vec<usize> = prompts
        .iter()
        .enumerate()
        .filter(|(_, p)| !guard.contains(p))
        .map(|(i, _)| i)
        .collect();
    if open.is_empty() {
        (0..prompts.len()).collect()
    } else {
        open
    }
}

/// Which selection strategy a scan uses.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum PolicyKind {
    Naive,
    Random,
    #[serde(rename = "qlearning")]
    QLearning,
    Cloud(CloudConfig),
}

impl Default for PolicyKind {
    fn default() -> Self {
        PolicyKind::Naive
    }
}

/// Instantiate a policy for one module, seeded with the dataset's prompts.
pub fn build_policy(
    kind: &PolicyKind,
    dataset: &PromptDataset,
    guard_capacity: usize,
    seed: Option<u64>,
) -> Box<dyn Policy> {
    let prompts = dataset.prompts.clone();
    match kind {
        PolicyKind::Naive => Box::new(NaivePolicy::new(prompts)),
        PolicyKind::Random => Box::new(RandomPolicy::new(prompts, guard_capacity, seed)),
        PolicyKind::QLearning => Box::new(QLearningPolicy::new(prompts, guard_capacity, seed)),
        PolicyKind::Cloud(cfg) => {
            Box::new(CloudPolicy::new(prompts, guard_capacity, seed, cfg.clone()))
        }
    }
}
