use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::{unguarded_indices, CycleGuard, Policy};

/// Uniform pick among prompts not present in the cycle guard.
pub struct RandomPolicy {
    prompts: Vec<String>,
    guard: CycleGuard,
    rng: StdRng,
}

impl RandomPolicy {
    pub fn new(prompts: Vec<String>, guard_capacity: usize, seed: Option<u64>) -> Self {
        Self {
            prompts,
            guard: CycleGuard::new(guard_capacity),
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
        }
    }
}

#[async_trait::async_trait]
impl Policy for RandomPolicy {
    fn name(&self) -> &str {
        "random"
    }

    async fn next(&mut self, _current: Option<&str>, _passed_guard: bool) -> Option<String> {
        if self.prompts.is_empty() {
            return None;
        }
        let candidates = unguarded_indices(&self.prompts, &self.guard);
        let idx = *candidates.choose(&mut self.rng)?;
        let prompt = self.prompts[idx].clone();
        self.guard.remember(&prompt);
        Some(prompt)
    }
}
