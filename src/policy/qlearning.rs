use std::collections::HashMap;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use super::{unguarded_indices, CycleGuard, Policy};
use crate::util::content_hash;

const ALPHA: f64 = 0.1;
const GAMMA: f64 = 0.9;
const EPSILON_INITIAL: f64 = 1.0;
const EPSILON_DECAY: f64 = 0.995;
const EPSILON_FLOOR: f64 = 0.01;

/// Tabular Q-learning over prompt transitions.  State is the content hash
/// of the current prompt, actions are prompt indices, Q entries default to
/// zero.  Exploration is ε-greedy with ε decaying per update.
pub struct QLearningPolicy {
    prompts: Vec<String>,
    guard: CycleGuard,
    q: HashMap<(u64, usize), f64>,
    epsilon: f64,
    rng: StdRng,
}

impl QLearningPolicy {
    pub fn new(prompts: Vec<String>, guard_capacity: usize, seed: Option<u64>) -> Self {
        Self {
            prompts,
            guard: CycleGuard::new(guard_capacity),
            q: HashMap::new(),
            epsilon: EPSILON_INITIAL,
            rng: match seed {
                Some(s) => StdRng::seed_from_u64(s),
                None => StdRng::from_entropy(),
            },
        }
    }

    pub fn epsilon(&self) -> f64 {
        self.epsilon
    }

    fn q_value(&self, state: u64, action: usize) -> f64 {
        self.q.get(&(state, action)).copied().unwrap_or(0.0)
    }

    fn max_q(&self, state: u64) -> f64 {
        (0..self.prompts.len())
            .map(|a| self.q_value(state, a))
            .fold(0.0_f64, f64::max)
    }

    /// Greedy action among candidates; ties resolve to the lowest index.
    fn argmax(&self, state: u64, candidates: &[usize]) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for &idx in candidates {
            let value = self.q_value(state, idx);
            best = match best {
                None => Some((idx, value)),
                Some((best_idx, best_value))
                    if value > best_value || (value == best_value && idx < best_idx) =>
                {
                    Some((idx, value))
                }
                other => other,
            };
        }
        best.map(|(idx, _)| idx)
    }
}

#[async_trait::async_trait]
impl Policy for QLearningPolicy {
    fn name(&self) -> &str {
        "qlearning"
    }

    async fn next(&mut self, current: Option<&str>, _passed_guard: bool) -> Option<String> {
        if self.prompts.is_empty() {
            return None;
        }
        let state = content_hash(current.unwrap_or(""));
        let candidates = unguarded_indices(&self.prompts, &self.guard);
        let idx = if self.rng.gen_bool(self.epsilon) {
            *candidates.choose(&mut self.rng)?
        } else {
            self.argmax(state, &candidates)?
        };
        let prompt = self.prompts[idx].clone();
        self.guard.remember(&prompt);
        Some(prompt)
    }

    fn update(&mut self, prev: &str, curr: &str, reward: f64, _passed_guard: bool) {
        let Some(action) = self.prompts.iter().position(|p| p == curr) else {
            return;
        };
        let state = content_hash(prev);
        let next_state = content_hash(curr);
        let max_next = self.max_q(next_state);
        let entry = self.q.entry((state, action)).or_insert(0.0);
        *entry += ALPHA * (reward + GAMMA * max_next - *entry);
        self.epsilon = (self.epsilon * EPSILON_DECAY).max(EPSILON_FLOOR);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(prompts: &[&str]) -> QLearningPolicy {
        QLearningPolicy::new(
            prompts.iter().map(|s| s.to_string()).collect(),
            10,
            Some(3),
        )
    }

    #[test]
    fn update_applies_bellman_step() {
        let mut p = policy(&["a", "b"]);
        p.update("a", "b", 1.0, false);
        let state = content_hash("a");
        // Q starts at 0, max over next state is 0: Q <- 0 + 0.1 * (1 + 0.9*0 - 0)
        assert!((p.q_value(state, 1) - 0.1).abs() < 1e-12);
    }

    #[test]
    fn epsilon_decays_to_floor() {
        let mut p = policy(&["a", "b"]);
        for _ in 0..2000 {
            p.update("a", "b", -1.0, true);
        }
        assert!((p.epsilon() - EPSILON_FLOOR).abs() < 1e-12);
    }

    #[test]
    fn greedy_ties_break_to_lowest_index() {
        let p = policy(&["a", "b", "c"]);
        let state = content_hash("");
        assert_eq!(p.argmax(state, &[0, 1, 2]), Some(0));
        assert_eq!(p.argmax(state, &[2, 1]), Some(1));
    }
}
