//! Utility helpers for Redprobe.
//!
//! Shared pattern compilation, prompt identity hashing and the token/cost
//! approximations used by the accounting layer.  These helpers are
//! deliberately lightweight and avoid dependencies beyond what the main
//! application already needs.

use ahash::AHasher;
use aho_corasick::{AhoCorasick, AhoCorasickBuilder};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// A memoising wrapper around `AhoCorasick::new` to avoid recompiling
/// automata for repeated lists.  The cache key is a hash of the pattern list.
static AC_CACHE: Lazy<DashMap<u64, Arc<AhoCorasick>>> = Lazy::new(DashMap::new);

/// Given a list of literal patterns, return a shared `AhoCorasick` matcher.
/// If a matcher for the list already exists in the cache, a cloned Arc is
/// returned.  Otherwise a new matcher is constructed and inserted.  The
/// caller must ensure that the pattern set does not change between calls.
pub fn ac_for(list: &[String]) -> Arc<AhoCorasick> {
    // Compute a stable hash of the pattern list.
    let mut hasher = AHasher::default();
    for pat in list {
        pat.hash(&mut hasher);
    }
    let key = hasher.finish();
    if let Some(existing) = AC_CACHE.get(&key) {
        return existing.clone();
    }
    // Build AC: case insensitive by lower‑casing patterns
    let mut lower = Vec::with_capacity(list.len());
    for p in list {
        lower.push(p.to_lowercase());
    }
    let ac = AhoCorasickBuilder::new()
        .ascii_case_insensitive(true)
        .build(lower)
        .unwrap();
    let arc = Arc::new(ac);
    AC_CACHE.insert(key, arc.clone());
    arc
}

/// Stable identity hash of a prompt's content.  Cycle guards and the
/// Q-learning state space key on this value rather than the full string.
pub fn content_hash(text: &str) -> u64 {
    let mut hasher = AHasher::default();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Whitespace-split token approximation.  Kept intentionally crude: the
/// budget accounting only needs a consistent estimate, not a tokenizer.
pub fn approx_tokens(text: &str) -> u64 {
    text.split_whitespace().count() as u64
}

/// Flat per-1k-token price used for the cost column in tick events.
pub const COST_PER_1K_TOKENS: f64 = 0.002;

pub fn approx_cost(tokens: u64) -> f64 {
    tokens as f64 / 1000.0 * COST_PER_1K_TOKENS
}
