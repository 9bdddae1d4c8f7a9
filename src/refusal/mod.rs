//! Refusal classification.
//!
//! Each detector encapsulates one way of recognising a refusal in a target
//! response.  The `RefusalClassifier` evaluates registered detectors in
//! order and stops at the first one that fires.  The detector set is frozen
//! for the duration of a scan: the engine holds the classifier behind an
//! `Arc` built before the scan starts.

use std::sync::Arc;

pub mod pattern;
pub mod phrase;

pub use pattern::PatternDetector;
pub use phrase::PhraseMatchDetector;

/// Trait implemented by all detectors.  The predicate is pure: no I/O, no
/// shared mutable state.  A detector that fails is treated as having
/// answered `false`; the classifier records a warning and moves on.
pub trait Detector: Send + Sync {
    fn name(&self) -> &str;
    fn is_refusal(&self, response: &str) -> anyhow::Result<bool>;
}

/// Outcome of classifying one response body.
#[derive(Clone, Debug, Default)]
pub struct Verdict {
    pub refusal: bool,
    /// Name of the detector that fired (present only when `refusal`).
    pub matched_by: Option<String>,
    /// One entry per detector that errored while evaluating.
    pub warnings: Vec<String>,
}

#[derive(Clone, Default)]
pub struct RefusalClassifier {
    detectors: Vec<Arc<dyn Detector>>,
}

impl RefusalClassifier {
    /// Classifier with the built-in detectors registered.
    pub fn builtin() -> Self {
        let mut c = Self::default();
        c.register(Arc::new(PhraseMatchDetector::default()));
        c.register(Arc::new(PatternDetector::default()));
        c
    }

    /// Register an additional detector.  Must happen before the classifier
    /// is handed to a scan; the set does not change mid-scan.
    pub fn register(&mut self, detector: Arc<dyn Detector>) {
        self.detectors.push(detector);
    }

    /// Evaluate detectors in registration order; the first `true`
    /// short-circuits.  An erroring detector counts as `false` and is
    /// reported through `Verdict::warnings`.
    pub fn classify(&self, response: &str) -> Verdict {
        let mut verdict = Verdict::default();
        for detector in &self.detectors {
            match detector.is_refusal(response) {
                Ok(true) => {
                    verdict.refusal = true;
                    verdict.matched_by = Some(detector.name().to_string());
                    return verdict;
                }
                Ok(false) => {}
                Err(err) => {
                    tracing::warn!(detector = %detector.name(), error = %err, "detector failed");
                    verdict
                        .warnings
                        .push(format!("{}: {}", detector.name(), err));
                }
            }
        }
        verdict
    }

    pub fn len(&self) -> usize {
        self.detectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.detectors.is_empty()
    }
}
