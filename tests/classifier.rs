use std::sync::Arc;

use redprobe::refusal::{Detector, RefusalClassifier};

struct FixedDetector {
    name: &'static str,
    answer: bool,
}

impl Detector for FixedDetector {
    fn name(&self) -> &str {
        self.name
    }

    fn is_refusal(&self, _response: &str) -> anyhow::Result<bool> {
        Ok(self.answer)
    }
}

struct FailingDetector;

impl Detector for FailingDetector {
    fn name(&self) -> &str {
        "failing"
    }

    fn is_refusal(&self, _response: &str) -> anyhow::Result<bool> {
        anyhow::bail!("detector exploded")
    }
}

#[test]
fn canonical_refusal_classifies_and_empty_does_not() {
    let classifier = RefusalClassifier::builtin();
    assert!(
        classifier
            .classify("I'm sorry, I can't help with that.")
            .refusal
    );
    assert!(!classifier.classify("").refusal);
    assert!(!classifier.classify("ok").refusal);
}

#[test]
fn first_firing_detector_short_circuits() {
    let mut classifier = RefusalClassifier::default();
    classifier.register(Arc::new(FixedDetector {
        name: "first",
        answer: true,
    }));
    classifier.register(Arc::new(FixedDetector {
        name: "second",
        answer: true,
    }));
    let verdict = classifier.classify("anything");
    assert!(verdict.refusal);
    assert_eq!(verdict.matched_by.as_deref(), Some("first"));
}

#[test]
fn failing_detector_counts_as_false_and_warns() {
    let mut classifier = RefusalClassifier::default();
    classifier.register(Arc::new(FailingDetector));
    classifier.register(Arc::new(FixedDetector {
        name: "after",
        answer: true,
    }));
    let verdict = classifier.classify("whatever");
    // Evaluation proceeded past the failure.
    assert!(verdict.refusal);
    assert_eq!(verdict.matched_by.as_deref(), Some("after"));
    assert_eq!(verdict.warnings.len(), 1);
    assert!(verdict.warnings[0].contains("failing"));
}

#[test]
fn custom_detectors_extend_the_builtin_set() {
    let mut classifier = RefusalClassifier::builtin();
    let builtin_len = classifier.len();
    classifier.register(Arc::new(FixedDetector {
        name: "custom",
        answer: false,
    }));
    assert_eq!(classifier.len(), builtin_len + 1);
    // Still behaves on a canonical refusal.
    assert!(classifier.classify("I cannot comply").refusal);
}
