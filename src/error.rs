//! Error kinds surfaced by the scanner core.
//!
//! Spec and modality errors abort scan setup and are surfaced to the caller.
//! Transport errors are per-attempt and handled inside the engine.  Budget
//! exhaustion and stop requests are scan-wide terminations, not failures of
//! an individual attempt.

use thiserror::Error;

use crate::httpspec::Modality;

#[derive(Debug, Error)]
pub enum ProbeError {
    /// The HTTP blueprint could not be parsed.
    #[error("invalid HTTP spec: {0}")]
    Spec(String),

    /// The supplied payload kind does not match the spec's modality.
    #[error("modality mismatch: spec expects {expected}, payload is {supplied}")]
    Modality {
        expected: Modality,
        supplied: &'static str,
    },

    /// Network or timeout failure talking to the target.
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The policy produced no prompt while the module still had work left.
    #[error("policy returned no prompt")]
    PolicyExhausted,

    /// The global token budget ran out.
    #[error("token budget exhausted")]
    BudgetExhausted,

    /// A stop was requested while the scan was running.
    #[error("stop requested")]
    Stopped,

    #[error("configuration error: {0}")]
    Config(String),
}
