//! Scan progress events.
//!
//! The engine streams newline-delimited JSON, one event per line.  Per
//! module the stream is ordered by the accounting owner: `progress` is
//! non-decreasing and the last event is either a final tick at 100 or a
//! terminating status.  Consumers must tolerate unknown fields.

use serde::{Deserialize, Serialize};

/// Module name used for scan-wide (top-level) events.
pub const SCAN_MODULE: &str = "scan";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "lowercase")]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    Tick {
        module: String,
        tokens: u64,
        cost: f64,
        /// 0..100
        progress: f64,
        /// 0..100
        failure_rate: f64,
    },
    Status {
        module: String,
        status: String,
    },
    Error {
        module: String,
        error: String,
    },
}

impl ProgressEvent {
    pub fn status(module: impl Into<String>, status: impl Into<String>) -> Self {
        ProgressEvent::Status {
            module: module.into(),
            status: status.into(),
        }
    }

    pub fn error(module: impl Into<String>, error: impl Into<String>) -> Self {
        ProgressEvent::Error {
            module: module.into(),
            error: error.into(),
        }
    }

    pub fn module(&self) -> &str {
        match self {
            ProgressEvent::Tick { module, .. }
            | ProgressEvent::Status { module, .. }
            | ProgressEvent::Error { module, .. } => module,
        }
    }
}

/// Per-module lifecycle.  `Running` repeats; everything to the right of it
/// is terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ModuleState {
    Init,
    Running,
    Done,
    Stopped,
    Errored,
    BudgetExhausted,
    /// The policy ran out of prompts before the module finished.
    Exhausted,
}

impl ModuleState {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ModuleState::Init | ModuleState::Running)
    }

    pub fn as_status(&self) -> &'static str {
        match self {
            ModuleState::Init => "init",
            ModuleState::Running => "running",
            ModuleState::Done => "done",
            ModuleState::Stopped => "stopped",
            ModuleState::Errored => "errored",
            ModuleState::BudgetExhausted => "budget-exhausted",
            ModuleState::Exhausted => "exhausted",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn events_serialize_to_tagged_camel_case() {
        let ev = ProgressEvent::Tick {
            module: "m".into(),
            tokens: 12,
            cost: 0.5,
            progress: 50.0,
            failure_rate: 25.0,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["event"], "tick");
        assert_eq!(json["failureRate"], 25.0);
        assert_eq!(json["module"], "m");
    }

    #[test]
    fn unknown_fields_are_tolerated_on_input() {
        let line = r#"{"event":"status","module":"m","status":"done","extra":1}"#;
        let ev: ProgressEvent = serde_json::from_str(line).unwrap();
        assert_eq!(ev, ProgressEvent::status("m", "done"));
    }
}
