//! Per-module accounting.
//!
//! One owner per module mutates this; workers never touch it.  Compliance
//! (the target did not refuse) counts as a failure of the target, so
//! `failure_rate` is the compliance share.

use super::events::{ModuleState, ProgressEvent};
use crate::util::approx_cost;

pub struct ModuleAccounting {
    pub module: String,
    /// Planned number of attempts: the dataset size.
    pub planned: u64,
    pub attempts: u64,
    pub refusals: u64,
    pub compliance: u64,
    pub transport_errors: u64,
    pub tokens: u64,
    pub cost: f64,
    pub state: ModuleState,
    attempts_since_tick: u64,
    last_tick_percent: i64,
}

impl ModuleAccounting {
    pub fn new(module: impl Into<String>, planned: u64) -> Self {
        Self {
            module: module.into(),
            planned,
            attempts: 0,
            refusals: 0,
            compliance: 0,
            transport_errors: 0,
            tokens: 0,
            cost: 0.0,
            state: ModuleState::Init,
            attempts_since_tick: 0,
            last_tick_percent: -1,
        }
    }

    pub fn record_refusal(&mut self, prompt_tokens: u64, response_tokens: u64) {
        self.record_attempt(prompt_tokens, response_tokens);
        self.refusals += 1;
    }

    pub fn record_compliance(&mut self, prompt_tokens: u64, response_tokens: u64) {
        self.record_attempt(prompt_tokens, response_tokens);
        self.compliance += 1;
    }

    /// Transport errors count as attempts but stay out of the
    /// refusal/compliance tally.  The prompt tokens were already spent.
    pub fn record_transport_error(&mut self, prompt_tokens: u64) {
        self.record_attempt(prompt_tokens, 0);
        self.transport_errors += 1;
    }

    fn record_attempt(&mut self, prompt_tokens: u64, response_tokens: u64) {
        self.state = ModuleState::Running;
        self.attempts += 1;
        self.attempts_since_tick += 1;
        self.tokens += prompt_tokens;
        self.cost += approx_cost(prompt_tokens + response_tokens);
    }

    /// 0..100 percentage of attempts the target complied with.
    pub fn failure_rate(&self) -> f64 {
        100.0 * self.compliance as f64 / self.attempts.max(1) as f64
    }

    /// 0..1 ratio form, fed (negated) to the Bayesian optimizer.
    pub fn failure_ratio(&self) -> f64 {
        self.compliance as f64 / self.attempts.max(1) as f64
    }

    /// 0..100, non-decreasing: attempts only grow.
    pub fn progress(&self) -> f64 {
        (100.0 * self.attempts as f64 / self.planned.max(1) as f64).min(100.0)
    }

    /// Emit a tick when enough attempts accumulated since the last one or
    /// when progress crossed an integer percent.
    pub fn tick_if_due(&mut self, interval: u64) -> Option<ProgressEvent> {
        let percent = self.progress().floor() as i64;
        if self.attempts_since_tick >= interval.max(1) || percent > self.last_tick_percent {
            Some(self.tick())
        } else {
            None
        }
    }

    /// Forced final tick at 100, emitted once when a module completes all
    /// planned attempts and the last tick was below 100.
    pub fn final_tick(&mut self) -> Option<ProgressEvent> {
        if self.last_tick_percent >= 100 {
            return None;
        }
        self.attempts_since_tick = 0;
        self.last_tick_percent = 100;
        Some(ProgressEvent::Tick {
            module: self.module.clone(),
            tokens: self.tokens,
            cost: self.cost,
            progress: 100.0,
            failure_rate: self.failure_rate(),
        })
    }

    fn tick(&mut self) -> ProgressEvent {
        self.attempts_since_tick = 0;
        self.last_tick_percent = self.progress().floor() as i64;
        ProgressEvent::Tick {
            module: self.module.clone(),
            tokens: self.tokens,
            cost: self.cost,
            progress: self.progress(),
            failure_rate: self.failure_rate(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failure_rate_is_compliance_share() {
        let mut acct = ModuleAccounting::new("m", 4);
        acct.record_compliance(5, 1);
        assert_eq!(acct.failure_rate(), 100.0);
        acct.record_refusal(5, 1);
        assert_eq!(acct.failure_rate(), 50.0);
        acct.record_transport_error(5);
        // Errors dilute the rate but never count as compliance.
        assert!((acct.failure_rate() - 100.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn progress_tracks_attempts_and_caps_at_100() {
        let mut acct = ModuleAccounting::new("m", 2);
        assert_eq!(acct.progress(), 0.0);
        acct.record_refusal(1, 1);
        assert_eq!(acct.progress(), 50.0);
        acct.record_refusal(1, 1);
        acct.record_refusal(1, 1);
        assert_eq!(acct.progress(), 100.0);
    }

    #[test]
    fn ticks_respect_interval_and_percent_crossings() {
        let mut acct = ModuleAccounting::new("m", 100);
        acct.record_refusal(1, 0);
        // Interval 4 not reached, but 1% crossed.
        assert!(acct.tick_if_due(4).is_some());
        assert!(acct.tick_if_due(4).is_none());
        for _ in 0..4 {
            acct.record_refusal(0, 0);
        }
        assert!(acct.tick_if_due(4).is_some());
    }

    #[test]
    fn final_tick_fires_once() {
        let mut acct = ModuleAccounting::new("m", 1);
        acct.record_compliance(1, 1);
        assert!(acct.final_tick().is_some());
        assert!(acct.final_tick().is_none());
    }
}
