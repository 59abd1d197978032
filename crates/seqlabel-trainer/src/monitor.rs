//! Listeners invoked after each evaluation cycle, and the plateau monitor
//! that stops training when the watched metric stops improving.

use std::time::{Duration, Instant};

use tracing::{info, warn};

use seqlabel_core::EvalMetrics;

use crate::config::StopIfNoIncreaseParams;

/// What a listener asks the training loop to do next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerAction {
    Continue,
    Stop,
}

/// Hook called synchronously by the orchestrator after every evaluation.
pub trait TrainingListener {
    fn after_evaluation(&mut self, metrics: &EvalMetrics) -> ListenerAction;

    fn name(&self) -> &'static str;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitorState {
    Watching,
    Stopped,
}

/// Stops training once `metric` has not increased for
/// `max_steps_without_increase` evaluation cycles.
///
/// The stop check only runs once `min_steps` global steps have passed and at
/// most once every `run_every`. `Stopped` is terminal.
#[derive(Debug, Clone)]
pub struct StopIfNoIncrease {
    metric: String,
    min_steps: u64,
    max_steps_without_increase: u64,
    run_every: Duration,
    best: Option<f32>,
    best_step: Option<u64>,
    cycles_without_increase: u64,
    cycles_observed: u64,
    last_poll: Option<Instant>,
    state: MonitorState,
}

impl StopIfNoIncrease {
    pub fn new(
        metric: impl Into<String>,
        min_steps: u64,
        max_steps_without_increase: u64,
        run_every: Duration,
    ) -> Self {
        Self {
            metric: metric.into(),
            min_steps,
            max_steps_without_increase,
            run_every,
            best: None,
            best_step: None,
            cycles_without_increase: 0,
            cycles_observed: 0,
            last_poll: None,
            state: MonitorState::Watching,
        }
    }

    pub fn from_params(metric: impl Into<String>, params: &StopIfNoIncreaseParams) -> Self {
        Self::new(
            metric,
            params.min_steps,
            params.max_steps_without_increase,
            Duration::from_secs(params.run_every_secs),
        )
    }

    /// Record `value` observed at `step` and decide whether to stop, using
    /// `now` for the poll throttle.
    pub fn observe_at(&mut self, step: u64, value: f32, now: Instant) -> ListenerAction {
        if self.state == MonitorState::Stopped {
            return ListenerAction::Stop;
        }

        self.cycles_observed += 1;
        if self.best.map_or(!value.is_nan(), |best| value > best) {
            self.best = Some(value);
            self.best_step = Some(step);
            self.cycles_without_increase = 0;
        } else {
            self.cycles_without_increase += 1;
        }

        if step < self.min_steps {
            return ListenerAction::Continue;
        }
        let poll_due = self
            .last_poll
            .map_or(true, |last| now.duration_since(last) >= self.run_every);
        if !poll_due {
            return ListenerAction::Continue;
        }
        self.last_poll = Some(now);

        if self.cycles_without_increase >= self.max_steps_without_increase {
            info!(
                metric = %self.metric,
                best = ?self.best,
                best_step = ?self.best_step,
                cycles = self.cycles_without_increase,
                step,
                "no increase in metric, requesting stop"
            );
            self.state = MonitorState::Stopped;
            return ListenerAction::Stop;
        }
        ListenerAction::Continue
    }

    pub fn observe(&mut self, step: u64, value: f32) -> ListenerAction {
        self.observe_at(step, value, Instant::now())
    }

    pub fn state(&self) -> MonitorState {
        self.state
    }

    pub fn best(&self) -> Option<f32> {
        self.best
    }

    pub fn best_step(&self) -> Option<u64> {
        self.best_step
    }

    pub fn cycles_without_increase(&self) -> u64 {
        self.cycles_without_increase
    }

    pub fn cycles_observed(&self) -> u64 {
        self.cycles_observed
    }
}

impl TrainingListener for StopIfNoIncrease {
    fn after_evaluation(&mut self, metrics: &EvalMetrics) -> ListenerAction {
        match metrics.get(&self.metric) {
            Some(value) => self.observe(metrics.global_step, value),
            None if self.state == MonitorState::Stopped => ListenerAction::Stop,
            None => {
                warn!(metric = %self.metric, "metric missing from evaluation results");
                ListenerAction::Continue
            }
        }
    }

    fn name(&self) -> &'static str {
        "StopIfNoIncrease"
    }
}
