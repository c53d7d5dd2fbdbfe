// src/trigger/timer.rs - Fires after a fixed interval of unpaused print time
use std::sync::Arc;
use std::time::{Duration, Instant};

use lapse_shared::TimeInterface;
use lapse_shared::config::ExtruderGate;

use tracing::warn;

use super::{TriggerStatus, gate_open, position_ready};
use crate::position::PositionState;

pub struct TimerTrigger {
    interval: Duration,
    gate: ExtruderGate,
    clock: Arc<dyn TimeInterface>,
    /// Start of the current interval. Shifted forward by time spent paused.
    interval_start: Option<Instant>,
    paused_at: Option<Instant>,
    status: TriggerStatus,
}

impl std::fmt::Debug for TimerTrigger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimerTrigger")
            .field("interval", &self.interval)
            .field("interval_start", &self.interval_start)
            .field("paused_at", &self.paused_at)
            .field("status", &self.status)
            .finish()
    }
}

impl TimerTrigger {
    /// An interval that is not a finite, non-negative number of seconds
    /// never elapses.
    pub fn new(interval_seconds: f64, gate: ExtruderGate, clock: Arc<dyn TimeInterface>) -> Self {
        let interval = Duration::try_from_secs_f64(interval_seconds).unwrap_or_else(|e| {
            warn!("Timer interval {}s is unusable ({}); timer disabled", interval_seconds, e);
            Duration::MAX
        });
        Self {
            interval,
            gate,
            clock,
            interval_start: None,
            paused_at: None,
            status: TriggerStatus::default(),
        }
    }

    pub fn update(&mut self, position: &PositionState) {
        let now = self.clock.now_monotonic();
        let Some(start) = self.interval_start else {
            // Timing starts with the first command of the print.
            self.interval_start = Some(now);
            self.status.is_triggered = false;
            return;
        };
        if self.paused_at.is_some() || !position_ready(position) {
            self.status.is_triggered = false;
            return;
        }
        let primary = now.saturating_duration_since(start) >= self.interval;
        self.status.resolve(primary, gate_open(&self.gate, position));
    }

    pub fn status(&self) -> TriggerStatus {
        self.status
    }

    /// Time left until the interval elapses, ignoring the gate.
    pub fn remaining(&self) -> Option<Duration> {
        let start = self.interval_start?;
        let now = self.paused_at.unwrap_or_else(|| self.clock.now_monotonic());
        Some(self.interval.saturating_sub(now.saturating_duration_since(start)))
    }

    pub fn pause(&mut self) {
        if self.paused_at.is_none() {
            self.paused_at = Some(self.clock.now_monotonic());
        }
    }

    pub fn resume(&mut self) {
        let Some(paused_at) = self.paused_at.take() else {
            return;
        };
        let paused_for = self.clock.now_monotonic().saturating_duration_since(paused_at);
        if let Some(start) = self.interval_start {
            self.interval_start = Some(start + paused_for);
        }
    }

    /// Starts a new interval at the current time.
    pub fn restart_interval(&mut self) {
        self.status.clear();
        self.interval_start = Some(self.clock.now_monotonic());
    }
}
