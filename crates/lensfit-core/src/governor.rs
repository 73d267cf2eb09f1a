//! Latency-driven operating mode for the detector.
//!
//! The mode is re-evaluated from the latency of every single run. There is
//! no smoothing or hysteresis, so borderline latencies flip the mode back
//! and forth between runs.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;

const LOW_MODE_ABOVE: Duration = Duration::from_millis(200);
const MEDIUM_MODE_FROM: Duration = Duration::from_millis(100);
const HISTORY_LEN: usize = 10;

/// Detector operating mode: input resolution and throttle interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PerformanceMode {
    #[default]
    High,
    Medium,
    Low,
}

impl PerformanceMode {
    /// Square model input size in pixels.
    pub fn input_size(self) -> u32 {
        match self {
            PerformanceMode::High => 320,
            PerformanceMode::Medium => 256,
            PerformanceMode::Low => 224,
        }
    }

    /// Minimum time between two actual inference runs.
    pub fn min_interval(self) -> Duration {
        match self {
            PerformanceMode::High => Duration::from_millis(300),
            PerformanceMode::Medium => Duration::from_millis(500),
            PerformanceMode::Low => Duration::from_millis(700),
        }
    }

    fn for_latency(latency: Duration) -> Self {
        if latency > LOW_MODE_ABOVE {
            PerformanceMode::Low
        } else if latency >= MEDIUM_MODE_FROM {
            PerformanceMode::Medium
        } else {
            PerformanceMode::High
        }
    }
}

/// Tracks latency history and consecutive detection failures.
#[derive(Debug, Default)]
pub struct PerformanceGovernor {
    mode: PerformanceMode,
    history: VecDeque<Duration>,
    consecutive_failures: u32,
}

impl PerformanceGovernor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mode(&self) -> PerformanceMode {
        self.mode
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Feed the latency of the run that just finished and return the new mode.
    pub fn record_latency(&mut self, latency: Duration) -> PerformanceMode {
        if self.history.len() == HISTORY_LEN {
            self.history.pop_front();
        }
        self.history.push_back(latency);

        let next = PerformanceMode::for_latency(latency);
        if next != self.mode {
            tracing::debug!(
                from = ?self.mode,
                to = ?next,
                latency_ms = latency.as_millis() as u64,
                avg_latency_ms = self.average_latency().map(|avg| avg.as_millis() as u64),
                "performance mode changed"
            );
        }
        self.mode = next;
        next
    }

    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
    }

    pub fn record_failure(&mut self) {
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    }

    /// Mean latency over the retained history.
    pub fn average_latency(&self) -> Option<Duration> {
        if self.history.is_empty() {
            return None;
        }
        let total: Duration = self.history.iter().sum();
        Some(total / self.history.len() as u32)
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}
