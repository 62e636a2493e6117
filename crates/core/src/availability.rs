use serde::Serialize;
use std::collections::HashMap;

/// Consecutive failures before a display is reported unavailable.
pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;

/// Consecutive-failure hysteresis per stable id, so a single dropped DDC
/// reply does not flip a display to unavailable.
#[derive(Debug, Clone)]
pub struct AvailabilityTracker {
    threshold: u32,
    failures: HashMap<String, u32>,
}

impl AvailabilityTracker {
    pub fn new() -> Self {
        Self::with_threshold(DEFAULT_FAILURE_THRESHOLD)
    }

    pub fn with_threshold(threshold: u32) -> Self {
        Self {
            threshold: threshold.max(1),
            failures: HashMap::new(),
        }
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn register_success(&mut self, stable_id: &str) {
        self.failures.remove(stable_id);
    }

    /// Records a failure and returns the consecutive failure count.
    pub fn register_failure(&mut self, stable_id: &str) -> u32 {
        let count = self.failures.entry(stable_id.to_string()).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn failure_count(&self, stable_id: &str) -> u32 {
        self.failures.get(stable_id).copied().unwrap_or(0)
    }

    pub fn has_reached_threshold(&self, stable_id: &str) -> bool {
        self.failure_count(stable_id) >= self.threshold
    }

    pub fn snapshot(&self) -> Vec<FailureCount> {
        let mut counts: Vec<FailureCount> = self
            .failures
            .iter()
            .map(|(id, count)| FailureCount { stable_id: id.clone(), consecutive_failures: *count })
            .collect();
        counts.sort_by(|a, b| a.stable_id.cmp(&b.stable_id));
        counts
    }
}

impl Default for AvailabilityTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FailureCount {
    pub stable_id: String,
    pub consecutive_failures: u32,
}
