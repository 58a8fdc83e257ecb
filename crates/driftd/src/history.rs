//! Bounded per-setting observation history.

use drift_common::Value;
use std::collections::{HashSet, VecDeque};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    pub at: Instant,
    pub value: Value,
}

/// Time-ordered observations no older than `window`.
///
/// Trimmed on every insert. Insertion is append-only; a timestamp earlier
/// than the newest entry is clamped to it.
#[derive(Debug, Clone)]
pub struct HistoryWindow {
    window: Duration,
    observations: VecDeque<Observation>,
}

impl HistoryWindow {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            observations: VecDeque::new(),
        }
    }

    pub fn record(&mut self, at: Instant, value: Value) {
        let at = match self.observations.back() {
            Some(last) if at < last.at => last.at,
            _ => at,
        };
        self.observations.push_back(Observation { at, value });
        self.trim(at);
    }

    /// Drop observations with `now - at > window`
    pub fn trim(&mut self, now: Instant) {
        while let Some(front) = self.observations.front() {
            if now.saturating_duration_since(front.at) > self.window {
                self.observations.pop_front();
            } else {
                break;
            }
        }
    }

    pub fn len(&self) -> usize {
        self.observations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty()
    }

    pub fn distinct_values(&self) -> usize {
        self.observations
            .iter()
            .map(|o| &o.value)
            .collect::<HashSet<_>>()
            .len()
    }

    /// Number of value changes between consecutive observations
    pub fn changes(&self) -> usize {
        self.observations
            .iter()
            .zip(self.observations.iter().skip(1))
            .filter(|(a, b)| a.value != b.value)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Observation> {
        self.observations.iter()
    }
}
