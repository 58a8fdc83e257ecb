//! Flip-flop detection.
//!
//! Every poll tick reads each watched setting, appends the value to that
//! setting's [`HistoryWindow`] and re-classifies the window. A window flips
//! when it holds at least `min_observations` entries and the value changed at
//! least `min_flips` times between consecutive entries. Classification only
//! looks at the current window, so a setting that calms down stops firing once
//! the old values age out; there is no explicit "stable" event.

use crate::backend::{blocking_pass, SettingBackend, SettingReader};
use crate::bus::EventBus;
use crate::history::HistoryWindow;
use drift_common::config::DriftConfig;
use drift_common::{Event, SettingRef};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub struct DriftDetector {
    settings: Vec<SettingRef>,
    window: Duration,
    poll_interval: Duration,
    min_flips: usize,
    min_observations: usize,
    histories: HashMap<SettingRef, HistoryWindow>,
}

impl DriftDetector {
    pub fn new(
        settings: Vec<SettingRef>,
        window: Duration,
        poll_interval: Duration,
        min_flips: usize,
        min_observations: usize,
    ) -> Self {
        Self {
            settings,
            window,
            poll_interval,
            min_flips,
            min_observations,
            histories: HashMap::new(),
        }
    }

    pub fn from_config(config: &DriftConfig) -> Self {
        Self::new(
            config.settings.clone(),
            config.window(),
            config.poll_interval(),
            config.min_flips,
            config.min_observations,
        )
    }

    pub fn history(&self, setting: &SettingRef) -> Option<&HistoryWindow> {
        self.histories.get(setting)
    }

    /// One poll tick at `now`; returns the flip-flop events to publish
    pub fn poll<B: SettingReader + ?Sized>(&mut self, backend: &B, now: Instant) -> Vec<Event> {
        let mut events = Vec::new();

        for setting in &self.settings {
            let value = match backend.read(setting) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Drift read skipped: {}", e);
                    continue;
                }
            };

            let history = self
                .histories
                .entry(setting.clone())
                .or_insert_with(|| HistoryWindow::new(self.window));
            history.record(now, value);

            let changes = history.changes();
            if history.len() >= self.min_observations && changes >= self.min_flips {
                debug!(
                    "{} flipping: {} changes across {} observations",
                    setting,
                    changes,
                    history.len()
                );
                events.push(Event::flip_flop(setting.clone(), history.len()));
            }
        }

        events
    }

    /// Poll until cancelled, publishing every detection
    pub async fn run(self, backend: Arc<dyn SettingBackend>, bus: EventBus, cancel: CancellationToken) {
        info!(
            "Drift detector watching {} settings every {:?} (window {:?})",
            self.settings.len(),
            self.poll_interval,
            self.window
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut detector = self;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                tick = ticker.tick() => {
                    let backend = backend.clone();
                    let now = tick.into_std();
                    match blocking_pass(detector, move |d: &mut DriftDetector| d.poll(backend.as_ref(), now)).await {
                        Ok((returned, events)) => {
                            detector = returned;
                            for event in events {
                                bus.publish(event);
                            }
                        }
                        Err(e) => {
                            error!("Drift poll task failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        info!("Drift detector stopped");
    }
}
