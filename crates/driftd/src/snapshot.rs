//! Snapshot diffing for one-time mutations.
//!
//! A baseline is captured before the first tick so the first interval never
//! fires spuriously. Settings that fail to read are absent from a snapshot,
//! never defaulted. Only settings present in both snapshots can mutate;
//! appearing or disappearing settings are logged but produce no event.

use crate::backend::{blocking_pass, SettingBackend, SettingReader};
use crate::bus::EventBus;
use drift_common::{Event, SettingRef, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Full point-in-time capture of the watched settings
pub type Snapshot = HashMap<SettingRef, Value>;

pub fn take_snapshot<B: SettingReader + ?Sized>(settings: &[SettingRef], backend: &B) -> Snapshot {
    let mut snapshot = Snapshot::with_capacity(settings.len());
    for setting in settings {
        match backend.read(setting) {
            Ok(value) => {
                snapshot.insert(setting.clone(), value);
            }
            Err(e) => warn!("Snapshot read skipped: {}", e),
        }
    }
    snapshot
}

/// Mutation events between two snapshots, in `settings` order
pub fn diff_snapshots(settings: &[SettingRef], old: &Snapshot, new: &Snapshot) -> Vec<Event> {
    let mut events = Vec::new();
    for setting in settings {
        match (old.get(setting), new.get(setting)) {
            (Some(before), Some(after)) if before != after => {
                events.push(Event::mutation(setting.clone(), before.clone(), after.clone()));
            }
            (Some(_), None) => debug!("{} missing from new snapshot", setting),
            (None, Some(_)) => debug!("{} appeared in new snapshot", setting),
            _ => {}
        }
    }
    events
}

pub struct SnapshotDiffer {
    settings: Vec<SettingRef>,
    poll_interval: Duration,
    previous: Option<Snapshot>,
}

impl SnapshotDiffer {
    pub fn new(settings: Vec<SettingRef>, poll_interval: Duration) -> Self {
        Self {
            settings,
            poll_interval,
            previous: None,
        }
    }

    /// Capture the baseline snapshot
    pub fn prime<B: SettingReader + ?Sized>(&mut self, backend: &B) {
        let baseline = take_snapshot(&self.settings, backend);
        debug!("Snapshot baseline holds {} settings", baseline.len());
        self.previous = Some(baseline);
    }

    /// One tick: diff against the previous snapshot, then replace it
    pub fn poll<B: SettingReader + ?Sized>(&mut self, backend: &B) -> Vec<Event> {
        let current = take_snapshot(&self.settings, backend);
        let events = match &self.previous {
            Some(previous) => diff_snapshots(&self.settings, previous, &current),
            None => Vec::new(),
        };
        self.previous = Some(current);
        events
    }

    pub async fn run(self, backend: Arc<dyn SettingBackend>, bus: EventBus, cancel: CancellationToken) {
        info!(
            "Snapshot differ watching {} settings every {:?}",
            self.settings.len(),
            self.poll_interval
        );
        let period = self.poll_interval;

        let baseline = backend.clone();
        let mut differ = match blocking_pass(self, move |d: &mut SnapshotDiffer| d.prime(baseline.as_ref())).await {
            Ok((differ, ())) => differ,
            Err(e) => {
                error!("Snapshot baseline task failed: {}", e);
                return;
            }
        };

        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let backend = backend.clone();
                    match blocking_pass(differ, move |d: &mut SnapshotDiffer| d.poll(backend.as_ref())).await {
                        Ok((returned, events)) => {
                            differ = returned;
                            for event in events {
                                bus.publish(event);
                            }
                        }
                        Err(e) => {
                            error!("Snapshot poll task failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        info!("Snapshot differ stopped");
    }
}
