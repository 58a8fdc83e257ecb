//! Lock policy enforcement.
//!
//! Each tick compares every locked setting with its expected value. A
//! mismatch always yields exactly one lock violation; when the policy asks
//! for restoration the expected value is written back first and `restored`
//! reports whether that write succeeded. The write is not re-verified in the
//! same tick and a failed write is only retried on the next tick.

use crate::backend::{blocking_pass, SettingBackend};
use crate::bus::EventBus;
use drift_common::{Event, LockPolicy};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct PolicyEnforcer {
    policies: Vec<LockPolicy>,
    poll_interval: Duration,
}

impl PolicyEnforcer {
    pub fn new(policies: Vec<LockPolicy>, poll_interval: Duration) -> Self {
        Self {
            policies,
            poll_interval,
        }
    }

    pub fn policies(&self) -> &[LockPolicy] {
        &self.policies
    }

    /// One enforcement pass; returns the violations found
    pub fn check<B: SettingBackend + ?Sized>(&self, backend: &B) -> Vec<Event> {
        let mut events = Vec::new();

        for policy in &self.policies {
            let actual = match backend.read(&policy.setting) {
                Ok(value) => value,
                Err(e) => {
                    warn!("Lock check skipped: {}", e);
                    continue;
                }
            };

            if actual == policy.expected {
                continue;
            }

            let restored = policy.restore_on_drift && restore(backend, policy);
            warn!(
                "Lock violation on {}: expected '{}', found '{}' (restored={})",
                policy.setting, policy.expected, actual, restored
            );
            events.push(Event::lock_violation(
                policy.setting.clone(),
                policy.expected.clone(),
                actual,
                restored,
            ));
        }

        events
    }

    pub async fn run(self, backend: Arc<dyn SettingBackend>, bus: EventBus, cancel: CancellationToken) {
        info!(
            "Policy enforcer holding {} locks, checking every {:?}",
            self.policies.len(),
            self.poll_interval
        );

        let mut ticker = interval(self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut enforcer = self;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let backend = backend.clone();
                    match blocking_pass(enforcer, move |e: &mut PolicyEnforcer| e.check(backend.as_ref())).await {
                        Ok((returned, events)) => {
                            enforcer = returned;
                            for event in events {
                                bus.publish(event);
                            }
                        }
                        Err(e) => {
                            error!("Lock check task failed: {}", e);
                            break;
                        }
                    }
                }
            }
        }
        info!("Policy enforcer stopped");
    }
}

fn restore<B: SettingBackend + ?Sized>(backend: &B, policy: &LockPolicy) -> bool {
    match backend.write(&policy.setting, &policy.expected) {
        Ok(()) => {
            info!("Restored {} to '{}'", policy.setting, policy.expected);
            true
        }
        Err(e) => {
            warn!("Restore failed, will retry next tick: {}", e);
            false
        }
    }
}
