//! Device liveness reporting.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::remote::error::StoreError;
use crate::remote::store::{RemoteStore, read_as, write_as};
use crate::remote::types::{DevicePaths, DeviceRecord, DeviceSnapshot, DeviceStatus, Timestamp};
use crate::retry::RetryPolicy;

/// How one heartbeat ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportOutcome {
    Reported { attempts: u32 },
    Exhausted { attempts: u32 },
}

/// Announces this device as online and, on the way out, as offline.
pub struct PresenceReporter {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    paths: DevicePaths,
    name: String,
    retry: RetryPolicy,
}

impl PresenceReporter {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        paths: DevicePaths,
        name: impl Into<String>,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            clock,
            paths,
            name: name.into(),
            retry,
        }
    }

    pub const fn paths(&self) -> &DevicePaths {
        &self.paths
    }

    /// Write the device record with `status = on`, keeping the first-seen
    /// timestamp. Failures are retried per the policy and never returned.
    pub async fn report_online(&self) -> ReportOutcome {
        let mut backoff = self.retry.backoff();
        loop {
            match self.report_online_once().await {
                Ok(()) => {
                    let attempts = backoff.attempt() + 1;
                    debug!(device_id = %self.paths.device_id, attempts, "Reported online");
                    return ReportOutcome::Reported { attempts };
                }
                Err(e) => match backoff.next_delay() {
                    Some(delay) => {
                        warn!(
                            device_id = %self.paths.device_id,
                            operation = "report online",
                            error = %e,
                            attempt = backoff.attempt(),
                            delay_ms = delay.as_millis(),
                            "Heartbeat failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        warn!(
                            device_id = %self.paths.device_id,
                            operation = "report online",
                            error = %e,
                            attempts = backoff.attempt(),
                            "Heartbeat failed, giving up until next tick"
                        );
                        return ReportOutcome::Exhausted {
                            attempts: backoff.attempt(),
                        };
                    }
                },
            }
        }
    }

    async fn report_online_once(&self) -> Result<(), StoreError> {
        let path = self.paths.device();
        let existing: Option<DeviceSnapshot> = read_as(self.store.as_ref(), &path).await?;
        let first_online_at = existing
            .and_then(|snap| snap.first_online_at)
            .unwrap_or_else(|| self.clock.now_ms());

        let record = DeviceRecord {
            name: self.name.clone(),
            status: DeviceStatus::On,
            last_seen: Timestamp::server(),
            first_online_at: Some(first_online_at),
        };
        write_as(self.store.as_ref(), &path, &record).await
    }

    /// Mark the device offline, leaving the rest of its record in place.
    pub async fn mark_offline(&self) -> Result<(), StoreError> {
        write_as(self.store.as_ref(), &self.paths.status(), &DeviceStatus::Off).await?;
        write_as(self.store.as_ref(), &self.paths.last_seen(), &Timestamp::server()).await?;
        info!(device_id = %self.paths.device_id, "Marked device offline");
        Ok(())
    }

    /// Heartbeat loop. The first report is the caller's job.
    pub async fn run(&self, interval: Duration) {
        let mut timer = tokio::time::interval(interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer.tick().await; // Skip first immediate tick

        loop {
            timer.tick().await;
            self.report_online().await;
        }
    }
}
