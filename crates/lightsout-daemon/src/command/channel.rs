//! The remote shutdown request channel.
//!
//! Watches `shutdown_requested` for this device and decides, per change,
//! whether the request is acted on. Only `pending` requests are considered;
//! the daemon moves them to `expired` or `done` and never looks at a resolved
//! request again.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_stream::StreamExt;
use tracing::{debug, info, warn};

use super::executor::{ShutdownExecutor, ShutdownLatch};
use crate::clock::Clock;
use crate::remote::error::StoreError;
use crate::remote::store::{RemoteStore, decode, read_as, write_as};
use crate::remote::types::{DevicePaths, DeviceSnapshot, ShutdownRequest, ShutdownStatus};
use crate::retry::{RetryPolicy, with_backoff};

/// What was done with one change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// No request, or not pending.
    Ignored,
    /// The request was past its expiry and has been marked expired.
    Expired,
    /// The device came online too recently.
    TooSoonAfterBoot,
    /// The shutdown sequence ran.
    ShutdownTriggered,
    /// A shutdown already ran in this process.
    AlreadyShuttingDown,
}

/// Timing knobs for [`CommandChannel`].
#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub min_uptime: Duration,
    /// Wait after a failed or ended subscription.
    pub resubscribe_delay: Duration,
    /// Wait after the server revoked the subscription's credential.
    pub reauth_delay: Duration,
    pub retry: RetryPolicy,
}

pub struct CommandChannel {
    store: Arc<dyn RemoteStore>,
    clock: Arc<dyn Clock>,
    paths: DevicePaths,
    executor: ShutdownExecutor,
    settings: ChannelSettings,
    latch: ShutdownLatch,
}

impl CommandChannel {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        clock: Arc<dyn Clock>,
        paths: DevicePaths,
        executor: ShutdownExecutor,
        settings: ChannelSettings,
    ) -> Self {
        Self {
            store,
            clock,
            paths,
            executor,
            settings,
            latch: ShutdownLatch::new(),
        }
    }

    /// Share a latch with other channels, so that a restarted pipeline does
    /// not shut down twice.
    #[must_use]
    pub fn with_latch(mut self, latch: ShutdownLatch) -> Self {
        self.latch = latch;
        self
    }

    /// Evaluate the current value of the shutdown request.
    pub async fn handle(&self, value: Option<Value>) -> Result<Decision, StoreError> {
        let path = self.paths.shutdown_request();
        let Some(value) = value else {
            return Ok(Decision::Ignored);
        };
        let request: ShutdownRequest = decode(&path, value)?;
        if request.status != ShutdownStatus::Pending {
            return Ok(Decision::Ignored);
        }

        let now = self.clock.now_ms();
        if request.is_expired_at(now) {
            let expired = ShutdownRequest::resolved(ShutdownStatus::Expired);
            let store = self.store.as_ref();
            with_backoff(&self.settings.retry, "mark shutdown expired", || {
                write_as(store, &path, &expired)
            })
            .await
            .map_err(|e| e.last_error)?;
            info!(
                uid = %self.paths.uid,
                device_id = %self.paths.device_id,
                expires_at = request.expires_at,
                "Shutdown request expired"
            );
            return Ok(Decision::Expired);
        }

        let device: Option<DeviceSnapshot> =
            read_as(self.store.as_ref(), &self.paths.device()).await?;
        if let Some(first_online_at) = device.and_then(|d| d.first_online_at) {
            let min_uptime = i64::try_from(self.settings.min_uptime.as_millis()).unwrap_or(i64::MAX);
            if now.saturating_sub(first_online_at) < min_uptime {
                info!(
                    uid = %self.paths.uid,
                    device_id = %self.paths.device_id,
                    "Device came online recently, skipping shutdown"
                );
                return Ok(Decision::TooSoonAfterBoot);
            }
        }

        if !self.latch.try_fire() {
            debug!(device_id = %self.paths.device_id, "Shutdown already in progress");
            return Ok(Decision::AlreadyShuttingDown);
        }

        info!(
            uid = %self.paths.uid,
            device_id = %self.paths.device_id,
            "Valid shutdown request received"
        );
        if self.executor.execute().await.is_err() {
            self.latch.release();
        }
        Ok(Decision::ShutdownTriggered)
    }

    /// Subscribe and handle notifications forever, re-subscribing after the
    /// configured delay whenever the subscription fails or ends. A revoked
    /// credential re-subscribes sooner, with whatever session is current.
    pub async fn run(&self) {
        let path = self.paths.shutdown_request();
        loop {
            let mut revoked = false;
            match self.store.subscribe(&path).await {
                Ok(mut changes) => {
                    info!(
                        uid = %self.paths.uid,
                        device_id = %self.paths.device_id,
                        "Listening for shutdown requests"
                    );
                    while let Some(change) = changes.next().await {
                        match change {
                            Ok(value) => match self.handle(value).await {
                                Ok(decision) => debug!(?decision, "Handled shutdown request change"),
                                Err(e) => {
                                    warn!(error = %e, "Error processing shutdown request");
                                }
                            },
                            Err(StoreError::AuthRevoked) => {
                                info!("Subscription credential expired");
                                revoked = true;
                                break;
                            }
                            Err(e) => {
                                warn!(error = %e, "Shutdown request subscription failed");
                                break;
                            }
                        }
                    }
                }
                Err(e) => warn!(error = %e, "Failed to subscribe to shutdown requests"),
            }

            let delay = if revoked {
                self.settings.reauth_delay
            } else {
                self.settings.resubscribe_delay
            };
            debug!(
                delay_ms = delay.as_millis(),
                "Re-subscribing to shutdown requests after delay"
            );
            tokio::time::sleep(delay).await;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::testing::{InMemoryStore, ManualClock, RecordingPower};

    const NOW: i64 = 1_700_000_000_000;
    const REQUEST: &str = "users/u1/devices/desk/shutdown_requested";

    struct Harness {
        store: Arc<InMemoryStore>,
        clock: Arc<ManualClock>,
        power: Arc<RecordingPower>,
        channel: Arc<CommandChannel>,
    }

    fn harness() -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let power = Arc::new(RecordingPower::new());
        let paths = DevicePaths::new("u1", "desk");
        let executor = ShutdownExecutor::new(
            store.clone(),
            paths.clone(),
            power.clone(),
            Duration::from_secs(5),
        );
        let channel = Arc::new(CommandChannel::new(
            store.clone(),
            clock.clone(),
            paths,
            executor,
            ChannelSettings {
                min_uptime: Duration::from_secs(60),
                resubscribe_delay: Duration::from_secs(300),
                reauth_delay: Duration::from_secs(5),
                retry: RetryPolicy::default(),
            },
        ));
        Harness {
            store,
            clock,
            power,
            channel,
        }
    }

    fn online_since(h: &Harness, first_online_at: i64) {
        h.store.seed(
            "users/u1/devices/desk",
            json!({"name": "desk", "status": "on", "last_seen": NOW, "first_online_at": first_online_at}),
        );
    }

    #[tokio::test]
    async fn absent_or_resolved_requests_are_ignored() {
        let h = harness();
        assert_eq!(h.channel.handle(None).await.unwrap(), Decision::Ignored);
        for status in ["done", "expired", "cancelled"] {
            let decision = h.channel.handle(Some(json!({"status": status}))).await.unwrap();
            assert_eq!(decision, Decision::Ignored);
        }
        assert!(h.store.writes().is_empty());
        assert_eq!(h.power.calls(), 0);
    }

    #[tokio::test]
    async fn expired_request_is_marked_expired() {
        let h = harness();
        online_since(&h, NOW - 3_600_000);

        let decision = h
            .channel
            .handle(Some(json!({"status": "pending", "expires_at": NOW - 1})))
            .await
            .unwrap();

        assert_eq!(decision, Decision::Expired);
        assert_eq!(
            h.store.writes_to(REQUEST),
            vec![json!({"status": "expired", "updated_at": {".sv": "timestamp"}})]
        );
        assert_eq!(h.power.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_write_is_retried() {
        let h = harness();
        h.store.fail_next_writes(2);

        let decision = h
            .channel
            .handle(Some(json!({"status": "pending", "expires_at": NOW - 1})))
            .await
            .unwrap();
        assert_eq!(decision, Decision::Expired);
        assert_eq!(h.store.writes_to(REQUEST).len(), 1);
    }

    #[tokio::test]
    async fn recent_boot_blocks_shutdown() {
        let h = harness();
        online_since(&h, NOW - 59_999);

        let decision = h
            .channel
            .handle(Some(json!({"status": "pending"})))
            .await
            .unwrap();

        assert_eq!(decision, Decision::TooSoonAfterBoot);
        assert!(h.store.writes().is_empty());
        assert_eq!(h.power.calls(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_request_shuts_down_once() {
        let h = harness();
        online_since(&h, NOW - 60_000);
        let started = tokio::time::Instant::now();

        let decision = h
            .channel
            .handle(Some(json!({"status": "pending", "expires_at": NOW + 60_000})))
            .await
            .unwrap();

        assert_eq!(decision, Decision::ShutdownTriggered);
        assert_eq!(
            h.store.writes_to(REQUEST),
            vec![json!({"status": "done", "updated_at": {".sv": "timestamp"}})]
        );
        assert_eq!(h.power.calls(), 1);
        assert_eq!(h.power.invoked_at()[0] - started, Duration::from_secs(5));

        let again = h
            .channel
            .handle(Some(json!({"status": "pending"})))
            .await
            .unwrap();
        assert_eq!(again, Decision::AlreadyShuttingDown);
        assert_eq!(h.power.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_command_accepts_next_request() {
        let h = harness();
        online_since(&h, NOW - 60_000);
        h.power.fail();

        let first = h
            .channel
            .handle(Some(json!({"status": "pending"})))
            .await
            .unwrap();
        let second = h
            .channel
            .handle(Some(json!({"status": "pending"})))
            .await
            .unwrap();

        assert_eq!(first, Decision::ShutdownTriggered);
        assert_eq!(second, Decision::ShutdownTriggered);
        assert_eq!(h.power.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_first_online_at_does_not_block() {
        let h = harness();
        h.store.seed("users/u1/devices/desk", json!({"status": "on"}));
        h.clock.set(NOW + 1);

        let decision = h
            .channel
            .handle(Some(json!({"status": "pending"})))
            .await
            .unwrap();
        assert_eq!(decision, Decision::ShutdownTriggered);
    }

    #[tokio::test]
    async fn malformed_request_is_an_error() {
        let h = harness();
        let err = h
            .channel
            .handle(Some(json!({"expires_at": "soon"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Decode { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn run_acts_on_pending_and_ignores_done_notification() {
        let h = harness();
        online_since(&h, NOW - 120_000);
        h.store.seed(REQUEST, json!({"status": "pending"}));

        let task = tokio::spawn({
            let channel = h.channel.clone();
            async move { channel.run().await }
        });

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(h.power.calls(), 1);
        assert_eq!(h.store.get(&format!("{REQUEST}/status")), Some(json!("done")));
        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn run_resubscribes_after_failure() {
        let h = harness();
        h.store.fail_next_subscribes(1);

        let task = tokio::spawn({
            let channel = h.channel.clone();
            async move { channel.run().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.subscribe_count(), 1);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.store.subscribe_count(), 2);
        assert_eq!(h.store.active_subscriptions(), 1);

        h.store.break_subscriptions("connection reset");
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.active_subscriptions(), 0);
        tokio::time::sleep(Duration::from_secs(300)).await;
        assert_eq!(h.store.subscribe_count(), 3);

        task.abort();
    }

    #[tokio::test(start_paused = true)]
    async fn revoked_credential_resubscribes_promptly() {
        let h = harness();

        let task = tokio::spawn({
            let channel = h.channel.clone();
            async move { channel.run().await }
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(h.store.subscribe_count(), 1);

        h.store.revoke_subscriptions();
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(h.store.subscribe_count(), 2);
        assert_eq!(h.store.active_subscriptions(), 1);

        task.abort();
    }
}
