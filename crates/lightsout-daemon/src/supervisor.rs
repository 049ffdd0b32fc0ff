//! The outer control loop.
//!
//! One pipeline at a time: authenticate, report online, then run the
//! heartbeat, the refresh check and the shutdown request subscription as
//! tasks in a single [`JoinSet`]. When anything escalates, every task is
//! cancelled and the whole pipeline starts over after the restart delay.
//! Only a termination signal ends the loop.

use std::collections::HashMap;
use std::sync::Arc;

use lightsout_core::config::TimingConfig;
use tokio::sync::watch;
use tokio::task::{self, JoinSet};
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::command::{ChannelSettings, CommandChannel, PowerControl, ShutdownExecutor, ShutdownLatch};
use crate::credentials::{AuthError, CredentialManager, RefreshOutcome};
use crate::presence::PresenceReporter;
use crate::remote::store::RemoteStore;
use crate::remote::types::DevicePaths;
use crate::retry::RetryPolicy;

/// Observable lifecycle of the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Starting,
    Running,
    Restarting,
    Stopped,
}

/// Why a running pipeline was torn down.
#[derive(Debug, thiserror::Error)]
pub enum Escalation {
    #[error("authentication failed: {0}")]
    Auth(#[from] AuthError),

    #[error("{0} task exited unexpectedly")]
    TaskExited(&'static str),

    #[error("{0} task panicked")]
    TaskPanicked(&'static str),
}

/// Device identity and timing for the pipeline.
#[derive(Debug, Clone)]
pub struct SupervisorSettings {
    pub device_id: String,
    pub device_name: String,
    pub timing: TimingConfig,
}

/// Remote and local collaborators.
#[derive(Clone)]
pub struct Services {
    pub credentials: Arc<CredentialManager>,
    pub store: Arc<dyn RemoteStore>,
    pub power: Arc<dyn PowerControl>,
    pub clock: Arc<dyn Clock>,
}

pub struct Supervisor {
    settings: SupervisorSettings,
    services: Services,
    latch: ShutdownLatch,
    tasks: JoinSet<Escalation>,
    task_names: HashMap<task::Id, &'static str>,
    presence: Option<Arc<PresenceReporter>>,
    state: watch::Sender<SupervisorState>,
}

impl Supervisor {
    pub fn new(settings: SupervisorSettings, services: Services) -> Self {
        let (state, _) = watch::channel(SupervisorState::Starting);
        Self {
            settings,
            services,
            latch: ShutdownLatch::new(),
            tasks: JoinSet::new(),
            task_names: HashMap::new(),
            presence: None,
            state,
        }
    }

    /// Follow state transitions.
    pub fn state(&self) -> watch::Receiver<SupervisorState> {
        self.state.subscribe()
    }

    fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            self.settings.timing.retry_base_delay(),
            self.settings.timing.max_attempts,
        )
    }

    fn set_state(&self, state: SupervisorState) {
        debug!(?state, "Supervisor state");
        self.state.send_replace(state);
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped).
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            self.set_state(SupervisorState::Starting);
            let escalation = tokio::select! {
                () = shutdown_requested(&mut shutdown) => break,
                escalation = self.start_and_supervise() => escalation,
            };

            error!(error = %escalation, "Pipeline failed");
            self.cancel_all().await;
            self.set_state(SupervisorState::Restarting);

            let delay = self.settings.timing.restart_delay();
            info!(delay_ms = delay.as_millis(), "Restarting after delay");
            tokio::select! {
                () = tokio::time::sleep(delay) => {}
                () = shutdown_requested(&mut shutdown) => break,
            }
        }

        info!("Termination requested");
        self.cancel_all().await;
        let signed_in = self.services.credentials.session_slot().current().is_some();
        match &self.presence {
            Some(presence) if signed_in => {
                if let Err(e) = presence.mark_offline().await {
                    warn!(error = %e, "Failed to mark device offline");
                }
            }
            _ => debug!("No session, skipping offline report"),
        }
        self.set_state(SupervisorState::Stopped);
        info!("Supervisor stopped");
    }

    /// Start one pipeline and wait for it to escalate.
    async fn start_and_supervise(&mut self) -> Escalation {
        let session = match self.services.credentials.bootstrap().await {
            Ok(session) => session,
            Err(e) => return e.into(),
        };

        let paths = DevicePaths::new(session.uid, self.settings.device_id.clone());
        let presence = Arc::new(PresenceReporter::new(
            self.services.store.clone(),
            self.services.clock.clone(),
            paths.clone(),
            self.settings.device_name.clone(),
            self.retry_policy(),
        ));
        self.presence = Some(presence.clone());
        presence.report_online().await;

        self.spawn_tasks(presence, paths);
        self.set_state(SupervisorState::Running);
        info!(device_id = %self.settings.device_id, "Pipeline running");

        self.next_escalation().await
    }

    fn spawn_tasks(&mut self, presence: Arc<PresenceReporter>, paths: DevicePaths) {
        let timing = self.settings.timing.clone();

        let heartbeat = timing.heartbeat_interval();
        self.spawn("heartbeat", async move {
            presence.run(heartbeat).await;
            Escalation::TaskExited("heartbeat")
        });

        let credentials = self.services.credentials.clone();
        let check_interval = timing.refresh_check_interval();
        self.spawn("refresh check", async move {
            let mut timer = tokio::time::interval(check_interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            timer.tick().await; // Skip first immediate tick

            loop {
                timer.tick().await;
                match credentials.refresh_if_due().await {
                    Ok(RefreshOutcome::Refreshed) => debug!("Refresh check renewed the session"),
                    Ok(RefreshOutcome::NotDue) => {}
                    Err(e) => return Escalation::Auth(e),
                }
            }
        });

        let executor = ShutdownExecutor::new(
            self.services.store.clone(),
            paths.clone(),
            self.services.power.clone(),
            timing.shutdown_grace(),
        );
        let channel = CommandChannel::new(
            self.services.store.clone(),
            self.services.clock.clone(),
            paths,
            executor,
            ChannelSettings {
                min_uptime: timing.min_uptime(),
                resubscribe_delay: timing.subscription_retry_delay(),
                reauth_delay: timing.retry_base_delay(),
                retry: self.retry_policy(),
            },
        )
        .with_latch(self.latch.clone());
        self.spawn("subscription", async move {
            channel.run().await;
            Escalation::TaskExited("subscription")
        });
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = Escalation> + Send + 'static,
    {
        let handle = self.tasks.spawn(task);
        self.task_names.insert(handle.id(), name);
    }

    async fn next_escalation(&mut self) -> Escalation {
        match self.tasks.join_next_with_id().await {
            Some(Ok((_, escalation))) => escalation,
            Some(Err(e)) => {
                let name = self.task_names.get(&e.id()).copied().unwrap_or("unknown");
                if e.is_panic() {
                    Escalation::TaskPanicked(name)
                } else {
                    Escalation::TaskExited(name)
                }
            }
            None => Escalation::TaskExited("pipeline"),
        }
    }

    /// Abort every task and wait for them to finish. Safe to call repeatedly.
    pub async fn cancel_all(&mut self) {
        if !self.tasks.is_empty() {
            debug!(tasks = self.tasks.len(), "Cancelling pipeline tasks");
        }
        self.tasks.shutdown().await;
        self.task_names.clear();
    }
}

/// Resolves once shutdown is requested or the sender is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::credentials::{CredentialStore, TokenIntake};
    use crate::remote::session::SessionSlot;
    use crate::testing::{Fakes, IdentityFailure};

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        _dir: tempfile::TempDir,
        fakes: Fakes,
        token_file: std::path::PathBuf,
        supervisor: Supervisor,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let fakes = Fakes::new("u1", NOW);
        let token_file = dir.path().join(".customtoken");
        let credentials = Arc::new(CredentialManager::new(
            fakes.identity.clone(),
            CredentialStore::new(dir.path().join("token.json")),
            TokenIntake::DropFile(token_file.clone()),
            fakes.clock.clone(),
            SessionSlot::new(),
        ));
        let supervisor = Supervisor::new(
            SupervisorSettings {
                device_id: "desk".into(),
                device_name: "Desk".into(),
                timing: TimingConfig::default(),
            },
            Services {
                credentials,
                store: fakes.store.clone(),
                power: fakes.power.clone(),
                clock: fakes.clock.clone(),
            },
        );
        Harness {
            _dir: dir,
            fakes,
            token_file,
            supervisor,
        }
    }

    #[test]
    fn escalation_messages() {
        assert_eq!(
            Escalation::TaskPanicked("heartbeat").to_string(),
            "heartbeat task panicked"
        );
        assert_eq!(
            Escalation::TaskExited("subscription").to_string(),
            "subscription task exited unexpectedly"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_all_is_idempotent() {
        let mut h = harness();
        h.supervisor.spawn("sleeper", async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Escalation::TaskExited("sleeper")
        });
        h.supervisor.cancel_all().await;
        h.supervisor.cancel_all().await;
        assert!(h.supervisor.tasks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_is_named() {
        let mut h = harness();
        h.supervisor.spawn("boom", async {
            tokio::task::yield_now().await;
            let missing: Option<Escalation> = None;
            missing.unwrap()
        });
        let escalation = h.supervisor.next_escalation().await;
        assert!(matches!(escalation, Escalation::TaskPanicked("boom")));
    }

    #[tokio::test(start_paused = true)]
    async fn runs_pipeline_and_marks_offline_on_termination() {
        let h = harness();
        std::fs::write(&h.token_file, "raw").unwrap();
        let mut state = h.supervisor.state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(h.supervisor.run(stop_rx));

        state
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        let record = h.fakes.store.get("users/u1/devices/desk").unwrap();
        assert_eq!(record["status"], "on");
        assert_eq!(h.fakes.store.active_subscriptions(), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*state.borrow(), SupervisorState::Stopped);
        assert_eq!(
            h.fakes.store.get("users/u1/devices/desk/status"),
            Some(json!("off"))
        );
        assert_eq!(h.fakes.store.active_subscriptions(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_bootstrap_is_retried_after_restart_delay() {
        let h = harness();
        let mut state = h.supervisor.state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(h.supervisor.run(stop_rx));

        state
            .wait_for(|s| *s == SupervisorState::Restarting)
            .await
            .unwrap();
        std::fs::write(&h.token_file, "raw").unwrap();

        tokio::time::sleep(Duration::from_secs(299)).await;
        assert_eq!(*state.borrow(), SupervisorState::Restarting);

        state
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();
        assert_eq!(h.fakes.identity.count("sign_in_raw"), 1);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn termination_before_sign_in_skips_offline_write() {
        let h = harness();
        let mut state = h.supervisor.state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(h.supervisor.run(stop_rx));

        state
            .wait_for(|s| *s == SupervisorState::Restarting)
            .await
            .unwrap();
        stop_tx.send(true).unwrap();
        handle.await.unwrap();

        assert_eq!(*state.borrow(), SupervisorState::Stopped);
        assert!(h.fakes.store.writes().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_failure_restarts_pipeline() {
        let h = harness();
        std::fs::write(&h.token_file, "raw").unwrap();
        let mut state = h.supervisor.state();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(h.supervisor.run(stop_rx));

        state
            .wait_for(|s| *s == SupervisorState::Running)
            .await
            .unwrap();

        // Move inside the refresh margin and make the refresh fail.
        h.fakes.clock.advance(Duration::from_secs(3400));
        h.fakes.identity.fail_refresh(Some(IdentityFailure::Transport));

        state
            .wait_for(|s| *s == SupervisorState::Restarting)
            .await
            .unwrap();
        assert_eq!(h.fakes.identity.count("refresh"), 1);
        assert_eq!(h.fakes.store.active_subscriptions(), 0);

        stop_tx.send(true).unwrap();
        handle.await.unwrap();
    }
}
