//! Carrying out an accepted shutdown request.

use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tracing::{error, info, warn};

use crate::remote::store::{RemoteStore, write_as};
use crate::remote::types::{DevicePaths, ShutdownRequest, ShutdownStatus};

/// Powers the machine off.
#[async_trait]
pub trait PowerControl: Send + Sync {
    async fn power_off(&self) -> io::Result<()>;
}

/// Runs a shutdown command line through the platform shell.
#[derive(Debug, Clone)]
pub struct SystemPower {
    command: String,
}

impl SystemPower {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl PowerControl for SystemPower {
    async fn power_off(&self) -> io::Result<()> {
        #[cfg(windows)]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("cmd");
            cmd.arg("/C").arg(&self.command);
            cmd
        };
        #[cfg(not(windows))]
        let mut cmd = {
            let mut cmd = tokio::process::Command::new("sh");
            cmd.arg("-c").arg(&self.command);
            cmd
        };

        let status = cmd.status().await?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!(
                "`{}` exited with {status}",
                self.command
            )))
        }
    }
}

/// Ensures the shutdown sequence runs at most once per process, across
/// pipeline restarts. Clones share the latch.
#[derive(Debug, Clone, Default)]
pub struct ShutdownLatch {
    fired: Arc<AtomicBool>,
}

impl ShutdownLatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the latch. Returns `false` if it was already claimed.
    pub fn try_fire(&self) -> bool {
        !self.fired.swap(true, Ordering::SeqCst)
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Re-arm the latch after a shutdown that did not happen.
    pub fn release(&self) {
        self.fired.store(false, Ordering::SeqCst);
    }
}

/// Marks the request done, waits out the grace period, then powers off.
pub struct ShutdownExecutor {
    store: Arc<dyn RemoteStore>,
    paths: DevicePaths,
    power: Arc<dyn PowerControl>,
    grace: Duration,
}

impl ShutdownExecutor {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        paths: DevicePaths,
        power: Arc<dyn PowerControl>,
        grace: Duration,
    ) -> Self {
        Self {
            store,
            paths,
            power,
            grace,
        }
    }

    /// Run the shutdown sequence. A failed status write does not hold up the
    /// shutdown. A failed command is logged and returned so the caller can
    /// accept later requests.
    pub async fn execute(&self) -> io::Result<()> {
        let done = ShutdownRequest::resolved(ShutdownStatus::Done);
        if let Err(e) = write_as(self.store.as_ref(), &self.paths.shutdown_request(), &done).await {
            warn!(
                device_id = %self.paths.device_id,
                operation = "mark shutdown done",
                error = %e,
                "Failed to mark shutdown request done"
            );
        }

        info!(
            device_id = %self.paths.device_id,
            grace_ms = self.grace.as_millis(),
            "Shutting down"
        );
        tokio::time::sleep(self.grace).await;

        self.power.power_off().await.inspect_err(|e| {
            error!(device_id = %self.paths.device_id, error = %e, "Shutdown command failed");
        })
    }
}
