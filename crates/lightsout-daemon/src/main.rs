//! lightsout Daemon
//!
//! Keeps this machine signed in to its cloud account, reports it online, and
//! powers it off when an authorized shutdown request arrives.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;

use lightsout_core::config::{Config, IntakeMode, load_config};
use lightsout_daemon::clock::SystemClock;
use lightsout_daemon::command::SystemPower;
use lightsout_daemon::credentials::{CredentialManager, CredentialStore, TokenIntake};
use lightsout_daemon::remote::{FirebaseIdentity, RealtimeDatabase, SessionSlot};
use lightsout_daemon::supervisor::{Services, Supervisor, SupervisorSettings};

#[derive(Parser, Debug)]
#[command(name = "lightsout-daemon")]
#[command(version, about = "lightsout daemon - remote shutdown for this machine")]
struct Args {
    /// Settings file (defaults to the platform config dir)
    #[arg(long, env = "LIGHTSOUT_CONFIG")]
    config: Option<PathBuf>,

    /// Identity provider API key
    #[arg(long, env = "LIGHTSOUT_API_KEY", hide_env_values = true)]
    api_key: Option<String>,

    /// Data store base URL (e.g. "https://<project>.firebaseio.com")
    #[arg(long, env = "LIGHTSOUT_DATABASE_URL")]
    database_url: Option<String>,

    /// Device id used as the key of the device record (defaults to the hostname)
    #[arg(long, env = "LIGHTSOUT_DEVICE_ID")]
    device_id: Option<String>,

    /// Human-readable device name
    #[arg(long, env = "LIGHTSOUT_DEVICE_NAME")]
    device_name: Option<String>,

    /// Where the credential record is stored
    #[arg(long, env = "LIGHTSOUT_CREDENTIALS_PATH")]
    credentials_path: Option<PathBuf>,

    /// Drop-file holding a one-time custom token
    #[arg(long, env = "LIGHTSOUT_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// How to obtain a custom token when no stored credential is usable.
    #[arg(long, env = "LIGHTSOUT_INTAKE", value_parser = ["drop-file", "interactive"])]
    intake: Option<String>,

    /// Command that powers the machine off
    #[arg(long, env = "LIGHTSOUT_SHUTDOWN_CMD")]
    shutdown_cmd: Option<String>,

    /// Seconds between presence heartbeats
    #[arg(long, env = "LIGHTSOUT_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Log level filter for the daemon (e.g. "info", "debug", "warn").
    #[arg(long, default_value = "info", env = "LIGHTSOUT_LOG_LEVEL")]
    log_level: String,

    /// Output logs as JSON (for structured log aggregation).
    #[arg(long, env = "LIGHTSOUT_LOG_JSON")]
    log_json: bool,
}

impl Args {
    /// CLI flags take precedence over the settings file and environment.
    fn apply(self, config: &mut Config) -> anyhow::Result<()> {
        if let Some(v) = self.api_key {
            config.remote.api_key = v;
        }
        if let Some(v) = self.database_url {
            config.remote.database_url = v;
        }
        if let Some(v) = self.device_id {
            config.device.id = v;
        }
        if let Some(v) = self.device_name {
            config.device.name = v;
        }
        if let Some(v) = self.credentials_path {
            config.credentials.path = Some(v);
        }
        if let Some(v) = self.token_file {
            config.credentials.token_file = Some(v);
        }
        if let Some(v) = self.intake {
            config.credentials.intake = v.parse()?;
        }
        if let Some(v) = self.shutdown_cmd {
            config.shutdown_command = Some(v);
        }
        if let Some(v) = self.heartbeat_secs {
            config.timing.heartbeat_interval_secs = v;
        }
        Ok(())
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let log_filter = lightsout_core::tracing_init::default_filter("lightsout_daemon", &args.log_level);
    lightsout_core::tracing_init::init_tracing(&log_filter, args.log_json);

    let mut config = load_config(args.config.as_deref())?;
    args.apply(&mut config)?;
    config.validate()?;

    let credentials_path = config.credentials.resolved_path()?;
    let shutdown_command = config.resolved_shutdown_command();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        device_id = %config.device.id,
        credentials = %credentials_path.display(),
        heartbeat_secs = config.timing.heartbeat_interval_secs,
        "Starting lightsout-daemon"
    );

    let intake = match config.credentials.intake {
        IntakeMode::DropFile => TokenIntake::DropFile(config.credentials.resolved_token_file()?),
        IntakeMode::Interactive => TokenIntake::Interactive,
    };

    let session = SessionSlot::new();
    let identity = FirebaseIdentity::new(
        config.remote.api_key.clone(),
        config.remote.identity_url.clone(),
        config.remote.token_url.clone(),
    )
    .context("Failed to build identity client")?;
    let store = RealtimeDatabase::new(config.remote.database_url.clone(), session.clone())
        .context("Failed to build data store client")?;
    let clock = Arc::new(SystemClock);

    let credentials = Arc::new(CredentialManager::new(
        Arc::new(identity),
        CredentialStore::new(credentials_path),
        intake,
        clock.clone(),
        session,
    ));

    let supervisor = Supervisor::new(
        SupervisorSettings {
            device_id: config.device.id.clone(),
            device_name: config.device.name.clone(),
            timing: config.timing.clone(),
        },
        Services {
            credentials,
            store: Arc::new(store),
            power: Arc::new(SystemPower::new(shutdown_command)),
            clock,
        },
    );

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let supervisor_handle = tokio::spawn(supervisor.run(shutdown_rx));

    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;

    // Notify systemd that the daemon is ready (unix only). The `true`
    // parameter unsets $NOTIFY_SOCKET so the shutdown command doesn't inherit it.
    #[cfg(unix)]
    sd_notify::notify(true, &[sd_notify::NotifyState::Ready])?;

    #[cfg(unix)]
    let sigterm_future = sigterm.recv();
    #[cfg(not(unix))]
    let sigterm_future = std::future::pending::<Option<()>>();

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C shutdown signal");
        }
        _ = sigterm_future => {
            info!("Received SIGTERM shutdown signal");
        }
    }

    let _ = shutdown_tx.send(true);
    supervisor_handle
        .await
        .context("Supervisor task failed")?;

    info!("Daemon stopped");
    Ok(())
}
