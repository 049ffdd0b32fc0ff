//! Configuration resolution for lightsout.
//!
//! Implements hierarchical config resolution:
//! 1. Built-in defaults
//! 2. Settings file (~/.config/lightsout/settings.json, or an explicit path)
//! 3. Environment variables
//! 4. CLI arguments (applied by the daemon binary, highest priority)

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Directory name used under the platform config dir.
pub const APP_DIR: &str = "lightsout";

/// File name of the default drop-file.
pub const TOKEN_FILE_NAME: &str = ".customtoken";

/// Default identity toolkit endpoint (custom-token sign-in and account lookup).
pub const DEFAULT_IDENTITY_URL: &str = "https://identitytoolkit.googleapis.com/v1";

/// Default secure token endpoint (refresh-token grant).
pub const DEFAULT_TOKEN_URL: &str = "https://securetoken.googleapis.com/v1";

/// Complete lightsout configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub remote: RemoteConfig,
    #[serde(default)]
    pub device: DeviceConfig,
    #[serde(default)]
    pub credentials: CredentialsConfig,
    #[serde(default)]
    pub timing: TimingConfig,
    /// Command executed to power the machine off. `None` means the platform default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shutdown_command: Option<String>,
}

/// Identity provider and data store endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub api_key: String,
    pub database_url: String,
    pub identity_url: String,
    pub token_url: String,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            database_url: String::new(),
            identity_url: DEFAULT_IDENTITY_URL.to_string(),
            token_url: DEFAULT_TOKEN_URL.to_string(),
        }
    }
}

/// Identity of this machine in the remote store.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Key of the device record. Defaults to the hostname.
    pub id: String,
    /// Human-readable name written into the device record.
    pub name: String,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let host = local_hostname();
        Self {
            id: host.clone(),
            name: host,
        }
    }
}

/// Where the one-time raw token comes from when no stored credential is usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum IntakeMode {
    /// Read a drop-file once and delete it.
    #[default]
    DropFile,
    /// Ask the operator on the terminal.
    Interactive,
}

impl FromStr for IntakeMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "drop-file" => Ok(Self::DropFile),
            "interactive" => Ok(Self::Interactive),
            other => Err(Error::Config(format!(
                "Unknown intake mode '{other}' (expected drop-file or interactive)"
            ))),
        }
    }
}

/// Credential persistence and intake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CredentialsConfig {
    /// Persisted credential record. `None` resolves to `~/.config/lightsout/token.json`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<PathBuf>,
    pub intake: IntakeMode,
    /// Drop-file consumed by [`IntakeMode::DropFile`]. `None` resolves to
    /// `.customtoken` next to the credential record.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_file: Option<PathBuf>,
}

impl CredentialsConfig {
    /// Resolved location of the credential record.
    pub fn resolved_path(&self) -> Result<PathBuf> {
        match &self.path {
            Some(p) => Ok(p.clone()),
            None => default_credentials_path()
                .ok_or_else(|| Error::Config("Cannot determine config directory".into())),
        }
    }

    /// Resolved location of the drop-file.
    pub fn resolved_token_file(&self) -> Result<PathBuf> {
        match &self.token_file {
            Some(p) => Ok(p.clone()),
            None => Ok(self.resolved_path()?.with_file_name(TOKEN_FILE_NAME)),
        }
    }
}

/// Periods, delays and retry budgets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    pub heartbeat_interval_secs: u64,
    pub refresh_check_interval_secs: u64,
    pub restart_delay_secs: u64,
    pub subscription_retry_delay_secs: u64,
    pub shutdown_grace_secs: u64,
    pub min_uptime_secs: u64,
    pub retry_base_delay_secs: u64,
    pub max_attempts: u32,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 180,
            refresh_check_interval_secs: 60,
            restart_delay_secs: 300,
            subscription_retry_delay_secs: 300,
            shutdown_grace_secs: 5,
            min_uptime_secs: 60,
            retry_base_delay_secs: 5,
            max_attempts: 3,
        }
    }
}

impl TimingConfig {
    pub const fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub const fn refresh_check_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_check_interval_secs)
    }

    pub const fn restart_delay(&self) -> Duration {
        Duration::from_secs(self.restart_delay_secs)
    }

    pub const fn subscription_retry_delay(&self) -> Duration {
        Duration::from_secs(self.subscription_retry_delay_secs)
    }

    pub const fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub const fn min_uptime(&self) -> Duration {
        Duration::from_secs(self.min_uptime_secs)
    }

    pub const fn retry_base_delay(&self) -> Duration {
        Duration::from_secs(self.retry_base_delay_secs)
    }
}

impl Config {
    /// Shutdown command to run, falling back to the platform default.
    pub fn resolved_shutdown_command(&self) -> String {
        self.shutdown_command
            .clone()
            .unwrap_or_else(|| default_shutdown_command().to_string())
    }

    /// Reject configurations the daemon cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.remote.api_key.trim().is_empty() {
            return Err(Error::Config("API key is not set".into()));
        }
        let url = self.remote.database_url.trim();
        if url.is_empty() {
            return Err(Error::Config("Database URL is not set".into()));
        }
        if !url.starts_with("https://") && !url.starts_with("http://") {
            return Err(Error::Config(format!(
                "Database URL must be http(s), got '{url}'"
            )));
        }
        if self.device.id.trim().is_empty() {
            return Err(Error::Config("Device id is empty".into()));
        }
        if self.timing.heartbeat_interval_secs == 0 {
            return Err(Error::Config("heartbeat_interval_secs must be at least 1".into()));
        }
        if self.timing.refresh_check_interval_secs == 0 {
            return Err(Error::Config(
                "refresh_check_interval_secs must be at least 1".into(),
            ));
        }
        if self.timing.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

/// Load configuration with hierarchical resolution.
///
/// `settings_path` replaces the global settings file location when given; an
/// explicit path that does not exist is an error, a missing global file is not.
pub fn load_config(settings_path: Option<&Path>) -> Result<Config> {
    let mut config = Config::default();

    match settings_path {
        Some(path) => {
            let file = load_config_file(path)?;
            merge_config(&mut config, file);
        }
        None => {
            if let Some(global_path) = global_config_path() {
                if global_path.exists() {
                    let global = load_config_file(&global_path)?;
                    merge_config(&mut config, global);
                }
            }
        }
    }

    apply_env_overrides(&mut config, |key| std::env::var(key).ok());

    Ok(config)
}

/// Get the global settings file path.
pub fn global_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("settings.json"))
}

/// Get the default credential record path.
pub fn default_credentials_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join(APP_DIR).join("token.json"))
}

/// Platform shutdown command used when none is configured.
pub const fn default_shutdown_command() -> &'static str {
    if cfg!(target_os = "windows") {
        "shutdown /s /f /t 0"
    } else {
        "shutdown now"
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .map(|h| h.to_string_lossy().into_owned())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown-device".to_string())
}

fn load_config_file(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        Error::Config(format!("Failed to read config file {}: {}", path.display(), e))
    })?;
    serde_json::from_str(&content).map_err(|e| {
        Error::Config(format!("Failed to parse config file {}: {}", path.display(), e))
    })
}

fn merge_config(base: &mut Config, overlay: Config) {
    base.remote = overlay.remote;
    base.device = overlay.device;

    if overlay.credentials.path.is_some() {
        base.credentials.path = overlay.credentials.path;
    }
    if overlay.credentials.token_file.is_some() {
        base.credentials.token_file = overlay.credentials.token_file;
    }
    base.credentials.intake = overlay.credentials.intake;

    base.timing = overlay.timing;

    if overlay.shutdown_command.is_some() {
        base.shutdown_command = overlay.shutdown_command;
    }
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_env_overrides(config: &mut Config, lookup: impl Fn(&str) -> Option<String>) {
    let first = |keys: &[&str]| keys.iter().find_map(|k| lookup(k));

    if let Some(val) = first(&["LIGHTSOUT_API_KEY", "FIREBASE_API_KEY"]) {
        config.remote.api_key = val;
    }
    if let Some(val) = first(&["LIGHTSOUT_DATABASE_URL", "FIREBASE_DATABASE_URL"]) {
        config.remote.database_url = val;
    }
    if let Some(val) = lookup("LIGHTSOUT_IDENTITY_URL") {
        config.remote.identity_url = val;
    }
    if let Some(val) = lookup("LIGHTSOUT_TOKEN_URL") {
        config.remote.token_url = val;
    }
    if let Some(val) = lookup("LIGHTSOUT_DEVICE_ID") {
        config.device.id = val;
    }
    if let Some(val) = lookup("LIGHTSOUT_DEVICE_NAME") {
        config.device.name = val;
    }
    if let Some(val) = lookup("LIGHTSOUT_CREDENTIALS_PATH") {
        config.credentials.path = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("LIGHTSOUT_TOKEN_FILE") {
        config.credentials.token_file = Some(PathBuf::from(val));
    }
    if let Some(val) = lookup("LIGHTSOUT_INTAKE") {
        match val.parse() {
            Ok(mode) => config.credentials.intake = mode,
            Err(e) => tracing::warn!(error = %e, "Ignoring LIGHTSOUT_INTAKE"),
        }
    }
    if let Some(val) = first(&["LIGHTSOUT_SHUTDOWN_CMD", "SHUTDOWN_CMD"]) {
        config.shutdown_command = Some(val);
    }
    if let Some(val) = lookup("LIGHTSOUT_HEARTBEAT_SECS") {
        if let Ok(n) = val.parse() {
            config.timing.heartbeat_interval_secs = n;
        }
    }
    if let Some(val) = lookup("LIGHTSOUT_RESTART_DELAY_SECS") {
        if let Ok(n) = val.parse() {
            config.timing.restart_delay_secs = n;
        }
    }
}
