//! Wire records stored in the remote data store.

use serde::{Deserialize, Serialize};

/// A timestamp as stored remotely: either milliseconds since the epoch or the
/// server-side placeholder that the store resolves on write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Timestamp {
    Millis(i64),
    Server(ServerValue),
}

/// Placeholder resolved by the data store at write time (`{".sv": "timestamp"}`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerValue {
    #[serde(rename = ".sv")]
    pub sv: String,
}

impl Timestamp {
    /// Server-assigned "now".
    pub fn server() -> Self {
        Self::Server(ServerValue {
            sv: "timestamp".to_string(),
        })
    }

    /// The resolved value, if this is not an unresolved placeholder.
    pub const fn as_millis(&self) -> Option<i64> {
        match self {
            Self::Millis(ms) => Some(*ms),
            Self::Server(_) => None,
        }
    }
}

/// Liveness state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    On,
    Off,
}

/// `users/{uid}/devices/{device_id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRecord {
    pub name: String,
    pub status: DeviceStatus,
    pub last_seen: Timestamp,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_online_at: Option<i64>,
}

/// The parts of a device record the daemon reads back. Tolerates partial
/// records written by older clients.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DeviceSnapshot {
    #[serde(default)]
    pub first_online_at: Option<i64>,
}

/// State of a remote shutdown request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ShutdownStatus {
    Pending,
    Done,
    Expired,
    #[serde(other)]
    Unknown,
}

/// `users/{uid}/devices/{device_id}/shutdown_requested`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub status: ShutdownStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<Timestamp>,
}

impl ShutdownRequest {
    /// A daemon-side resolution of a request, stamped by the server.
    pub fn resolved(status: ShutdownStatus) -> Self {
        Self {
            status,
            expires_at: None,
            updated_at: Some(Timestamp::server()),
        }
    }

    /// Whether the request carries an expiry that has passed at `now_ms`.
    pub fn is_expired_at(&self, now_ms: i64) -> bool {
        self.expires_at.is_some_and(|at| now_ms > at)
    }
}

/// Remote paths owned by one device of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DevicePaths {
    pub uid: String,
    pub device_id: String,
}

impl DevicePaths {
    pub fn new(uid: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            device_id: device_id.into(),
        }
    }

    pub fn device(&self) -> String {
        format!("users/{}/devices/{}", self.uid, self.device_id)
    }

    pub fn status(&self) -> String {
        format!("{}/status", self.device())
    }

    pub fn last_seen(&self) -> String {
        format!("{}/last_seen", self.device())
    }

    pub fn shutdown_request(&self) -> String {
        format!("{}/shutdown_requested", self.device())
    }
}
