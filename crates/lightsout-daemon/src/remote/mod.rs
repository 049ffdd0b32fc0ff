//! Remote collaborators: the identity provider and the data store.
//!
//! Both are traits so the daemon's state machines can be driven by fakes;
//! the production implementations talk REST through `reqwest`.

pub mod error;
pub mod identity;
pub mod session;
pub mod sse;
pub mod store;
pub mod types;

use std::time::Duration;

pub use error::{IdentityError, StoreError};
pub use identity::{FirebaseIdentity, IdentityProvider, TokenGrant};
pub use session::{Session, SessionSlot};
pub use store::{ChangeStream, RealtimeDatabase, RemoteStore};
pub use types::{
    DevicePaths, DeviceRecord, DeviceSnapshot, DeviceStatus, ShutdownRequest, ShutdownStatus,
    Timestamp,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);

/// Build the shared HTTP client.
///
/// No overall request timeout is set here because subscriptions are
/// long-lived; unary calls set their own.
pub(crate) fn http_client() -> Result<reqwest::Client, reqwest::Error> {
    // reqwest is built with `rustls-no-provider`; `Err` means a provider is
    // already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    reqwest::Client::builder()
        .connect_timeout(CONNECT_TIMEOUT)
        .build()
}
