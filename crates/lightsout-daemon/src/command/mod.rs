//! Remote shutdown requests.

pub mod channel;
pub mod executor;

pub use channel::{ChannelSettings, CommandChannel, Decision};
pub use executor::{PowerControl, ShutdownExecutor, ShutdownLatch, SystemPower};
