//! lightsout Daemon Library
//!
//! Runtime components of the lightsout daemon:
//! - Credential lifecycle (intake, persistence, refresh)
//! - Device presence reporting
//! - Remote shutdown request channel and executor
//! - Supervisor that restarts the pipeline on failure
//! - REST clients for the identity provider and the data store

pub mod clock;
pub mod command;
pub mod credentials;
pub mod presence;
pub mod remote;
pub mod retry;
pub mod supervisor;

#[cfg(any(test, feature = "test-utils"))]
pub mod testing;
