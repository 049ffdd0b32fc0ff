//! Credential persistence, intake and lifecycle.

pub mod intake;
pub mod manager;
pub mod store;

pub use intake::{IntakeError, TokenIntake};
pub use manager::{AuthError, CredentialManager, RefreshOutcome};
pub use store::{CredentialSet, CredentialStore, CredentialStoreError};
