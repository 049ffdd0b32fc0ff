//! Remote transport error types.

/// Errors from the identity provider.
#[derive(Debug, thiserror::Error)]
pub enum IdentityError {
    /// The provider answered and refused the credential.
    #[error("{operation} rejected ({status}): {message}")]
    Rejected {
        operation: &'static str,
        status: u16,
        message: String,
    },

    /// The provider could not be reached or failed server-side.
    #[error("{operation} failed: {message}")]
    Transport {
        operation: &'static str,
        message: String,
    },

    /// The provider answered with something we could not understand.
    #[error("{operation} returned an invalid response: {message}")]
    Decode {
        operation: &'static str,
        message: String,
    },
}

impl IdentityError {
    /// Whether the provider refused the credential itself, as opposed to a
    /// transient failure.
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Rejected { .. })
    }
}

/// Errors from the remote data store.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Data store error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("Failed to decode {path}: {message}")]
    Decode { path: String, message: String },

    #[error("No authenticated session")]
    Unauthenticated,

    #[error("Subscription stream error: {0}")]
    Stream(String),

    /// The server ended a subscription because its token expired.
    #[error("Subscription credential expired")]
    AuthRevoked,
}
