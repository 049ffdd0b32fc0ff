//! Identity provider client.
//!
//! Four primitives back the credential lifecycle: exchanging a one-time raw
//! (custom) token for a renewable session, refreshing that session, and
//! signing in with either kind of token to learn which account we are.

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::debug;

use super::error::IdentityError;
use super::session::Session;

/// Per-request timeout for identity calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Tokens issued by an exchange or a refresh.
#[derive(Clone, PartialEq, Eq)]
pub struct TokenGrant {
    pub session_token: String,
    pub refresh_token: String,
    /// Lifetime of `session_token`, counted from when the grant was issued.
    pub expires_in: Duration,
}

impl std::fmt::Debug for TokenGrant {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenGrant")
            .field("session_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_in", &self.expires_in)
            .finish()
    }
}

/// The identity provider as seen by the credential manager.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    /// Exchange a raw token for a session token, refresh token and lifetime.
    async fn exchange_custom_token(&self, raw_token: &str) -> Result<TokenGrant, IdentityError>;

    /// Exchange a refresh token for a new grant.
    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IdentityError>;

    /// Sign in with a raw token.
    async fn sign_in_with_raw_token(&self, raw_token: &str) -> Result<Session, IdentityError>;

    /// Sign in with an existing session token.
    async fn sign_in_with_session_token(
        &self,
        session_token: &str,
    ) -> Result<Session, IdentityError>;
}

/// REST client for the identity toolkit and secure token endpoints.
#[derive(Debug, Clone)]
pub struct FirebaseIdentity {
    http: reqwest::Client,
    api_key: String,
    identity_url: String,
    token_url: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomTokenResponse {
    id_token: String,
    refresh_token: String,
    expires_in: Seconds,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    id_token: String,
    refresh_token: String,
    expires_in: Seconds,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(default)]
    users: Vec<LookupUser>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupUser {
    local_id: String,
}

/// Lifetimes arrive as decimal strings, occasionally as numbers.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum Seconds {
    Text(String),
    Number(u64),
}

impl Seconds {
    fn to_duration(&self, operation: &'static str) -> Result<Duration, IdentityError> {
        match self {
            Self::Number(n) => Ok(Duration::from_secs(*n)),
            Self::Text(s) => s.trim().parse().map(Duration::from_secs).map_err(|_| {
                IdentityError::Decode {
                    operation,
                    message: format!("invalid expires_in '{s}'"),
                }
            }),
        }
    }
}

#[derive(Debug, Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Serialize)]
struct RefreshRequest<'a> {
    grant_type: &'static str,
    refresh_token: &'a str,
}

impl FirebaseIdentity {
    /// Create a client for the given endpoints.
    pub fn new(
        api_key: impl Into<String>,
        identity_url: impl Into<String>,
        token_url: impl Into<String>,
    ) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: super::http_client()?,
            api_key: api_key.into(),
            identity_url: identity_url.into().trim_end_matches('/').to_string(),
            token_url: token_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync, R: DeserializeOwned>(
        &self,
        operation: &'static str,
        url: String,
        body: &B,
    ) -> Result<R, IdentityError> {
        let resp = self
            .http
            .post(url)
            .query(&[("key", self.api_key.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| IdentityError::Transport {
                operation,
                message: e.to_string(),
            })?;

        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorEnvelope>(&text)
                .map(|env| env.error.message)
                .unwrap_or_else(|_| {
                    status.canonical_reason().unwrap_or("Unknown").to_string()
                });
            debug!(operation, status = status.as_u16(), %message, "Identity call failed");
            return Err(if is_refusal(status, &message) {
                IdentityError::Rejected {
                    operation,
                    status: status.as_u16(),
                    message,
                }
            } else {
                IdentityError::Transport {
                    operation,
                    message: format!("{}: {message}", status.as_u16()),
                }
            });
        }

        resp.json().await.map_err(|e| IdentityError::Decode {
            operation,
            message: e.to_string(),
        })
    }

    async fn lookup(&self, session_token: &str) -> Result<String, IdentityError> {
        const OP: &str = "account lookup";
        let resp: LookupResponse = self
            .post(
                OP,
                format!("{}/accounts:lookup", self.identity_url),
                &json!({ "idToken": session_token }),
            )
            .await?;
        resp.users
            .into_iter()
            .next()
            .map(|u| u.local_id)
            .ok_or_else(|| IdentityError::Rejected {
                operation: OP,
                status: 400,
                message: "USER_NOT_FOUND".to_string(),
            })
    }
}

#[async_trait]
impl IdentityProvider for FirebaseIdentity {
    async fn exchange_custom_token(&self, raw_token: &str) -> Result<TokenGrant, IdentityError> {
        const OP: &str = "custom token exchange";
        let resp: CustomTokenResponse = self
            .post(
                OP,
                format!("{}/accounts:signInWithCustomToken", self.identity_url),
                &json!({ "token": raw_token, "returnSecureToken": true }),
            )
            .await?;
        Ok(TokenGrant {
            expires_in: resp.expires_in.to_duration(OP)?,
            session_token: resp.id_token,
            refresh_token: resp.refresh_token,
        })
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IdentityError> {
        const OP: &str = "token refresh";
        let resp: RefreshResponse = self
            .post(
                OP,
                format!("{}/token", self.token_url),
                &RefreshRequest {
                    grant_type: "refresh_token",
                    refresh_token,
                },
            )
            .await?;
        Ok(TokenGrant {
            expires_in: resp.expires_in.to_duration(OP)?,
            session_token: resp.id_token,
            refresh_token: resp.refresh_token,
        })
    }

    async fn sign_in_with_raw_token(&self, raw_token: &str) -> Result<Session, IdentityError> {
        let grant = self.exchange_custom_token(raw_token).await?;
        let uid = self.lookup(&grant.session_token).await?;
        Ok(Session {
            uid,
            id_token: grant.session_token,
        })
    }

    async fn sign_in_with_session_token(
        &self,
        session_token: &str,
    ) -> Result<Session, IdentityError> {
        let uid = self.lookup(session_token).await?;
        Ok(Session {
            uid,
            id_token: session_token.to_string(),
        })
    }
}

/// A 4xx that refuses the credential. Timeouts and rate limiting are
/// transient even though they are client errors.
fn is_refusal(status: reqwest::StatusCode, message: &str) -> bool {
    status.is_client_error()
        && status != reqwest::StatusCode::REQUEST_TIMEOUT
        && status != reqwest::StatusCode::TOO_MANY_REQUESTS
        && !message.starts_with("TOO_MANY_ATTEMPTS")
}
