//! Credential lifecycle: sign in once, persist, refresh ahead of expiry, and
//! fall back to a fresh raw token when the stored record cannot be used.

use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::intake::{IntakeError, TokenIntake};
use super::store::{CredentialSet, CredentialStore, CredentialStoreError};
use crate::clock::Clock;
use crate::remote::error::IdentityError;
use crate::remote::identity::{IdentityProvider, TokenGrant};
use crate::remote::session::{Session, SessionSlot};

/// Authentication failures. Any of these that reaches the supervisor
/// restarts the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("Token intake failed: {0}")]
    Intake(#[from] IntakeError),

    #[error(transparent)]
    Storage(#[from] CredentialStoreError),

    #[error("No credentials loaded")]
    NoSession,
}

impl AuthError {
    /// Whether the identity provider refused the credential outright.
    pub const fn is_rejection(&self) -> bool {
        matches!(self, Self::Identity(e) if e.is_rejection())
    }
}

/// Which step of resuming a stored credential failed.
#[derive(Debug, thiserror::Error)]
enum ResumeError {
    #[error("refresh failed: {0}")]
    Refresh(AuthError),

    #[error("sign-in failed: {0}")]
    SignIn(AuthError),
}

impl ResumeError {
    /// Only a refused refresh token condemns the stored record.
    const fn condemns_record(&self) -> bool {
        match self {
            Self::Refresh(e) => e.is_rejection(),
            Self::SignIn(_) => false,
        }
    }
}

/// Result of a periodic refresh check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshOutcome {
    NotDue,
    Refreshed,
}

/// Owns the credential set and keeps the shared [`SessionSlot`] current.
pub struct CredentialManager {
    identity: Arc<dyn IdentityProvider>,
    store: CredentialStore,
    intake: TokenIntake,
    clock: Arc<dyn Clock>,
    session: SessionSlot,
    credentials: Mutex<Option<CredentialSet>>,
}

impl CredentialManager {
    pub fn new(
        identity: Arc<dyn IdentityProvider>,
        store: CredentialStore,
        intake: TokenIntake,
        clock: Arc<dyn Clock>,
        session: SessionSlot,
    ) -> Self {
        Self {
            identity,
            store,
            intake,
            clock,
            session,
            credentials: Mutex::new(None),
        }
    }

    /// The slot the data store authorizes from.
    pub const fn session_slot(&self) -> &SessionSlot {
        &self.session
    }

    /// Establish an authenticated session, from the stored record when
    /// possible and from a fresh raw token otherwise.
    pub async fn bootstrap(&self) -> Result<Session, AuthError> {
        let mut guard = self.credentials.lock().await;
        *guard = None;
        self.session.clear();

        let mut unusable = false;
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(e) => {
                warn!(path = %self.store.path().display(), error = %e, "Stored credential is unreadable");
                unusable = true;
                None
            }
        };

        if let Some(creds) = stored {
            match self.resume(creds).await {
                Ok((creds, session)) => {
                    *guard = Some(creds);
                    return Ok(self.publish(session));
                }
                Err(e) => {
                    warn!(error = %e, "Stored credential could not be used");
                    unusable |= e.condemns_record();
                }
            }
        }

        match self.sign_in_fresh().await {
            Ok((creds, session)) => {
                *guard = Some(creds);
                Ok(self.publish(session))
            }
            Err(e) => {
                if unusable {
                    match self.store.clear() {
                        Ok(()) => warn!("Removed unusable credential record"),
                        Err(clear_err) => {
                            warn!(error = %clear_err, "Failed to remove unusable credential record");
                        }
                    }
                }
                Err(e)
            }
        }
    }

    /// Refresh the session if it is inside the expiry margin.
    ///
    /// Errors are returned as-is; the caller decides whether to restart.
    pub async fn refresh_if_due(&self) -> Result<RefreshOutcome, AuthError> {
        let mut guard = self.credentials.lock().await;
        let creds = guard.as_ref().ok_or(AuthError::NoSession)?;
        if !creds.is_due_for_refresh(self.clock.now_ms()) {
            return Ok(RefreshOutcome::NotDue);
        }

        let refreshed = self.refresh(creds).await?;
        let session_token = refreshed.session_token.clone();
        *guard = Some(refreshed);

        let session = self
            .identity
            .sign_in_with_session_token(&session_token)
            .await?;
        self.publish(session);
        info!("Session refreshed");
        Ok(RefreshOutcome::Refreshed)
    }

    /// Steps 2 and 3 of bootstrap: refresh if due, then sign in.
    async fn resume(&self, creds: CredentialSet) -> Result<(CredentialSet, Session), ResumeError> {
        let creds = if creds.is_due_for_refresh(self.clock.now_ms()) {
            debug!("Stored session is near expiry, refreshing");
            self.refresh(&creds).await.map_err(ResumeError::Refresh)?
        } else {
            creds
        };

        let session = match &creds.raw_token {
            Some(raw) => self.identity.sign_in_with_raw_token(raw).await,
            None => {
                self.identity
                    .sign_in_with_session_token(&creds.session_token)
                    .await
            }
        }
        .map_err(|e| ResumeError::SignIn(e.into()))?;
        Ok((creds, session))
    }

    /// Exchange the refresh token and persist the result.
    async fn refresh(&self, creds: &CredentialSet) -> Result<CredentialSet, AuthError> {
        let grant = self.identity.refresh(&creds.refresh_token).await?;
        let refreshed = self.credential_set(None, grant);
        self.store.save(&refreshed)?;
        Ok(refreshed)
    }

    async fn sign_in_fresh(&self) -> Result<(CredentialSet, Session), AuthError> {
        info!("Obtaining a new custom token");
        let raw = self.intake.obtain().await?;
        let session = self.identity.sign_in_with_raw_token(&raw).await?;
        let grant = self.identity.exchange_custom_token(&raw).await?;
        let creds = self.credential_set(Some(raw), grant);
        self.store.save(&creds)?;
        Ok((creds, session))
    }

    fn credential_set(&self, raw_token: Option<String>, grant: TokenGrant) -> CredentialSet {
        let lifetime = i64::try_from(grant.expires_in.as_millis()).unwrap_or(i64::MAX);
        CredentialSet {
            raw_token,
            session_token: grant.session_token,
            refresh_token: grant.refresh_token,
            expires_at: self.clock.now_ms().saturating_add(lifetime),
        }
    }

    fn publish(&self, session: Session) -> Session {
        info!(uid = %session.uid, "Signed in");
        self.session.set(session.clone());
        session
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::path::Path;
    use std::time::Duration;

    use super::*;
    use crate::credentials::store::REFRESH_MARGIN_MS;
    use crate::testing::{FakeIdentity, IdentityFailure, ManualClock};

    const NOW: i64 = 1_700_000_000_000;

    struct Harness {
        _dir: tempfile::TempDir,
        identity: Arc<FakeIdentity>,
        clock: Arc<ManualClock>,
        store: CredentialStore,
        token_file: std::path::PathBuf,
        manager: CredentialManager,
    }

    fn harness() -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let identity = Arc::new(FakeIdentity::new("uid-1"));
        let clock = Arc::new(ManualClock::new(NOW));
        let store = CredentialStore::new(dir.path().join("token.json"));
        let token_file = dir.path().join(".customtoken");
        let manager = CredentialManager::new(
            identity.clone(),
            store.clone(),
            TokenIntake::DropFile(token_file.clone()),
            clock.clone(),
            SessionSlot::new(),
        );
        Harness {
            _dir: dir,
            identity,
            clock,
            store,
            token_file,
            manager,
        }
    }

    fn drop_token(path: &Path, token: &str) {
        std::fs::write(path, token).unwrap();
    }

    fn stored(raw: Option<&str>, expires_at: i64) -> CredentialSet {
        CredentialSet {
            raw_token: raw.map(ToString::to_string),
            session_token: "stored-session".into(),
            refresh_token: "stored-refresh".into(),
            expires_at,
        }
    }

    #[tokio::test]
    async fn first_run_uses_intake_and_persists() {
        let h = harness();
        drop_token(&h.token_file, "raw-1\n");

        let session = h.manager.bootstrap().await.unwrap();
        assert_eq!(session.uid, "uid-1");
        assert_eq!(h.manager.session_slot().current(), Some(session));
        assert!(!h.token_file.exists());

        let creds = h.store.load().unwrap().unwrap();
        assert_eq!(creds.raw_token.as_deref(), Some("raw-1"));
        assert_eq!(creds.expires_at, NOW + 3_600_000);
        assert_eq!(h.identity.count("exchange"), 1);
    }

    #[tokio::test]
    async fn first_run_without_intake_fails() {
        let h = harness();
        let err = h.manager.bootstrap().await.unwrap_err();
        assert!(matches!(err, AuthError::Intake(IntakeError::Missing(_))));
        assert!(h.manager.session_slot().current().is_none());
    }

    #[tokio::test]
    async fn valid_stored_session_signs_in_without_refresh() {
        let h = harness();
        h.store.save(&stored(None, NOW + 3_600_000)).unwrap();

        h.manager.bootstrap().await.unwrap();
        assert_eq!(h.identity.calls(), vec!["sign_in_session:stored-session"]);
    }

    #[tokio::test]
    async fn stored_raw_token_is_used_for_sign_in() {
        let h = harness();
        h.store.save(&stored(Some("raw-0"), NOW + 3_600_000)).unwrap();

        h.manager.bootstrap().await.unwrap();
        assert_eq!(h.identity.calls(), vec!["sign_in_raw:raw-0"]);
    }

    #[tokio::test]
    async fn expiring_stored_session_is_refreshed_first() {
        let h = harness();
        h.store
            .save(&stored(Some("raw-0"), NOW + REFRESH_MARGIN_MS - 1))
            .unwrap();

        h.manager.bootstrap().await.unwrap();

        let creds = h.store.load().unwrap().unwrap();
        assert!(creds.raw_token.is_none());
        assert_eq!(creds.expires_at, NOW + 3_600_000);
        assert_eq!(
            h.identity.calls(),
            vec!["refresh:stored-refresh", "sign_in_session:session-1"]
        );
    }

    #[tokio::test]
    async fn transient_refresh_failure_keeps_record() {
        let h = harness();
        let original = stored(None, NOW - 1);
        h.store.save(&original).unwrap();
        h.identity.fail_refresh(Some(IdentityFailure::Transport));

        assert!(h.manager.bootstrap().await.is_err());
        assert_eq!(h.store.load().unwrap(), Some(original));
    }

    #[tokio::test]
    async fn rejected_refresh_without_intake_deletes_record() {
        let h = harness();
        h.store.save(&stored(None, NOW - 1)).unwrap();
        h.identity.fail_refresh(Some(IdentityFailure::Reject));

        let err = h.manager.bootstrap().await.unwrap_err();
        assert!(matches!(err, AuthError::Intake(_)));
        assert!(h.store.load().unwrap().is_none());
    }

    #[tokio::test]
    async fn rejected_sign_in_without_intake_keeps_record() {
        let h = harness();
        let valid = stored(None, NOW + 3_600_000);
        h.store.save(&valid).unwrap();
        h.identity.fail_sign_in(Some(IdentityFailure::Reject));

        let err = h.manager.bootstrap().await.unwrap_err();
        assert!(matches!(err, AuthError::Intake(_)));
        assert_eq!(h.identity.calls(), vec!["sign_in_session:stored-session"]);
        assert_eq!(h.store.load().unwrap(), Some(valid));
    }

    #[tokio::test]
    async fn rejected_refresh_falls_back_to_intake() {
        let h = harness();
        h.store.save(&stored(None, NOW - 1)).unwrap();
        h.identity.fail_refresh(Some(IdentityFailure::Reject));
        drop_token(&h.token_file, "raw-2");

        h.manager.bootstrap().await.unwrap();
        let creds = h.store.load().unwrap().unwrap();
        assert_eq!(creds.raw_token.as_deref(), Some("raw-2"));
    }

    #[tokio::test]
    async fn corrupt_record_is_replaced_by_intake() {
        let h = harness();
        std::fs::write(h.store.path(), "garbage").unwrap();
        drop_token(&h.token_file, "raw-3");

        h.manager.bootstrap().await.unwrap();
        let creds = h.store.load().unwrap().unwrap();
        assert_eq!(creds.raw_token.as_deref(), Some("raw-3"));
    }

    #[tokio::test]
    async fn corrupt_record_without_intake_is_deleted() {
        let h = harness();
        std::fs::write(h.store.path(), "garbage").unwrap();

        assert!(h.manager.bootstrap().await.is_err());
        assert!(!h.store.path().exists());
    }

    #[tokio::test]
    async fn refresh_if_due_requires_bootstrap() {
        let h = harness();
        let err = h.manager.refresh_if_due().await.unwrap_err();
        assert!(matches!(err, AuthError::NoSession));
    }

    #[tokio::test]
    async fn refresh_if_due_waits_for_margin() {
        let h = harness();
        drop_token(&h.token_file, "raw-1");
        h.manager.bootstrap().await.unwrap();

        assert_eq!(
            h.manager.refresh_if_due().await.unwrap(),
            RefreshOutcome::NotDue
        );
        assert_eq!(h.identity.count("refresh"), 0);

        // 3600 s lifetime; the margin opens after 3300 s.
        h.clock.advance(Duration::from_secs(3301));
        assert_eq!(
            h.manager.refresh_if_due().await.unwrap(),
            RefreshOutcome::Refreshed
        );

        let creds = h.store.load().unwrap().unwrap();
        assert!(creds.raw_token.is_none());
        assert_eq!(creds.expires_at, h.clock.now_ms() + 3_600_000);
        let session = h.manager.session_slot().current().unwrap();
        assert_eq!(session.id_token, creds.session_token);
    }

    #[tokio::test]
    async fn refresh_failure_is_reported_without_retry() {
        let h = harness();
        drop_token(&h.token_file, "raw-1");
        h.manager.bootstrap().await.unwrap();
        h.clock.advance(Duration::from_secs(3600));
        h.identity.fail_refresh(Some(IdentityFailure::Transport));

        assert!(h.manager.refresh_if_due().await.is_err());
        assert_eq!(h.identity.count("refresh"), 1);
    }
}
