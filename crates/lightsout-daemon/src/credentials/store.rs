//! Protected on-disk credential record.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Refresh this long before the session token actually expires.
pub const REFRESH_MARGIN_MS: i64 = 5 * 60 * 1000;

/// The persisted authentication state.
///
/// While `raw_token` is present the session was derived from it; once a
/// refresh has happened it is cleared for good.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialSet {
    #[serde(default, alias = "customToken", skip_serializing_if = "Option::is_none")]
    pub raw_token: Option<String>,
    #[serde(alias = "idToken")]
    pub session_token: String,
    pub refresh_token: String,
    /// Milliseconds since the Unix epoch.
    pub expires_at: i64,
}

impl CredentialSet {
    /// Whether `now_ms` is inside the refresh margin before expiry.
    pub const fn is_due_for_refresh(&self, now_ms: i64) -> bool {
        now_ms > self.expires_at.saturating_sub(REFRESH_MARGIN_MS)
    }
}

impl std::fmt::Debug for CredentialSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialSet")
            .field("raw_token", &self.raw_token.as_ref().map(|_| "[REDACTED]"))
            .field("session_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Errors reading or writing the credential record.
#[derive(Debug, thiserror::Error)]
pub enum CredentialStoreError {
    #[error("Credential file I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Credential file is corrupt: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Credential path {0} has no parent directory")]
    NoParent(PathBuf),
}

/// A single JSON file readable only by its owner.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record. A missing file is `Ok(None)`.
    pub fn load(&self) -> Result<Option<CredentialSet>, CredentialStoreError> {
        let contents = match std::fs::read_to_string(&self.path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&contents)?))
    }

    /// Replace the record, creating the parent directory if needed.
    pub fn save(&self, credentials: &CredentialSet) -> Result<(), CredentialStoreError> {
        let dir = self
            .path
            .parent()
            .ok_or_else(|| CredentialStoreError::NoParent(self.path.clone()))?;
        if !dir.as_os_str().is_empty() && !dir.exists() {
            std::fs::create_dir_all(dir)?;
            #[cfg(unix)]
            {
                use std::os::unix::fs::PermissionsExt;
                std::fs::set_permissions(dir, std::fs::Permissions::from_mode(0o700))?;
            }
        }

        let json = serde_json::to_string_pretty(credentials)?;
        std::fs::write(&self.path, json)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        Ok(())
    }

    /// Delete the record. Deleting a missing record is not an error.
    pub fn clear(&self) -> Result<(), CredentialStoreError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn sample() -> CredentialSet {
        CredentialSet {
            raw_token: Some("raw".into()),
            session_token: "sess".into(),
            refresh_token: "refresh".into(),
            expires_at: 1_000_000,
        }
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("nested/token.json"));
        store.save(&sample()).unwrap();
        assert_eq!(store.load().unwrap(), Some(sample()));
    }

    #[test]
    fn missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.json"));
        assert!(store.load().unwrap().is_none());
        store.clear().unwrap();
    }

    #[test]
    fn corrupt_file_is_json_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(&path, "{ not json").unwrap();
        let err = CredentialStore::new(&path).load().unwrap_err();
        assert!(matches!(err, CredentialStoreError::Json(_)));
    }

    #[test]
    fn accepts_legacy_key_names() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("token.json");
        std::fs::write(
            &path,
            r#"{"customToken":"raw","idToken":"sess","refreshToken":"r","expiresAt":5}"#,
        )
        .unwrap();
        let creds = CredentialStore::new(&path).load().unwrap().unwrap();
        assert_eq!(creds.raw_token.as_deref(), Some("raw"));
        assert_eq!(creds.session_token, "sess");
        assert_eq!(creds.expires_at, 5);
    }

    #[test]
    fn refreshed_set_omits_raw_token() {
        let creds = CredentialSet {
            raw_token: None,
            ..sample()
        };
        let json = serde_json::to_value(&creds).unwrap();
        assert!(json.get("rawToken").is_none());
        assert_eq!(json["sessionToken"], "sess");
        assert_eq!(json["expiresAt"], 1_000_000);
    }

    #[test]
    fn clear_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("token.json"));
        store.save(&sample()).unwrap();
        store.clear().unwrap();
        assert!(!store.path().exists());
    }

    #[cfg(unix)]
    #[test]
    fn file_permissions_are_owner_only() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let store = CredentialStore::new(dir.path().join("cfg/token.json"));
        store.save(&sample()).unwrap();

        let file_mode = std::fs::metadata(store.path()).unwrap().permissions().mode();
        assert_eq!(file_mode & 0o777, 0o600);
        let dir_mode = std::fs::metadata(dir.path().join("cfg"))
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(dir_mode & 0o777, 0o700);
    }

    #[test]
    fn refresh_margin_is_five_minutes() {
        let creds = sample();
        assert!(!creds.is_due_for_refresh(creds.expires_at - REFRESH_MARGIN_MS));
        assert!(creds.is_due_for_refresh(creds.expires_at - REFRESH_MARGIN_MS + 1));
        assert!(creds.is_due_for_refresh(creds.expires_at + 1));
    }

    #[test]
    fn debug_redacts_tokens() {
        let creds = CredentialSet {
            raw_token: Some("secret-raw".into()),
            session_token: "secret-session".into(),
            refresh_token: "secret-refresh".into(),
            expires_at: 1_000_000,
        };
        let out = format!("{creds:?}");
        assert!(!out.contains("secret-"));
        assert!(out.contains("1000000"));
    }
}
