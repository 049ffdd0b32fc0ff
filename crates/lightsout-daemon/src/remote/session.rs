//! The authenticated session shared between the credential manager and the
//! data store client.

use std::sync::{Arc, PoisonError, RwLock};

/// An established session: who we are and the token that proves it.
#[derive(Clone, PartialEq, Eq)]
pub struct Session {
    pub uid: String,
    pub id_token: String,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("uid", &self.uid)
            .field("id_token", &"[REDACTED]")
            .finish()
    }
}

/// Holder for the current session. Cloning shares the slot.
#[derive(Debug, Clone, Default)]
pub struct SessionSlot {
    inner: Arc<RwLock<Option<Session>>>,
}

impl SessionSlot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, session: Session) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = Some(session);
    }

    pub fn clear(&self) {
        *self.inner.write().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub fn current(&self) -> Option<Session> {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn id_token(&self) -> Option<String> {
        self.current().map(|s| s.id_token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_slot() {
        let slot = SessionSlot::new();
        let other = slot.clone();
        assert!(other.current().is_none());

        slot.set(Session {
            uid: "u1".into(),
            id_token: "tok".into(),
        });
        assert_eq!(other.id_token().as_deref(), Some("tok"));

        other.clear();
        assert!(slot.current().is_none());
    }

    #[test]
    fn debug_redacts_token() {
        let session = Session {
            uid: "u1".into(),
            id_token: "secret-token".into(),
        };
        let out = format!("{session:?}");
        assert!(out.contains("u1"));
        assert!(!out.contains("secret-token"));
    }
}
