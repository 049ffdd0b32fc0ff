//! In-process fakes for the daemon's collaborators.
//!
//! Available to unit tests and, through the `test-utils` feature, to the
//! integration tests under `tests/`.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::io;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;

use crate::clock::Clock;
use crate::command::executor::PowerControl;
use crate::remote::error::{IdentityError, StoreError};
use crate::remote::identity::{IdentityProvider, TokenGrant};
use crate::remote::session::Session;
use crate::remote::sse::Snapshot;
use crate::remote::store::{ChangeStream, RemoteStore};

/// A clock that only moves when told to.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicI64,
}

impl ManualClock {
    pub fn new(now_ms: i64) -> Self {
        Self {
            now_ms: AtomicI64::new(now_ms),
        }
    }

    pub fn set(&self, now_ms: i64) {
        self.now_ms.store(now_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap();
        self.now_ms.fetch_add(ms, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 {
        self.now_ms.load(Ordering::SeqCst)
    }
}

/// How the fake identity provider should answer the next calls.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdentityFailure {
    /// 4xx: the credential was refused.
    Reject,
    /// Network or 5xx.
    Transport,
}

/// Identity provider that mints numbered tokens and records every call.
#[derive(Debug)]
pub struct FakeIdentity {
    uid: String,
    expires_in: Duration,
    minted: AtomicU32,
    calls: Mutex<Vec<String>>,
    refresh_failure: Mutex<Option<IdentityFailure>>,
    sign_in_failure: Mutex<Option<IdentityFailure>>,
}

impl FakeIdentity {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            expires_in: Duration::from_secs(3600),
            minted: AtomicU32::new(0),
            calls: Mutex::new(Vec::new()),
            refresh_failure: Mutex::new(None),
            sign_in_failure: Mutex::new(None),
        }
    }

    #[must_use]
    pub const fn with_expires_in(mut self, expires_in: Duration) -> Self {
        self.expires_in = expires_in;
        self
    }

    pub const fn expires_in(&self) -> Duration {
        self.expires_in
    }

    /// Make every refresh fail until cleared.
    pub fn fail_refresh(&self, failure: Option<IdentityFailure>) {
        *self.refresh_failure.lock().unwrap() = failure;
    }

    /// Make every sign-in and exchange fail until cleared.
    pub fn fail_sign_in(&self, failure: Option<IdentityFailure>) {
        *self.sign_in_failure.lock().unwrap() = failure;
    }

    /// Calls so far, as `operation:token`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, operation: &str) -> usize {
        let prefix = format!("{operation}:");
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.starts_with(&prefix))
            .count()
    }

    fn record(&self, operation: &str, token: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("{operation}:{token}"));
    }

    fn check(
        failure: &Mutex<Option<IdentityFailure>>,
        operation: &'static str,
    ) -> Result<(), IdentityError> {
        match *failure.lock().unwrap() {
            None => Ok(()),
            Some(IdentityFailure::Reject) => Err(IdentityError::Rejected {
                operation,
                status: 400,
                message: "INVALID_CREDENTIAL".to_string(),
            }),
            Some(IdentityFailure::Transport) => Err(IdentityError::Transport {
                operation,
                message: "connection refused".to_string(),
            }),
        }
    }

    fn mint(&self) -> TokenGrant {
        let n = self.minted.fetch_add(1, Ordering::SeqCst) + 1;
        TokenGrant {
            session_token: format!("session-{n}"),
            refresh_token: format!("refresh-{n}"),
            expires_in: self.expires_in,
        }
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentity {
    async fn exchange_custom_token(&self, raw_token: &str) -> Result<TokenGrant, IdentityError> {
        self.record("exchange", raw_token);
        Self::check(&self.sign_in_failure, "custom token exchange")?;
        Ok(self.mint())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, IdentityError> {
        self.record("refresh", refresh_token);
        Self::check(&self.refresh_failure, "token refresh")?;
        Ok(self.mint())
    }

    async fn sign_in_with_raw_token(&self, raw_token: &str) -> Result<Session, IdentityError> {
        self.record("sign_in_raw", raw_token);
        Self::check(&self.sign_in_failure, "custom token sign-in")?;
        Ok(Session {
            uid: self.uid.clone(),
            id_token: self.mint().session_token,
        })
    }

    async fn sign_in_with_session_token(
        &self,
        session_token: &str,
    ) -> Result<Session, IdentityError> {
        self.record("sign_in_session", session_token);
        Self::check(&self.sign_in_failure, "account lookup")?;
        Ok(Session {
            uid: self.uid.clone(),
            id_token: session_token.to_string(),
        })
    }
}

type Subscriber = (String, mpsc::UnboundedSender<Result<Option<Value>, StoreError>>);

/// A data store held in memory.
///
/// Subscriptions receive the current value on subscribe and again after
/// every write that touches their location. Server timestamp placeholders
/// are stored verbatim.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    tree: Mutex<Snapshot>,
    writes: Mutex<Vec<(String, Value)>>,
    failing_writes: AtomicU32,
    failing_reads: AtomicU32,
    failing_subscribes: AtomicU32,
    subscribes: AtomicU32,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set a value without recording it as a write or notifying anyone.
    pub fn seed(&self, path: &str, value: Value) {
        self.tree.lock().unwrap().put(path, value);
    }

    pub fn get(&self, path: &str) -> Option<Value> {
        self.tree.lock().unwrap().get(path)
    }

    /// Every successful write, in order.
    pub fn writes(&self) -> Vec<(String, Value)> {
        self.writes.lock().unwrap().clone()
    }

    /// Successful writes to exactly `path`.
    pub fn writes_to(&self, path: &str) -> Vec<Value> {
        self.writes
            .lock()
            .unwrap()
            .iter()
            .filter(|(p, _)| p == path)
            .map(|(_, v)| v.clone())
            .collect()
    }

    /// Fail the next `n` writes.
    pub fn fail_next_writes(&self, n: u32) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads.
    pub fn fail_next_reads(&self, n: u32) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` subscribe calls.
    pub fn fail_next_subscribes(&self, n: u32) {
        self.failing_subscribes.store(n, Ordering::SeqCst);
    }

    /// Number of subscribe calls, failed ones included.
    pub fn subscribe_count(&self) -> u32 {
        self.subscribes.load(Ordering::SeqCst)
    }

    /// Subscriptions whose stream is still held by someone.
    pub fn active_subscriptions(&self) -> usize {
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|(_, tx)| !tx.is_closed());
        subs.len()
    }

    /// End every open subscription stream.
    pub fn close_subscriptions(&self) {
        self.subscribers.lock().unwrap().clear();
    }

    /// Push an error into every open subscription stream.
    pub fn break_subscriptions(&self, message: &str) {
        for (_, tx) in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(Err(StoreError::Stream(message.to_string())));
        }
    }

    /// End every open subscription as if its credential had expired.
    pub fn revoke_subscriptions(&self) {
        for (_, tx) in self.subscribers.lock().unwrap().iter() {
            let _ = tx.send(Err(StoreError::AuthRevoked));
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn notify(&self, written: &str) {
        let written = written.trim_matches('/');
        let tree = self.tree.lock().unwrap();
        let mut subs = self.subscribers.lock().unwrap();
        subs.retain(|(path, tx)| {
            let related = written.starts_with(path.as_str()) || path.starts_with(written);
            !related || tx.send(Ok(tree.get(path))).is_ok()
        });
    }
}

#[async_trait]
impl RemoteStore for InMemoryStore {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        if Self::take_failure(&self.failing_reads) {
            return Err(StoreError::Api {
                status: 503,
                message: "injected read failure".to_string(),
            });
        }
        Ok(self.get(path))
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        if Self::take_failure(&self.failing_writes) {
            return Err(StoreError::Api {
                status: 503,
                message: "injected write failure".to_string(),
            });
        }
        self.tree.lock().unwrap().put(path, value.clone());
        self.writes
            .lock()
            .unwrap()
            .push((path.to_string(), value));
        self.notify(path);
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ChangeStream, StoreError> {
        self.subscribes.fetch_add(1, Ordering::SeqCst);
        if Self::take_failure(&self.failing_subscribes) {
            return Err(StoreError::Api {
                status: 503,
                message: "injected subscribe failure".to_string(),
            });
        }

        let path = path.trim_matches('/').to_string();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(self.get(&path)));
        self.subscribers.lock().unwrap().push((path, tx));

        Ok(Box::pin(async_stream::stream! {
            while let Some(item) = rx.recv().await {
                yield item;
            }
        }))
    }
}

/// Power control that counts invocations instead of powering anything off.
#[derive(Debug, Default)]
pub struct RecordingPower {
    calls: AtomicU32,
    fail: AtomicBool,
    invoked_at: Mutex<Vec<tokio::time::Instant>>,
}

impl RecordingPower {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the command report failure.
    pub fn fail(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    /// When each invocation happened, on tokio's clock.
    pub fn invoked_at(&self) -> Vec<tokio::time::Instant> {
        self.invoked_at.lock().unwrap().clone()
    }
}

#[async_trait]
impl PowerControl for RecordingPower {
    async fn power_off(&self) -> io::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.invoked_at
            .lock()
            .unwrap()
            .push(tokio::time::Instant::now());
        if self.fail.load(Ordering::SeqCst) {
            return Err(io::Error::other("shutdown command exited with status 1"));
        }
        Ok(())
    }
}

/// Shared handles to a full set of fakes.
#[derive(Debug, Clone)]
pub struct Fakes {
    pub identity: Arc<FakeIdentity>,
    pub store: Arc<InMemoryStore>,
    pub clock: Arc<ManualClock>,
    pub power: Arc<RecordingPower>,
}

impl Fakes {
    pub fn new(uid: &str, now_ms: i64) -> Self {
        Self {
            identity: Arc::new(FakeIdentity::new(uid)),
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(ManualClock::new(now_ms)),
            power: Arc::new(RecordingPower::new()),
        }
    }
}
