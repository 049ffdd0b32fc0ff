//! Remote data store client.
//!
//! Path-addressed JSON reads and writes, plus a subscription that yields the
//! full current value of a location every time it changes.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_stream::{Stream, StreamExt};
use tracing::{debug, warn};

use super::error::StoreError;
use super::session::SessionSlot;
use super::sse::{LineBuffer, Snapshot, SseParser, StreamEvent, parse_event};

/// Per-request timeout for unary store calls.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// The server sends a keep-alive about every 30 s; a subscription silent for
/// longer than this is treated as dead.
const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Change notifications for one location. Each item is the location's full
/// value after the change (`None` when it does not exist). Dropping the
/// stream cancels the subscription.
pub type ChangeStream = Pin<Box<dyn Stream<Item = Result<Option<Value>, StoreError>> + Send>>;

/// The data store as seen by the presence reporter and the command channel.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Read the value at `path`; `None` when nothing is stored there.
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError>;

    /// Overwrite the value at `path`.
    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError>;

    /// Subscribe to changes at `path`.
    async fn subscribe(&self, path: &str) -> Result<ChangeStream, StoreError>;
}

/// Read and decode the value at `path`.
pub async fn read_as<T: DeserializeOwned>(
    store: &dyn RemoteStore,
    path: &str,
) -> Result<Option<T>, StoreError> {
    store
        .read(path)
        .await?
        .map(|value| decode(path, value))
        .transpose()
}

/// Encode and write `value` at `path`.
pub async fn write_as<T: Serialize + Sync>(
    store: &dyn RemoteStore,
    path: &str,
    value: &T,
) -> Result<(), StoreError> {
    let json = serde_json::to_value(value).map_err(|e| StoreError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })?;
    store.write(path, json).await
}

/// Decode a value read from `path`.
pub fn decode<T: DeserializeOwned>(path: &str, value: Value) -> Result<T, StoreError> {
    serde_json::from_value(value).map_err(|e| StoreError::Decode {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// REST client for a realtime database.
#[derive(Debug, Clone)]
pub struct RealtimeDatabase {
    http: reqwest::Client,
    base_url: String,
    session: SessionSlot,
    idle_timeout: Duration,
}

impl RealtimeDatabase {
    /// Create a client for `base_url` that authorizes with the current session.
    pub fn new(base_url: impl Into<String>, session: SessionSlot) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: super::http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            session,
            idle_timeout: IDLE_TIMEOUT,
        })
    }

    /// Override how long a subscription may stay silent.
    #[must_use]
    pub const fn with_idle_timeout(mut self, idle_timeout: Duration) -> Self {
        self.idle_timeout = idle_timeout;
        self
    }

    /// Build the REST URL for a path.
    pub(crate) fn url(&self, path: &str) -> String {
        format!("{}/{}.json", self.base_url, path.trim_matches('/'))
    }

    fn token(&self) -> Result<String, StoreError> {
        self.session.id_token().ok_or(StoreError::Unauthenticated)
    }

    async fn check_status(resp: reqwest::Response) -> Result<reqwest::Response, StoreError> {
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        let message = serde_json::from_str::<Value>(&body)
            .ok()
            .and_then(|v| v.get("error").and_then(Value::as_str).map(ToString::to_string))
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("Unknown").to_string());
        Err(StoreError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl RemoteStore for RealtimeDatabase {
    async fn read(&self, path: &str) -> Result<Option<Value>, StoreError> {
        let token = self.token()?;
        let resp = self
            .http
            .get(self.url(path))
            .query(&[("auth", token.as_str())])
            .timeout(REQUEST_TIMEOUT)
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        let value: Value = resp.json().await?;
        Ok(if value.is_null() { None } else { Some(value) })
    }

    async fn write(&self, path: &str, value: Value) -> Result<(), StoreError> {
        let token = self.token()?;
        let resp = self
            .http
            .put(self.url(path))
            .query(&[("auth", token.as_str()), ("print", "silent")])
            .timeout(REQUEST_TIMEOUT)
            .json(&value)
            .send()
            .await?;
        Self::check_status(resp).await?;
        Ok(())
    }

    async fn subscribe(&self, path: &str) -> Result<ChangeStream, StoreError> {
        let token = self.token()?;
        let resp = self
            .http
            .get(self.url(path))
            .query(&[("auth", token.as_str())])
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .send()
            .await?;
        let resp = Self::check_status(resp).await?;
        debug!(path, "Subscription established");

        let location = path.to_string();
        let idle_timeout = self.idle_timeout;
        let mut bytes = Box::pin(resp.bytes_stream().timeout(idle_timeout));

        let stream = async_stream::stream! {
            let mut lines = LineBuffer::new();
            let mut parser = SseParser::new();
            let mut snapshot = Snapshot::new();

            while let Some(chunk) = bytes.next().await {
                let chunk = match chunk {
                    Ok(Ok(chunk)) => chunk,
                    Ok(Err(e)) => {
                        yield Err(StoreError::Stream(e.to_string()));
                        return;
                    }
                    Err(_) => {
                        yield Err(StoreError::Stream(format!("no data for {idle_timeout:?}")));
                        return;
                    }
                };
                for line in lines.push(&chunk) {
                    let Some(frame) = parser.feed_line(&line) else {
                        continue;
                    };
                    match parse_event(&frame) {
                        Ok(StreamEvent::Put { path, data }) => {
                            snapshot.put(&path, data);
                            yield Ok(snapshot.value());
                        }
                        Ok(StreamEvent::Patch { path, data }) => {
                            snapshot.patch(&path, data);
                            yield Ok(snapshot.value());
                        }
                        Ok(StreamEvent::KeepAlive) => {}
                        Ok(StreamEvent::Cancel(reason)) => {
                            yield Err(StoreError::Stream(format!("cancelled by server: {reason}")));
                            return;
                        }
                        Ok(StreamEvent::AuthRevoked) => {
                            yield Err(StoreError::AuthRevoked);
                            return;
                        }
                        Ok(StreamEvent::Other(event)) => {
                            debug!(location = %location, event = %event, "Ignoring stream event");
                        }
                        Err(e) => {
                            warn!(location = %location, error = %e, "Dropping malformed stream event");
                        }
                    }
                }
            }
            debug!(location = %location, "Subscription stream ended");
        };

        Ok(Box::pin(stream))
    }
}
