//! Streaming-protocol parsing for data store subscriptions.
//!
//! The store pushes `text/event-stream` frames. `put` replaces the value at a
//! path relative to the subscribed location, `patch` merges children into it,
//! `keep-alive` carries nothing, and `cancel` / `auth_revoked` end the
//! subscription. [`Snapshot`] folds those events into the current value of
//! the subscribed location.

use serde::Deserialize;
use serde_json::{Map, Value};

use super::error::StoreError;

/// One dispatched `event:` / `data:` frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SseFrame {
    pub event: String,
    pub data: String,
}

/// Stateful line parser that accumulates lines and emits complete frames.
#[derive(Debug, Default)]
pub struct SseParser {
    current_event_type: Option<String>,
    data_buffer: Vec<String>,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one line (without its terminator). A blank line dispatches the
    /// accumulated frame.
    pub fn feed_line(&mut self, line: &str) -> Option<SseFrame> {
        if line.is_empty() {
            let event = self.current_event_type.take();
            let data = std::mem::take(&mut self.data_buffer).join("\n");
            return match event {
                Some(event) => Some(SseFrame { event, data }),
                None if !data.is_empty() => Some(SseFrame {
                    event: "message".to_string(),
                    data,
                }),
                None => None,
            };
        }

        if line.starts_with(':') {
            return None;
        }

        if let Some(rest) = line.strip_prefix("event:") {
            self.current_event_type = Some(rest.trim().to_string());
        } else if let Some(rest) = line.strip_prefix("data:") {
            self.data_buffer.push(rest.trim_start().to_string());
        }
        None
    }
}

/// Splits a byte stream into lines, tolerating chunks that cut a line (or a
/// multi-byte character) in half.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a chunk and return every line it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            lines.push(String::from_utf8_lossy(&line).into_owned());
        }
        lines
    }
}

#[derive(Debug, Deserialize)]
struct PathData {
    path: String,
    data: Value,
}

/// A decoded subscription event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Put { path: String, data: Value },
    Patch { path: String, data: Value },
    KeepAlive,
    Cancel(String),
    AuthRevoked,
    Other(String),
}

/// Decode a raw frame into a [`StreamEvent`].
pub fn parse_event(frame: &SseFrame) -> Result<StreamEvent, StoreError> {
    let decode = |frame: &SseFrame| -> Result<PathData, StoreError> {
        serde_json::from_str(&frame.data).map_err(|e| StoreError::Decode {
            path: format!("<{} event>", frame.event),
            message: e.to_string(),
        })
    };

    match frame.event.as_str() {
        "put" => {
            let PathData { path, data } = decode(frame)?;
            Ok(StreamEvent::Put { path, data })
        }
        "patch" => {
            let PathData { path, data } = decode(frame)?;
            Ok(StreamEvent::Patch { path, data })
        }
        "keep-alive" => Ok(StreamEvent::KeepAlive),
        "cancel" => Ok(StreamEvent::Cancel(frame.data.clone())),
        "auth_revoked" => Ok(StreamEvent::AuthRevoked),
        other => Ok(StreamEvent::Other(other.to_string())),
    }
}

/// Current value of a subscribed location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    value: Value,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The value, or `None` when nothing exists at the location.
    pub fn value(&self) -> Option<Value> {
        if self.value.is_null() {
            None
        } else {
            Some(self.value.clone())
        }
    }

    /// The value below `path`, if any. Used by the in-memory store.
    #[cfg(any(test, feature = "test-utils"))]
    pub fn get(&self, path: &str) -> Option<Value> {
        let pointer: String = split_path(path)
            .iter()
            .map(|s| format!("/{}", s.replace('~', "~0")))
            .collect();
        self.value
            .pointer(&pointer)
            .filter(|v| !v.is_null())
            .cloned()
    }

    /// Apply a `put`: replace the value at `path`.
    pub fn put(&mut self, path: &str, data: Value) {
        let segments = split_path(path);
        set_at(&mut self.value, &segments, data);
    }

    /// Apply a `patch`: set each child of `data` under `path`.
    pub fn patch(&mut self, path: &str, data: Value) {
        let Value::Object(children) = data else {
            self.put(path, data);
            return;
        };
        let base = split_path(path);
        for (key, child) in children {
            let mut segments = base.clone();
            segments.push(key);
            set_at(&mut self.value, &segments, child);
        }
    }
}

fn split_path(path: &str) -> Vec<String> {
    path.split('/')
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
        .collect()
}

fn set_at(root: &mut Value, segments: &[String], data: Value) {
    let Some((last, parents)) = segments.split_last() else {
        *root = data;
        return;
    };

    let mut node = &mut *root;
    for segment in parents {
        if !node.is_object() {
            *node = Value::Object(Map::new());
        }
        let Value::Object(map) = node else { return };
        node = map.entry(segment.clone()).or_insert(Value::Null);
    }

    if data.is_null() {
        if let Value::Object(map) = node {
            map.remove(last);
        }
        prune_empty(root);
        return;
    }

    if !node.is_object() {
        *node = Value::Object(Map::new());
    }
    if let Value::Object(map) = node {
        map.insert(last.clone(), data);
    }
}

/// Deleting the last child of an object makes the object itself absent.
fn prune_empty(value: &mut Value) {
    if let Value::Object(map) = value {
        for child in map.values_mut() {
            prune_empty(child);
        }
        map.retain(|_, child| !child.is_null() && !child.as_object().is_some_and(Map::is_empty));
        if map.is_empty() {
            *value = Value::Null;
        }
    }
}
