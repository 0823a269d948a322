// Remote data gateway for Barberline
// Every table query, write, remote procedure and real-time channel goes through the Backend trait.

use async_trait::async_trait;
use log::debug;
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::models::AuthUser;

pub mod memory;

pub use memory::MemoryBackend;

/// Errors returned by the gateway and by the layers built on it
#[derive(Debug, Clone, PartialEq, Error)]
pub enum BackendError {
    /// A query or remote procedure call failed
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// An insert or update failed
    #[error("Write error: {0}")]
    Write(String),

    /// The operation needs a signed-in user and there is none
    #[error("Authentication required: {0}")]
    AuthRequired(String),

    /// The caller asked for something its local state cannot support
    #[error("Configuration error: {0}")]
    Configuration(String),
}

impl BackendError {
    pub fn decode(what: &str, err: serde_json::Error) -> Self {
        BackendError::Fetch(format!("could not decode {}: {}", what, err))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Order {
    Ascending,
    Descending,
}

/// A table read built fluently:
/// `Query::table("messages").eq("request_id", id).order_by("created_at", Order::Ascending)`
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    pub table: String,
    pub filters: Vec<(String, Value)>,
    pub order: Option<(String, Order)>,
    pub limit: Option<usize>,
}

impl Query {
    pub fn table(table: &str) -> Self {
        Query {
            table: table.to_string(),
            filters: Vec::new(),
            order: None,
            limit: None,
        }
    }

    pub fn eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.filters.push((column.to_string(), value.into()));
        self
    }

    pub fn order_by(mut self, column: &str, order: Order) -> Self {
        self.order = Some((column.to_string(), order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when every equality filter holds for `row`
    pub fn matches(&self, row: &Value) -> bool {
        self.filters
            .iter()
            .all(|(column, expected)| row.get(column) == Some(expected))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChangeKind::Insert => "INSERT",
            ChangeKind::Update => "UPDATE",
            ChangeKind::Delete => "DELETE",
        };
        f.write_str(name)
    }
}

/// A row-level change delivered on a real-time channel
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: String,
    pub record: Value,
    pub old_record: Option<Value>,
}

/// What a channel listens to: one change kind on one table, optionally narrowed
/// by a single equality predicate evaluated server-side.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelFilter {
    pub table: String,
    pub kind: ChangeKind,
    pub eq: Option<(String, Value)>,
}

impl ChannelFilter {
    pub fn inserts(table: &str) -> Self {
        ChannelFilter {
            table: table.to_string(),
            kind: ChangeKind::Insert,
            eq: None,
        }
    }

    pub fn with_eq(mut self, column: &str, value: impl Into<Value>) -> Self {
        self.eq = Some((column.to_string(), value.into()));
        self
    }

    pub fn accepts(&self, event: &ChangeEvent) -> bool {
        if event.table != self.table || event.kind != self.kind {
            return false;
        }
        match &self.eq {
            Some((column, expected)) => event.record.get(column) == Some(expected),
            None => true,
        }
    }
}

/// An open real-time subscription. Events arrive in the order the backend emits them.
/// The subscription is released when the channel is closed or dropped.
pub struct Channel {
    name: String,
    events: mpsc::Receiver<ChangeEvent>,
    release: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl Channel {
    pub fn new(
        name: String,
        events: mpsc::Receiver<ChangeEvent>,
        release: impl FnOnce() + Send + Sync + 'static,
    ) -> Self {
        Channel {
            name,
            events,
            release: Some(Box::new(release)),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Next event, or None once the backend has dropped the channel
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.events.recv().await
    }

    pub fn close(mut self) {
        self.release_now();
    }

    fn release_now(&mut self) {
        if let Some(release) = self.release.take() {
            debug!("Releasing channel {}", self.name);
            self.events.close();
            release();
        }
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        self.release_now();
    }
}

impl fmt::Debug for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Channel").field("name", &self.name).finish()
    }
}

/// The hosted backend as seen by the client
#[async_trait]
pub trait Backend: Send + Sync {
    /// The signed-in user, if any
    fn current_user(&self) -> Option<AuthUser>;

    /// Read rows matching `query`, in the requested order
    async fn select(&self, query: &Query) -> Result<Vec<Value>, BackendError>;

    /// Write one row; the returned record carries the server-assigned id
    async fn insert(&self, table: &str, row: Value) -> Result<Value, BackendError>;

    /// Merge `patch` into the row with `id`
    async fn update(&self, table: &str, id: &str, patch: Value) -> Result<Value, BackendError>;

    /// Invoke a named server-side procedure
    async fn rpc(&self, function: &str, params: Value) -> Result<Value, BackendError>;

    /// Open a real-time channel
    async fn subscribe(&self, filter: ChannelFilter) -> Result<Channel, BackendError>;
}

/// Select rows and decode them into `T`
pub async fn select_as<T: serde::de::DeserializeOwned>(
    backend: &dyn Backend,
    query: &Query,
) -> Result<Vec<T>, BackendError> {
    let rows = backend.select(query).await?;
    rows.into_iter()
        .map(|row| serde_json::from_value(row).map_err(|e| BackendError::decode(&query.table, e)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_query_matches_all_filters() {
        let query = Query::table("messages").eq("request_id", "req-1").eq("kind", "text");

        assert!(query.matches(&json!({"request_id": "req-1", "kind": "text", "content": "hi"})));
        assert!(!query.matches(&json!({"request_id": "req-1", "kind": "offer"})));
        assert!(!query.matches(&json!({"kind": "text"})));
    }

    #[test]
    fn test_channel_filter_accepts() {
        let filter = ChannelFilter::inserts("messages").with_eq("request_id", "req-1");
        let event = ChangeEvent {
            kind: ChangeKind::Insert,
            table: "messages".to_string(),
            record: json!({"id": "m1", "request_id": "req-1"}),
            old_record: None,
        };
        assert!(filter.accepts(&event));

        let other_request = ChangeEvent {
            record: json!({"id": "m2", "request_id": "req-2"}),
            ..event.clone()
        };
        assert!(!filter.accepts(&other_request));

        let update = ChangeEvent { kind: ChangeKind::Update, ..event };
        assert!(!filter.accepts(&update));
    }

    #[tokio::test]
    async fn test_channel_release_runs_once() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let released = Arc::new(AtomicUsize::new(0));
        let counter = released.clone();
        let (_tx, rx) = mpsc::channel(4);
        let channel = Channel::new("test".to_string(), rx, move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        channel.close();
        assert_eq!(released.load(Ordering::SeqCst), 1);
    }
}
