pub mod memory;
pub mod postgrest;

use std::fmt;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::topics::types::{ChangeEvent, PartialRecord, Precondition, Topic, IMMUTABLE_FIELDS};
use crate::topics::RemoteQuery;

pub use memory::MemoryStore;
pub use postgrest::PostgrestStore;

/// Failure talking to the remote store. Never retried by this crate.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RemoteError {
    #[error("transport error: {0}")]
    Transport(String),
    #[error("remote returned {code}: {body}")]
    Status { code: u16, body: String },
    #[error("could not decode remote response: {0}")]
    Decode(String),
    #[error("field `{0}` is immutable")]
    ImmutableField(String),
    #[error("unknown table `{0}`")]
    UnknownTable(String),
    #[error("no record with id `{0}`")]
    NotFound(String),
    #[error("topic `{0}` changed since it was read")]
    Conflict(String),
}

/// Failure of a live change subscription.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum FeedError {
    #[error("could not open change feed: {0}")]
    Connect(String),
    #[error("change feed disconnected: {0}")]
    Disconnected(String),
    #[error("change feed lagged and dropped {0} events")]
    Lagged(u64),
    #[error("malformed change notification: {0}")]
    Decode(String),
}

impl FeedError {
    /// Whether the subscription is gone. A malformed notification only
    /// loses that one event.
    pub fn ends_feed(&self) -> bool {
        !matches!(self, FeedError::Decode(_))
    }
}

/// Name of the remote table a query, write or subscription targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableScope(String);

impl TableScope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn topics() -> Self {
        Self::new("topics")
    }

    pub fn name(&self) -> &str {
        &self.0
    }
}

impl Default for TableScope {
    fn default() -> Self {
        Self::topics()
    }
}

impl fmt::Display for TableScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Raw change stream as produced by a backend.
pub type RawFeed = BoxStream<'static, Result<ChangeEvent, FeedError>>;

/// The remote source of truth for topics.
///
/// Implementations deliver per-record events in order; ordering across
/// records and exactly-once delivery are not promised.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Rows matching `query`, in the query's order.
    async fn query(&self, scope: &TableScope, query: &RemoteQuery)
        -> Result<Vec<Topic>, RemoteError>;

    /// Apply a partial record to one row, only if the row still satisfies
    /// `precondition`. A row that exists but no longer does is a
    /// `RemoteError::Conflict`.
    async fn write(
        &self,
        scope: &TableScope,
        id: &str,
        record: &PartialRecord,
        precondition: &Precondition,
    ) -> Result<(), RemoteError>;

    /// Open a change subscription. Dropping the stream releases it.
    async fn subscribe_changes(&self, scope: &TableScope) -> Result<RawFeed, FeedError>;
}

/// Rejects partial records that try to set identity or creation time.
pub fn ensure_mutable(record: &PartialRecord) -> Result<(), RemoteError> {
    match IMMUTABLE_FIELDS.iter().find(|f| record.contains_key(**f)) {
        Some(field) => Err(RemoteError::ImmutableField(field.to_string())),
        None => Ok(()),
    }
}
