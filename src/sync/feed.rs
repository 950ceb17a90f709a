use std::pin::Pin;
use std::task::{Context, Poll};

use futures::stream::{AbortHandle, Abortable};
use futures::Stream;
use serde::Deserialize;
use tracing::{debug, info};

use crate::store::{FeedError, RawFeed, RemoteStore, TableScope};
use crate::topics::types::{ChangeEvent, Topic};

/// Live, cancellable sequence of change events for one table.
///
/// The sequence ends after [`FeedCancel::unsubscribe`] or after yielding a
/// connection-level `FeedError`. Undecodable notifications are yielded as
/// `FeedError::Decode` and the feed carries on. It cannot be restarted;
/// subscribe again instead.
pub struct ChangeFeed {
    scope: TableScope,
    inner: Abortable<RawFeed>,
    handle: AbortHandle,
    done: bool,
}

/// Cancellation side of a [`ChangeFeed`], usable after the feed itself was
/// moved into a consumer task.
#[derive(Debug, Clone)]
pub struct FeedCancel(AbortHandle);

impl FeedCancel {
    /// Releases the subscription. Safe to call repeatedly.
    pub fn unsubscribe(&self) {
        self.0.abort();
    }
}

impl ChangeFeed {
    pub async fn subscribe(store: &dyn RemoteStore, scope: &TableScope) -> Result<Self, FeedError> {
        let raw = store.subscribe_changes(scope).await?;
        info!(table = %scope, "change feed subscribed");
        Ok(Self::from_stream(scope.clone(), raw))
    }

    /// Wraps any event stream, e.g. a synthetic one in tests.
    pub fn from_stream(scope: TableScope, raw: RawFeed) -> Self {
        let (handle, registration) = AbortHandle::new_pair();
        Self {
            scope,
            inner: Abortable::new(raw, registration),
            handle,
            done: false,
        }
    }

    pub fn scope(&self) -> &TableScope {
        &self.scope
    }

    pub fn cancel_handle(&self) -> FeedCancel {
        FeedCancel(self.handle.clone())
    }

    pub fn unsubscribe(&self) {
        debug!(table = %self.scope, "change feed unsubscribed");
        self.handle.abort();
    }
}

impl Stream for ChangeFeed {
    type Item = Result<ChangeEvent, FeedError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.done {
            return Poll::Ready(None);
        }
        match Pin::new(&mut this.inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(event))) => Poll::Ready(Some(Ok(event))),
            Poll::Ready(Some(Err(err))) => {
                this.done = err.ends_feed();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                this.done = true;
                Poll::Ready(None)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
enum WireEventType {
    #[serde(alias = "insert", alias = "created")]
    Insert,
    #[serde(alias = "update", alias = "updated")]
    Update,
    #[serde(alias = "delete", alias = "deleted")]
    Delete,
}

#[derive(Debug, Deserialize)]
struct OldRecord {
    id: String,
}

/// One notification as sent by the change relay.
#[derive(Debug, Deserialize)]
struct WireChange {
    #[serde(rename = "eventType", alias = "event_type")]
    event_type: WireEventType,
    #[serde(default, alias = "newRecord", alias = "new_record")]
    new: Option<Topic>,
    #[serde(default)]
    old: Option<OldRecord>,
    #[serde(default, rename = "oldRecordId", alias = "old_record_id")]
    old_record_id: Option<String>,
}

impl TryFrom<WireChange> for ChangeEvent {
    type Error = FeedError;

    fn try_from(wire: WireChange) -> Result<Self, Self::Error> {
        match wire.event_type {
            WireEventType::Insert => wire
                .new
                .map(ChangeEvent::Created)
                .ok_or_else(|| FeedError::Decode("insert without new record".into())),
            WireEventType::Update => wire
                .new
                .map(ChangeEvent::Updated)
                .ok_or_else(|| FeedError::Decode("update without new record".into())),
            WireEventType::Delete => wire
                .old
                .map(|o| o.id)
                .or(wire.old_record_id)
                .map(ChangeEvent::Deleted)
                .ok_or_else(|| FeedError::Decode("delete without old record id".into())),
        }
    }
}

/// Decodes one relay line. Blank lines, `:` heartbeats and non-data SSE
/// fields yield `None`.
pub fn decode_line(line: &str) -> Option<Result<ChangeEvent, FeedError>> {
    let line = line.trim();
    if line.is_empty() || line.starts_with(':') {
        return None;
    }
    let payload = match line.strip_prefix("data:") {
        Some(rest) => rest.trim_start(),
        None if line.starts_with('{') => line,
        None => return None,
    };
    let parsed = serde_json::from_str::<WireChange>(payload)
        .map_err(|e| FeedError::Decode(e.to_string()))
        .and_then(ChangeEvent::try_from);
    Some(parsed)
}
