pub mod feed;
pub mod gateway;
pub mod reconciler;

use std::sync::Arc;

use chrono::Utc;
use futures::StreamExt;
use thiserror::Error;
use tokio::sync::{broadcast, Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::gate::{LifecycleGate, ValidationError};
use crate::state::ReviewConfig;
use crate::store::{FeedError, RemoteError};
use crate::topics::types::{Topic, TopicPatch};
use crate::topics::FilterSpec;

use feed::{ChangeFeed, FeedCancel};
use gateway::QueryGateway;
use reconciler::{LoadOutcome, Reconciler, ViewState};

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    #[error(transparent)]
    Remote(#[from] RemoteError),
    #[error(transparent)]
    Feed(#[from] FeedError),
    #[error(transparent)]
    Validation(#[from] ValidationError),
    #[error("topic view is closed")]
    Closed,
}

/// User-facing status messages (toasts, console lines).
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    Info(String),
    Error(SyncError),
}

const NOTICE_CAPACITY: usize = 64;

struct Subscription {
    cancel: FeedCancel,
    pump: JoinHandle<()>,
}

impl Subscription {
    fn release(self) {
        self.cancel.unsubscribe();
        self.pump.abort();
    }
}

/// Owns the topic view and drives it from fetches and the change feed.
///
/// Reviewer commands go through the lifecycle gate and are written to the
/// remote store; the view only changes when the write echoes back.
pub struct TopicSync {
    gateway: QueryGateway,
    view: Arc<RwLock<Reconciler>>,
    config: Arc<RwLock<ReviewConfig>>,
    subscription: Mutex<Option<Subscription>>,
    notices: broadcast::Sender<Notice>,
}

impl TopicSync {
    pub fn new(gateway: QueryGateway, config: Arc<RwLock<ReviewConfig>>) -> Self {
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            gateway,
            view: Arc::new(RwLock::new(Reconciler::new())),
            config,
            subscription: Mutex::new(None),
            notices,
        }
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    fn report<T>(&self, action: &str, result: Result<T, SyncError>) -> Result<T, SyncError> {
        match &result {
            Ok(_) => {
                let _ = self.notices.send(Notice::Info(format!("{} succeeded", action)));
            }
            Err(err) => {
                warn!(action, error = %err, "command failed");
                let _ = self.notices.send(Notice::Error(err.clone()));
            }
        }
        result
    }

    /// Ordered topics for rendering.
    pub async fn current_view(&self) -> Vec<Topic> {
        self.view.read().await.snapshot().to_vec()
    }

    pub async fn view_state(&self) -> ViewState {
        self.view.read().await.state()
    }

    pub async fn is_stale(&self) -> bool {
        self.view.read().await.is_stale()
    }

    pub async fn active_filter(&self) -> Option<FilterSpec> {
        self.view.read().await.active_filter().cloned()
    }

    /// The whole table, regardless of the active filter. Used for stats.
    pub async fn all_topics(&self) -> Result<Vec<Topic>, SyncError> {
        Ok(self.gateway.fetch_all().await?)
    }

    /// Switches the view to `filter`. Only the most recently started load
    /// may commit; an older one resolving later reports `Discarded`.
    pub async fn load(&self, filter: FilterSpec) -> Result<LoadOutcome, SyncError> {
        let ticket = self.view.write().await.begin_load(filter)?;
        let generation = ticket.generation();

        // Subscribe before fetching so nothing between snapshot and feed is lost.
        let feed_result = self.resubscribe().await;

        let fetched = self.gateway.fetch(ticket.filter()).await;
        let committed = self.view.write().await.commit_load(ticket, fetched);

        // Whether or not the fetch worked, the view now has no live feed.
        if let Err(err) = feed_result {
            if !matches!(committed, Ok(LoadOutcome::Discarded)) {
                self.view.write().await.feed_failed(&err);
                let _ = self.notices.send(Notice::Error(SyncError::Feed(err)));
            }
        }
        let outcome = self.report("load", committed)?;
        debug!(generation, ?outcome, "load finished");
        Ok(outcome)
    }

    /// Reloads the active filter; also the way out of a degraded view.
    pub async fn refetch(&self) -> Result<LoadOutcome, SyncError> {
        let filter = self.active_filter().await.unwrap_or_default();
        self.load(filter).await
    }

    async fn resubscribe(&self) -> Result<(), FeedError> {
        let mut slot = self.subscription.lock().await;
        if let Some(previous) = slot.take() {
            previous.release();
        }
        if self.view.read().await.state() == ViewState::Closed {
            return Ok(());
        }

        let feed = self.gateway.subscribe().await?;
        let cancel = feed.cancel_handle();
        let pump = tokio::spawn(pump_feed(feed, self.view.clone(), self.notices.clone()));
        *slot = Some(Subscription { cancel, pump });
        Ok(())
    }

    /// Unsubscribes and closes the view. Safe to call repeatedly.
    pub async fn close(&self) {
        self.view.write().await.close();
        if let Some(sub) = self.subscription.lock().await.take() {
            sub.release();
            info!(table = %self.gateway.scope(), "change feed released");
        }
    }

    async fn gate(&self) -> Result<LifecycleGate, SyncError> {
        if self.view.read().await.state() == ViewState::Closed {
            return Err(SyncError::Closed);
        }
        let min = self.config.read().await.min_commentary_len;
        Ok(LifecycleGate::new(min))
    }

    /// Persisted record; the remote store is the source of truth for gating.
    async fn persisted(&self, id: &str) -> Result<Topic, SyncError> {
        Ok(self.gateway.fetch_one(id).await?)
    }

    async fn submit(&self, id: &str, patch: TopicPatch) -> Result<(), SyncError> {
        self.gateway.write(id, patch).await?;
        info!(topic_id = id, "update submitted, awaiting feed echo");
        Ok(())
    }

    /// Gates a status change against the persisted record and submits it.
    async fn transition<F>(&self, action: &str, id: &str, decide: F) -> Result<(), SyncError>
    where
        F: FnOnce(&LifecycleGate, &Topic) -> Result<TopicPatch, ValidationError> + Send,
    {
        let result: Result<(), SyncError> = async {
            let gate = self.gate().await?;
            let current = self.persisted(id).await?;
            let patch = decide(&gate, &current)?;
            self.submit(id, patch).await
        }
        .await;
        self.report(action, result)
    }

    pub async fn save_draft(
        &self,
        id: &str,
        commentary: String,
        hashtags: Vec<String>,
    ) -> Result<(), SyncError> {
        self.transition("save draft", id, |gate, current| {
            Ok(gate.save_draft(current, commentary, hashtags, Utc::now()))
        })
        .await
    }

    pub async fn approve(
        &self,
        id: &str,
        commentary: String,
        hashtags: Vec<String>,
    ) -> Result<(), SyncError> {
        // Checked before any remote call.
        let min = self.config.read().await.min_commentary_len;
        if let Err(err) = LifecycleGate::new(min).check_commentary(&commentary) {
            return self.report("approve", Err(err.into()));
        }
        self.transition("approve", id, |gate, current| {
            gate.approve(current, commentary, hashtags, Utc::now())
        })
        .await
    }

    pub async fn quick_approve(&self, id: &str) -> Result<(), SyncError> {
        self.transition("quick approve", id, |gate, current| {
            gate.quick_approve(current, Utc::now())
        })
        .await
    }

    pub async fn archive(&self, id: &str) -> Result<(), SyncError> {
        self.transition("archive", id, |gate, current| gate.archive(current, Utc::now()))
            .await
    }

    pub async fn reject(&self, id: &str) -> Result<(), SyncError> {
        self.transition("reject", id, |gate, current| gate.reject(current, Utc::now()))
            .await
    }

    pub async fn start_production(&self, id: &str) -> Result<(), SyncError> {
        self.transition("start production", id, |gate, current| {
            gate.start_production(current, Utc::now())
        })
        .await
    }

    pub async fn publish(&self, id: &str) -> Result<(), SyncError> {
        self.transition("publish", id, |gate, current| gate.publish(current, Utc::now()))
            .await
    }
}

/// Feeds events into the view one at a time until the feed ends.
async fn pump_feed(
    mut feed: ChangeFeed,
    view: Arc<RwLock<Reconciler>>,
    notices: broadcast::Sender<Notice>,
) {
    while let Some(item) = feed.next().await {
        match item {
            Ok(event) => {
                let topic_id = event.topic_id().to_string();
                let kind = event.kind();
                match view.write().await.apply_event(event) {
                    Ok(applied) => debug!(%topic_id, kind, ?applied, "feed event"),
                    Err(SyncError::Closed) => break,
                    Err(err) => warn!(%topic_id, error = %err, "feed event rejected"),
                }
            }
            Err(err) if !err.ends_feed() => {
                warn!(error = %err, "skipping undecodable change notification");
                let _ = notices.send(Notice::Error(SyncError::Feed(err)));
            }
            Err(err) => {
                view.write().await.feed_failed(&err);
                let _ = notices.send(Notice::Error(SyncError::Feed(err)));
                break;
            }
        }
    }
    debug!(table = %feed.scope(), "feed pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::time::Duration;

    use async_trait::async_trait;
    use tokio::sync::Notify;

    use crate::store::{MemoryStore, RawFeed, RemoteStore, TableScope};
    use crate::topics::types::fixtures::topic;
    use crate::topics::types::{ChangeEvent, PartialRecord, Precondition, Status};
    use crate::topics::RemoteQuery;

    fn setup(rows: Vec<Topic>) -> (Arc<MemoryStore>, TopicSync) {
        let store = Arc::new(MemoryStore::with_topics(TableScope::topics(), rows));
        let gateway = QueryGateway::new(store.clone(), TableScope::topics());
        let sync = TopicSync::new(gateway, Arc::new(RwLock::new(ReviewConfig::default())));
        (store, sync)
    }

    async fn eventually<F, Fut>(mut check: F)
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = bool>,
    {
        for _ in 0..200 {
            if check().await {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    fn pending() -> FilterSpec {
        FilterSpec::with_status(&[Status::Pending])
    }

    #[tokio::test]
    async fn test_archive_echo_removes_topic_from_pending_view() {
        let (_store, sync) = setup(vec![topic("A", 0), topic("B", 1)]);
        sync.load(pending()).await.unwrap();
        assert_eq!(sync.current_view().await.len(), 2);

        sync.archive("A").await.unwrap();
        eventually(|| async { sync.current_view().await.iter().all(|t| t.id != "A") }).await;
        assert_eq!(sync.current_view().await.len(), 1);
        sync.close().await;
    }

    #[tokio::test]
    async fn test_short_commentary_never_reaches_store() {
        let (store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();
        let mut notices = sync.notices();

        let err = sync
            .approve("A", "x".repeat(99), vec![])
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::CommentaryTooShort { len: 99, .. })
        ));
        assert_eq!(store.get("A").await.unwrap().status, Status::Pending);
        assert!(matches!(notices.recv().await.unwrap(), Notice::Error(_)));

        sync.approve("A", "x".repeat(100), vec!["ai".into()])
            .await
            .unwrap();
        let stored = store.get("A").await.unwrap();
        assert_eq!(stored.status, Status::Approved);
        assert!(stored.approved_at.is_some());

        eventually(|| async {
            sync.current_view()
                .await
                .iter()
                .any(|t| t.status == Status::Approved && t.approved_at.is_some())
        })
        .await;
        sync.close().await;
    }

    #[tokio::test]
    async fn test_duplicate_approval_rejected() {
        let (_store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();
        sync.approve("A", "y".repeat(120), vec![]).await.unwrap();
        let err = sync.approve("A", "y".repeat(120), vec![]).await.unwrap_err();
        assert!(matches!(
            err,
            SyncError::Validation(ValidationError::IllegalTransition { .. })
        ));
        sync.close().await;
    }

    #[tokio::test]
    async fn test_save_draft_then_approve_round_trip() {
        let (store, sync) = setup(vec![topic("A", 0), topic("B", 1)]);
        sync.load(FilterSpec::default()).await.unwrap();

        let long = "z".repeat(100);
        sync.save_draft("A", long.clone(), vec!["ml".into()])
            .await
            .unwrap();
        sync.quick_approve("A").await.unwrap();
        assert_eq!(store.get("A").await.unwrap().status, Status::Approved);

        let short = "z".repeat(99);
        sync.save_draft("B", short.clone(), vec![]).await.unwrap();
        assert!(sync.approve("B", short, vec![]).await.is_err());
        assert!(sync.quick_approve("B").await.is_err());
        assert_eq!(store.get("B").await.unwrap().status, Status::Pending);
        sync.close().await;
    }

    #[tokio::test]
    async fn test_created_events_flow_into_view() {
        let (store, sync) = setup(vec![]);
        sync.load(pending()).await.unwrap();
        store.insert(topic("new", 10)).await;
        eventually(|| async { sync.current_view().await.len() == 1 }).await;

        store.delete("new").await;
        eventually(|| async { sync.current_view().await.is_empty() }).await;
        sync.close().await;
    }

    #[tokio::test]
    async fn test_feed_loss_degrades_until_refetch() {
        let (store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();
        let mut notices = sync.notices();

        store.disconnect_feeds("relay restart");
        eventually(|| async { sync.view_state().await == ViewState::Degraded }).await;
        assert!(sync.is_stale().await);
        assert_eq!(sync.current_view().await.len(), 1);
        assert!(matches!(
            notices.recv().await.unwrap(),
            Notice::Error(SyncError::Feed(FeedError::Disconnected(_)))
        ));

        sync.refetch().await.unwrap();
        assert_eq!(sync.view_state().await, ViewState::Live);
        store.insert(topic("B", 5)).await;
        eventually(|| async { sync.current_view().await.len() == 2 }).await;
        sync.close().await;
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_final() {
        let (_store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();
        sync.close().await;
        sync.close().await;
        assert_eq!(sync.view_state().await, ViewState::Closed);
        assert_eq!(sync.archive("A").await, Err(SyncError::Closed));
        assert_eq!(sync.load(pending()).await, Err(SyncError::Closed));
    }

    #[tokio::test]
    async fn test_failed_load_keeps_previous_view() {
        let (_store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();

        let broken = QueryGateway::new(
            Arc::new(MemoryStore::new(TableScope::new("elsewhere"))),
            TableScope::topics(),
        );
        let sync = TopicSync {
            gateway: broken,
            ..sync
        };
        let err = sync.load(pending()).await.unwrap_err();
        assert!(matches!(err, SyncError::Remote(RemoteError::UnknownTable(_))));
        assert_eq!(sync.current_view().await.len(), 1);
        assert_eq!(sync.active_filter().await, Some(FilterSpec::default()));
        // The old subscription was released and no new one could be opened.
        assert_eq!(sync.view_state().await, ViewState::Degraded);
        assert!(sync.is_stale().await);
        sync.close().await;
    }

    #[tokio::test]
    async fn test_interleaved_commands_cannot_regress_store() {
        let (store, sync) = setup(vec![topic("A", 0)]);
        sync.load(FilterSpec::default()).await.unwrap();
        let gateway = sync.gateway.clone();
        let gate = LifecycleGate::default();

        let read = gateway.fetch_one("A").await.unwrap();
        let now = Utc::now();
        let draft = gate.save_draft(&read, "notes".into(), vec![], now + chrono::Duration::seconds(1));
        let archive = gate.archive(&read, now).unwrap();

        gateway.write("A", draft).await.unwrap();
        assert_eq!(
            gateway.write("A", archive).await,
            Err(RemoteError::Conflict("A".into()))
        );

        let stored = store.get("A").await.unwrap();
        assert_eq!(stored.status, Status::Pending);
        eventually(|| async {
            sync.current_view().await.first() == Some(&stored)
        })
        .await;

        // A fresh read picks up the draft and the archive goes through.
        sync.archive("A").await.unwrap();
        assert_eq!(store.get("A").await.unwrap().status, Status::Archived);
        sync.close().await;
    }

    #[tokio::test]
    async fn test_racing_approvals_only_one_lands() {
        let (store, sync) = setup(vec![topic("A", 0)]);
        let gateway = sync.gateway.clone();
        let gate = LifecycleGate::default();

        let read = gateway.fetch_one("A").await.unwrap();
        let first = gate
            .approve(&read, "a".repeat(100), vec!["one".into()], Utc::now())
            .unwrap();
        let second = gate
            .approve(&read, "b".repeat(120), vec!["two".into()], Utc::now())
            .unwrap();

        gateway.write("A", first).await.unwrap();
        assert_eq!(
            gateway.write("A", second).await,
            Err(RemoteError::Conflict("A".into()))
        );
        let stored = store.get("A").await.unwrap();
        assert_eq!(stored.commentary, Some("a".repeat(100)));
        assert_eq!(stored.hashtags, vec!["one".to_string()]);
        sync.close().await;
    }

    #[tokio::test]
    async fn test_malformed_notification_keeps_view_live() {
        let view = Arc::new(RwLock::new(Reconciler::new()));
        {
            let mut v = view.write().await;
            let ticket = v.begin_load(FilterSpec::default()).unwrap();
            v.commit_load(ticket, Ok(vec![])).unwrap();
        }
        let (notices, mut rx) = broadcast::channel(8);
        let feed = ChangeFeed::from_stream(
            TableScope::topics(),
            futures::stream::iter(vec![
                Ok(ChangeEvent::Created(topic("A", 0))),
                Err(FeedError::Decode("truncated line".into())),
                Ok(ChangeEvent::Created(topic("B", 1))),
            ])
            .boxed(),
        );

        pump_feed(feed, view.clone(), notices).await;

        let v = view.read().await;
        assert_eq!(v.state(), ViewState::Live);
        assert_eq!(v.snapshot().len(), 2);
        assert!(matches!(
            rx.recv().await.unwrap(),
            Notice::Error(SyncError::Feed(FeedError::Decode(_)))
        ));
    }

    /// Holds the first query until released.
    struct HeldStore {
        inner: MemoryStore,
        held: AtomicBool,
        entered: Notify,
        release: Notify,
    }

    #[async_trait]
    impl RemoteStore for HeldStore {
        async fn query(
            &self,
            scope: &TableScope,
            query: &RemoteQuery,
        ) -> Result<Vec<Topic>, RemoteError> {
            if !self.held.swap(true, Ordering::SeqCst) {
                self.entered.notify_one();
                self.release.notified().await;
            }
            self.inner.query(scope, query).await
        }

        async fn write(
            &self,
            scope: &TableScope,
            id: &str,
            record: &PartialRecord,
            precondition: &Precondition,
        ) -> Result<(), RemoteError> {
            self.inner.write(scope, id, record, precondition).await
        }

        async fn subscribe_changes(&self, scope: &TableScope) -> Result<RawFeed, FeedError> {
            self.inner.subscribe_changes(scope).await
        }
    }

    #[tokio::test]
    async fn test_superseded_load_result_is_discarded() {
        let mut approved = topic("B", 1);
        approved.status = Status::Approved;
        let store = Arc::new(HeldStore {
            inner: MemoryStore::with_topics(TableScope::topics(), vec![topic("A", 0), approved]),
            held: AtomicBool::new(false),
            entered: Notify::new(),
            release: Notify::new(),
        });
        let gateway = QueryGateway::new(store.clone(), TableScope::topics());
        let sync = Arc::new(TopicSync::new(
            gateway,
            Arc::new(RwLock::new(ReviewConfig::default())),
        ));

        let first = {
            let sync = sync.clone();
            tokio::spawn(async move { sync.load(pending()).await })
        };
        store.entered.notified().await;

        let second = sync
            .load(FilterSpec::with_status(&[Status::Approved]))
            .await
            .unwrap();
        assert!(matches!(second, LoadOutcome::Committed { topics: 1, .. }));

        store.release.notify_one();
        assert_eq!(first.await.unwrap().unwrap(), LoadOutcome::Discarded);

        let view = sync.current_view().await;
        assert_eq!(view.len(), 1);
        assert_eq!(view[0].id, "B");
        sync.close().await;
    }
}
