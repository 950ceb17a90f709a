use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use super::{ensure_mutable, FeedError, RawFeed, RemoteError, RemoteStore, TableScope};
use crate::topics::types::{
    ChangeEvent, FirstMover, Momentum, PartialRecord, PlatformSuggestions, Precondition, Status,
    Topic, TopicId, Verdict,
};
use crate::topics::RemoteQuery;

const FEED_CAPACITY: usize = 256;

/// In-process topic table with a broadcast change feed.
///
/// Used for the offline console and for tests. Every mutation is echoed to
/// all open subscriptions, the same way the hosted table notifies clients.
pub struct MemoryStore {
    scope: TableScope,
    rows: RwLock<HashMap<TopicId, Topic>>,
    changes: broadcast::Sender<Result<ChangeEvent, FeedError>>,
}

impl MemoryStore {
    pub fn new(scope: TableScope) -> Self {
        Self::with_topics(scope, Vec::new())
    }

    /// Store pre-populated without emitting change events.
    pub fn with_topics(scope: TableScope, topics: Vec<Topic>) -> Self {
        let (changes, _) = broadcast::channel(FEED_CAPACITY);
        let rows = topics.into_iter().map(|t| (t.id.clone(), t)).collect();
        Self {
            scope,
            rows: RwLock::new(rows),
            changes,
        }
    }

    fn check_scope(&self, scope: &TableScope) -> Result<(), RemoteError> {
        if *scope == self.scope {
            Ok(())
        } else {
            Err(RemoteError::UnknownTable(scope.to_string()))
        }
    }

    fn publish(&self, event: ChangeEvent) {
        debug!(topic_id = %event.topic_id(), kind = event.kind(), "memory store change");
        // No receivers is fine: nobody is watching.
        let _ = self.changes.send(Ok(event));
    }

    /// Upstream producer path: add a brand-new topic.
    pub async fn insert(&self, topic: Topic) {
        self.rows.write().await.insert(topic.id.clone(), topic.clone());
        self.publish(ChangeEvent::Created(topic));
    }

    pub async fn delete(&self, id: &str) -> bool {
        let removed = self.rows.write().await.remove(id).is_some();
        if removed {
            self.publish(ChangeEvent::Deleted(id.to_string()));
        }
        removed
    }

    pub async fn get(&self, id: &str) -> Option<Topic> {
        self.rows.read().await.get(id).cloned()
    }

    /// Drops every open subscription with a disconnect error.
    pub fn disconnect_feeds(&self, reason: &str) {
        let _ = self
            .changes
            .send(Err(FeedError::Disconnected(reason.to_string())));
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn query(
        &self,
        scope: &TableScope,
        query: &RemoteQuery,
    ) -> Result<Vec<Topic>, RemoteError> {
        self.check_scope(scope)?;
        let rows = self.rows.read().await;
        let mut matched: Vec<Topic> = rows
            .values()
            .filter(|t| query.evaluate(t))
            .cloned()
            .collect();
        matched.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        if query.order.descending {
            matched.reverse();
        }
        Ok(matched)
    }

    async fn write(
        &self,
        scope: &TableScope,
        id: &str,
        record: &PartialRecord,
        precondition: &Precondition,
    ) -> Result<(), RemoteError> {
        self.check_scope(scope)?;
        ensure_mutable(record)?;

        let updated = {
            let mut rows = self.rows.write().await;
            let row = rows
                .get_mut(id)
                .ok_or_else(|| RemoteError::NotFound(id.to_string()))?;
            if !precondition.holds(row) {
                debug!(topic_id = id, "conditional write rejected");
                return Err(RemoteError::Conflict(id.to_string()));
            }

            let mut value =
                serde_json::to_value(&*row).map_err(|e| RemoteError::Decode(e.to_string()))?;
            if let Some(obj) = value.as_object_mut() {
                obj.extend(record.clone());
            }
            let merged: Topic =
                serde_json::from_value(value).map_err(|e| RemoteError::Decode(e.to_string()))?;
            *row = merged.clone();
            merged
        };

        self.publish(ChangeEvent::Updated(updated));
        Ok(())
    }

    async fn subscribe_changes(&self, scope: &TableScope) -> Result<RawFeed, FeedError> {
        if *scope != self.scope {
            return Err(FeedError::Connect(format!("unknown table `{}`", scope)));
        }
        let stream = BroadcastStream::new(self.changes.subscribe()).map(|item| match item {
            Ok(change) => change,
            Err(BroadcastStreamRecvError::Lagged(n)) => Err(FeedError::Lagged(n)),
        });
        Ok(stream.boxed())
    }
}

/// A handful of realistic topics for the offline console.
pub fn sample_topics(now: DateTime<Utc>) -> Vec<Topic> {
    let make = |id: &str,
                title: &str,
                summary: &str,
                momentum: Momentum,
                depth: f64,
                viral: f64,
                age_hours: i64| {
        let created = now - Duration::hours(age_hours);
        Topic {
            id: id.to_string(),
            title: title.to_string(),
            summary: summary.to_string(),
            relevance: String::new(),
            content_hook: String::new(),
            momentum,
            technical_depth: depth,
            viral_potential: viral,
            status: Status::Pending,
            commentary: None,
            platform_suggestions: PlatformSuggestions::default(),
            hashtags: vec![],
            verdict: None,
            angle: None,
            reasoning: None,
            content_goldmine_score: None,
            urgency_score: None,
            content_potential_score: None,
            first_mover_advantage: None,
            generated_at: created,
            created_at: created,
            updated_at: created,
            approved_at: None,
        }
    };

    let mut strategic = make(
        "t-004",
        "Small models beat frontier models on tool use",
        "A distilled 8B model tops a public agent benchmark.",
        Momentum::Peaking,
        4.0,
        5.0,
        1,
    );
    strategic.verdict = Some(Verdict::Go);
    strategic.content_goldmine_score = Some(8.0);
    strategic.first_mover_advantage = Some(FirstMover::Yes);
    strategic.angle = Some("Why size stopped mattering".to_string());

    vec![
        make(
            "t-001",
            "Open-weight reasoning model released",
            "A new open-weight model matches closed models on math benchmarks.",
            Momentum::Breaking,
            4.0,
            5.0,
            3,
        ),
        make(
            "t-002",
            "GPU prices fall for the first time in two years",
            "Spot prices for datacenter GPUs dropped sharply this week.",
            Momentum::Emerging,
            2.0,
            3.0,
            12,
        ),
        make(
            "t-003",
            "Regulators publish AI incident reporting draft",
            "Draft rules would require disclosure of model failures.",
            Momentum::Critical,
            3.0,
            2.0,
            30,
        ),
        strategic,
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topics::types::fixtures::{at, topic};
    use crate::topics::FilterSpec;

    #[tokio::test]
    async fn test_query_orders_newest_first() {
        let store = MemoryStore::with_topics(
            TableScope::topics(),
            vec![topic("old", 1), topic("new", 3), topic("mid", 2)],
        );
        let rows = store
            .query(&TableScope::topics(), &FilterSpec::default().compile())
            .await
            .unwrap();
        let ids: Vec<_> = rows.iter().map(|t| t.id.as_str()).collect();
        assert_eq!(ids, vec!["new", "mid", "old"]);
    }

    #[tokio::test]
    async fn test_write_merges_and_echoes() {
        let store = MemoryStore::with_topics(TableScope::topics(), vec![topic("a", 0)]);
        let mut feed = store.subscribe_changes(&TableScope::topics()).await.unwrap();

        let mut record = PartialRecord::new();
        record.insert("status".into(), "archived".into());
        record.insert("updated_at".into(), at(9).to_rfc3339().into());
        store.write(&TableScope::topics(), "a", &record, &Precondition::default()).await.unwrap();

        let stored = store.get("a").await.unwrap();
        assert_eq!(stored.status, Status::Archived);
        assert_eq!(stored.updated_at, at(9));

        match feed.next().await {
            Some(Ok(ChangeEvent::Updated(t))) => assert_eq!(t.status, Status::Archived),
            other => panic!("unexpected feed item: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_write_rejects_immutable_fields_and_unknown_rows() {
        let store = MemoryStore::with_topics(TableScope::topics(), vec![topic("a", 0)]);
        let mut record = PartialRecord::new();
        record.insert("id".into(), "b".into());
        assert_eq!(
            store.write(&TableScope::topics(), "a", &record, &Precondition::default()).await,
            Err(RemoteError::ImmutableField("id".into()))
        );

        let empty = PartialRecord::new();
        assert_eq!(
            store.write(&TableScope::topics(), "zzz", &empty, &Precondition::default()).await,
            Err(RemoteError::NotFound("zzz".into()))
        );
    }

    #[tokio::test]
    async fn test_write_honours_precondition() {
        let store = MemoryStore::with_topics(TableScope::topics(), vec![topic("a", 0)]);
        let mut record = PartialRecord::new();
        record.insert("status".into(), "approved".into());
        record.insert("updated_at".into(), at(5).to_rfc3339().into());
        let read = Precondition {
            updated_at: Some(at(0)),
            status_in: Some(vec![Status::Pending, Status::PendingReview]),
        };

        store
            .write(&TableScope::topics(), "a", &record, &read)
            .await
            .unwrap();
        assert_eq!(
            store.write(&TableScope::topics(), "a", &record, &read).await,
            Err(RemoteError::Conflict("a".into()))
        );
        assert_eq!(store.get("a").await.unwrap().updated_at, at(5));
    }

    #[tokio::test]
    async fn test_unknown_scope() {
        let store = MemoryStore::new(TableScope::topics());
        let err = store
            .query(&TableScope::new("metrics"), &FilterSpec::default().compile())
            .await
            .unwrap_err();
        assert_eq!(err, RemoteError::UnknownTable("metrics".into()));
        assert!(store
            .subscribe_changes(&TableScope::new("metrics"))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disconnect_reaches_subscribers() {
        let store = MemoryStore::new(TableScope::topics());
        let mut feed = store.subscribe_changes(&TableScope::topics()).await.unwrap();
        store.disconnect_feeds("maintenance");
        assert!(matches!(
            feed.next().await,
            Some(Err(FeedError::Disconnected(_)))
        ));
    }
}
