use std::sync::Arc;

use tracing::debug;

use crate::store::{FeedError, RemoteError, RemoteStore, TableScope};
use crate::topics::types::{Topic, TopicPatch};
use crate::topics::{FilterSpec, RemoteQuery};

use super::feed::ChangeFeed;

/// Read, write and subscribe paths against one remote table.
#[derive(Clone)]
pub struct QueryGateway {
    store: Arc<dyn RemoteStore>,
    scope: TableScope,
}

impl QueryGateway {
    pub fn new(store: Arc<dyn RemoteStore>, scope: TableScope) -> Self {
        Self { store, scope }
    }

    pub fn scope(&self) -> &TableScope {
        &self.scope
    }

    /// Topics matching `filter`, newest first. No retries.
    pub async fn fetch(&self, filter: &FilterSpec) -> Result<Vec<Topic>, RemoteError> {
        let query = filter.compile();
        let mut topics = self.store.query(&self.scope, &query).await?;
        // Stable: backends that already order by created_at keep their tie order.
        topics.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        debug!(
            table = %self.scope,
            constraints = query.constraints.len(),
            rows = topics.len(),
            "fetch complete"
        );
        Ok(topics)
    }

    pub async fn fetch_one(&self, id: &str) -> Result<Topic, RemoteError> {
        self.store
            .query(&self.scope, &RemoteQuery::by_id(id))
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| RemoteError::NotFound(id.to_string()))
    }

    /// Conditional write; the patch's precondition is checked by the store.
    pub async fn write(&self, id: &str, patch: TopicPatch) -> Result<(), RemoteError> {
        let precondition = patch.precondition.clone();
        let record = patch.into_record();
        debug!(table = %self.scope, topic_id = id, fields = record.len(), "writing topic");
        self.store
            .write(&self.scope, id, &record, &precondition)
            .await
    }

    /// Every topic in the table, newest first.
    pub async fn fetch_all(&self) -> Result<Vec<Topic>, RemoteError> {
        self.fetch(&FilterSpec::default()).await
    }

    pub async fn subscribe(&self) -> Result<ChangeFeed, FeedError> {
        ChangeFeed::subscribe(self.store.as_ref(), &self.scope).await
    }
}
