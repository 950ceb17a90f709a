//! Canonical in-memory view of the topics selected by the active filter.
//!
//! The reconciler is a plain state machine. It never awaits: the async
//! driver in [`super::TopicSync`] hands it fetch results and feed events one
//! at a time, in delivery order.
//!
//! ```text
//! Uninitialized → Loading → Live ⇄ Loading
//!                            ↓  ↑ (reload)
//!                         Degraded
//! any → Closed
//! ```

use std::collections::{HashMap, HashSet, VecDeque};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::store::{FeedError, RemoteError};
use crate::topics::types::{ChangeEvent, Topic, TopicId};
use crate::topics::FilterSpec;

use super::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViewState {
    Uninitialized,
    Loading,
    Live,
    /// Feed lost: the last view is still served but may be stale.
    Degraded,
    Closed,
}

/// Proof of a started load. Only the most recently issued ticket commits.
#[derive(Debug, Clone)]
pub struct LoadTicket {
    generation: u64,
    filter: FilterSpec,
}

impl LoadTicket {
    pub fn filter(&self) -> &FilterSpec {
        &self.filter
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadOutcome {
    Committed { topics: usize, replayed: usize },
    /// A newer load was started before this one resolved.
    Discarded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Skip {
    /// Not newer than the version already seen for this id.
    Stale,
    /// Id was deleted; ids are never reused.
    Deleted,
    /// Payload is outside the active filter and was not in view.
    OutOfScope,
    /// Delete for an id that is not in view.
    Absent,
    /// No baseline has been loaded yet.
    NoBaseline,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Inserted,
    Replaced,
    Removed,
    /// Held until the in-flight load establishes a baseline.
    Buffered,
    Skipped(Skip),
}

/// Ids remembered per kind (tombstones, watermarks of ids out of view)
/// before the oldest are forgotten.
pub const DEFAULT_RETAIN_LIMIT: usize = 4096;

impl Applied {
    pub fn changed_view(&self) -> bool {
        matches!(self, Applied::Inserted | Applied::Replaced | Applied::Removed)
    }
}

pub struct Reconciler {
    state: ViewState,
    active: Option<FilterSpec>,
    generation: u64,
    /// Ordered by `created_at`, newest first.
    topics: Vec<Topic>,
    /// Highest `updated_at` seen per id, including ids that left the view.
    watermarks: HashMap<TopicId, DateTime<Utc>>,
    /// Ids with a watermark but no row in view, oldest first.
    departed: VecDeque<TopicId>,
    tombstones: HashSet<TopicId>,
    tombstone_order: VecDeque<TopicId>,
    retain_limit: usize,
    buffered: Vec<ChangeEvent>,
    last_error: Option<String>,
}

impl Default for Reconciler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reconciler {
    pub fn new() -> Self {
        Self::with_retain_limit(DEFAULT_RETAIN_LIMIT)
    }

    /// Bounds the tombstones and out-of-view watermarks kept for stale-event
    /// checks. Past the limit the oldest entries are forgotten.
    pub fn with_retain_limit(retain_limit: usize) -> Self {
        Self {
            state: ViewState::Uninitialized,
            active: None,
            generation: 0,
            topics: Vec::new(),
            watermarks: HashMap::new(),
            departed: VecDeque::new(),
            tombstones: HashSet::new(),
            tombstone_order: VecDeque::new(),
            retain_limit: retain_limit.max(1),
            buffered: Vec::new(),
            last_error: None,
        }
    }

    pub fn state(&self) -> ViewState {
        self.state
    }

    /// Filter the current view was built for.
    pub fn active_filter(&self) -> Option<&FilterSpec> {
        self.active.as_ref()
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// True while the view may lag the remote store.
    pub fn is_stale(&self) -> bool {
        matches!(self.state, ViewState::Degraded | ViewState::Loading)
    }

    /// Current ordered view. Read-only.
    pub fn snapshot(&self) -> &[Topic] {
        &self.topics
    }

    pub fn get(&self, id: &str) -> Option<&Topic> {
        self.topics.iter().find(|t| t.id == id)
    }

    fn position(&self, id: &str) -> Option<usize> {
        self.topics.iter().position(|t| t.id == id)
    }

    fn ensure_open(&self) -> Result<(), SyncError> {
        if self.state == ViewState::Closed {
            Err(SyncError::Closed)
        } else {
            Ok(())
        }
    }

    /// Starts a load for `filter`, superseding any load still in flight.
    /// Events arriving until the matching commit are buffered.
    pub fn begin_load(&mut self, filter: FilterSpec) -> Result<LoadTicket, SyncError> {
        self.ensure_open()?;
        self.generation += 1;
        if !self.buffered.is_empty() {
            debug!(dropped = self.buffered.len(), "superseded load, keeping buffered events");
        }
        self.state = ViewState::Loading;
        debug!(generation = self.generation, "load started");
        Ok(LoadTicket {
            generation: self.generation,
            filter,
        })
    }

    /// Resolves a load. Results for superseded tickets are discarded.
    ///
    /// On failure the previous view and filter stay in place and the error
    /// is returned after buffered events are applied to that view.
    pub fn commit_load(
        &mut self,
        ticket: LoadTicket,
        result: Result<Vec<Topic>, RemoteError>,
    ) -> Result<LoadOutcome, SyncError> {
        if self.state == ViewState::Closed || ticket.generation != self.generation {
            debug!(
                generation = ticket.generation,
                current = self.generation,
                "stale load result discarded"
            );
            return Ok(LoadOutcome::Discarded);
        }

        let buffered = std::mem::take(&mut self.buffered);
        match result {
            Ok(rows) => {
                self.install_baseline(ticket.filter, rows);
                self.state = ViewState::Live;
                self.last_error = None;
                let replayed = buffered.len();
                for event in buffered {
                    self.merge(event);
                }
                info!(
                    topics = self.topics.len(),
                    replayed,
                    generation = ticket.generation,
                    "view loaded"
                );
                Ok(LoadOutcome::Committed {
                    topics: self.topics.len(),
                    replayed,
                })
            }
            Err(err) => {
                warn!(error = %err, "load failed, keeping previous view");
                self.last_error = Some(err.to_string());
                if self.active.is_some() {
                    self.state = ViewState::Live;
                    for event in buffered {
                        self.merge(event);
                    }
                } else {
                    self.state = ViewState::Uninitialized;
                }
                Err(SyncError::Remote(err))
            }
        }
    }

    fn install_baseline(&mut self, filter: FilterSpec, rows: Vec<Topic>) {
        let mut seen: HashMap<TopicId, usize> = HashMap::new();
        let mut topics: Vec<Topic> = Vec::with_capacity(rows.len());
        for row in rows {
            if self.tombstones.contains(&row.id) {
                continue;
            }
            match seen.get(&row.id) {
                Some(&idx) => {
                    if row.updated_at > topics[idx].updated_at {
                        topics[idx] = row;
                    }
                }
                None => {
                    seen.insert(row.id.clone(), topics.len());
                    topics.push(row);
                }
            }
        }
        topics.sort_by(|a, b| b.created_at.cmp(&a.created_at));

        self.watermarks = topics
            .iter()
            .map(|t| (t.id.clone(), t.updated_at))
            .collect();
        self.departed.clear();
        self.topics = topics;
        self.active = Some(filter);
    }

    /// Merges one change event into the view. Idempotent.
    pub fn apply_event(&mut self, event: ChangeEvent) -> Result<Applied, SyncError> {
        match self.state {
            ViewState::Closed => Err(SyncError::Closed),
            ViewState::Loading => {
                self.buffered.push(event);
                Ok(Applied::Buffered)
            }
            ViewState::Uninitialized => Ok(Applied::Skipped(Skip::NoBaseline)),
            ViewState::Live | ViewState::Degraded => Ok(self.merge(event)),
        }
    }

    fn merge(&mut self, event: ChangeEvent) -> Applied {
        let applied = match event {
            ChangeEvent::Deleted(id) => {
                self.watermarks.remove(&id);
                let removed = match self.position(&id) {
                    Some(idx) => {
                        self.topics.remove(idx);
                        Applied::Removed
                    }
                    None => Applied::Skipped(Skip::Absent),
                };
                self.remember_deleted(id);
                removed
            }
            ChangeEvent::Created(topic) | ChangeEvent::Updated(topic) => self.upsert(topic),
        };
        debug!(?applied, "change merged");
        applied
    }

    fn upsert(&mut self, topic: Topic) -> Applied {
        if self.tombstones.contains(&topic.id) {
            return Applied::Skipped(Skip::Deleted);
        }
        if let Some(seen) = self.watermarks.get(&topic.id) {
            if topic.updated_at <= *seen {
                return Applied::Skipped(Skip::Stale);
            }
        }
        self.watermarks.insert(topic.id.clone(), topic.updated_at);

        let in_scope = self.active.as_ref().is_some_and(|f| f.matches(&topic));
        match (self.position(&topic.id), in_scope) {
            (Some(idx), true) => {
                // created_at is immutable, so the slot is still correct.
                self.topics[idx] = topic;
                Applied::Replaced
            }
            (Some(idx), false) => {
                self.topics.remove(idx);
                self.remember_departed(topic.id);
                Applied::Removed
            }
            (None, true) => {
                let idx = self
                    .topics
                    .partition_point(|t| t.created_at >= topic.created_at);
                self.topics.insert(idx, topic);
                Applied::Inserted
            }
            (None, false) => {
                self.remember_departed(topic.id);
                Applied::Skipped(Skip::OutOfScope)
            }
        }
    }

    fn remember_departed(&mut self, id: TopicId) {
        self.departed.retain(|d| *d != id);
        self.departed.push_back(id);
        while self.departed.len() > self.retain_limit {
            let Some(oldest) = self.departed.pop_front() else {
                break;
            };
            if self.position(&oldest).is_none() {
                self.watermarks.remove(&oldest);
            }
        }
    }

    fn remember_deleted(&mut self, id: TopicId) {
        self.departed.retain(|d| *d != id);
        if !self.tombstones.insert(id.clone()) {
            return;
        }
        self.tombstone_order.push_back(id);
        while self.tombstone_order.len() > self.retain_limit {
            if let Some(oldest) = self.tombstone_order.pop_front() {
                debug!(id = %oldest, "forgetting oldest tombstone");
                self.tombstones.remove(&oldest);
            }
        }
    }

    /// Tombstones and watermarks currently held.
    pub fn retained(&self) -> (usize, usize) {
        (self.tombstones.len(), self.watermarks.len())
    }

    /// Feed dropped: keep serving the last view, flagged stale.
    pub fn feed_failed(&mut self, err: &FeedError) {
        if self.state == ViewState::Closed {
            return;
        }
        warn!(error = %err, "change feed failed, view degraded");
        self.last_error = Some(err.to_string());
        if self.state == ViewState::Live {
            self.state = ViewState::Degraded;
        }
    }

    /// Terminal. Safe to call more than once.
    pub fn close(&mut self) {
        if self.state != ViewState::Closed {
            info!("view closed");
        }
        self.state = ViewState::Closed;
        self.buffered.clear();
    }
}
