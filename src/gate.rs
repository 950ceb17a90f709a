//! Lifecycle gate: decides whether a reviewer action is legal and, if so,
//! builds the remote update for it.
//!
//! The gate never touches the local view. Its writes come back through the
//! change feed like any other update.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;
use tracing::debug;

use crate::topics::types::{Precondition, Status, Topic, TopicPatch};

/// Minimum commentary length, in characters, required to approve.
pub const MIN_COMMENTARY_CHARS: usize = 100;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum ValidationError {
    #[error("commentary too short ({len} of {min} characters)")]
    CommentaryTooShort { len: usize, min: usize },
    #[error("cannot move topic from {from} to {to}")]
    IllegalTransition { from: Status, to: Status },
}

/// Stamp for the next write: now, but strictly after the previous stamp so
/// `updated_at` never goes backwards and the echo is never seen as stale.
pub fn next_stamp(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    now.max(previous + Duration::milliseconds(1))
}

#[derive(Debug, Clone, Copy)]
pub struct LifecycleGate {
    min_commentary_len: usize,
}

impl Default for LifecycleGate {
    fn default() -> Self {
        Self::new(MIN_COMMENTARY_CHARS)
    }
}

impl LifecycleGate {
    pub fn new(min_commentary_len: usize) -> Self {
        Self { min_commentary_len }
    }

    /// Raw character count, untrimmed.
    pub fn check_commentary(&self, commentary: &str) -> Result<(), ValidationError> {
        let len = commentary.chars().count();
        if len < self.min_commentary_len {
            debug!(len, min = self.min_commentary_len, "approval rejected: commentary too short");
            return Err(ValidationError::CommentaryTooShort {
                len,
                min: self.min_commentary_len,
            });
        }
        Ok(())
    }

    fn check_transition(&self, current: &Topic, to: Status) -> Result<(), ValidationError> {
        if current.status.can_transition_to(to) {
            Ok(())
        } else {
            debug!(topic_id = %current.id, from = %current.status, %to, "transition rejected");
            Err(ValidationError::IllegalTransition {
                from: current.status,
                to,
            })
        }
    }

    fn status_change(&self, current: &Topic, to: Status, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.check_transition(current, to)?;
        let sources = Status::ALL
            .into_iter()
            .filter(|s| s.can_transition_to(to))
            .collect();
        Ok(TopicPatch {
            status: Some(to),
            updated_at: Some(next_stamp(current.updated_at, now)),
            precondition: Precondition {
                updated_at: Some(current.updated_at),
                status_in: Some(sources),
            },
            ..TopicPatch::default()
        })
    }

    /// Always legal; status is untouched.
    pub fn save_draft(
        &self,
        current: &Topic,
        commentary: String,
        hashtags: Vec<String>,
        now: DateTime<Utc>,
    ) -> TopicPatch {
        TopicPatch {
            commentary: Some(commentary),
            hashtags: Some(hashtags),
            updated_at: Some(next_stamp(current.updated_at, now)),
            precondition: Precondition {
                updated_at: Some(current.updated_at),
                status_in: None,
            },
            ..TopicPatch::default()
        }
    }

    pub fn approve(
        &self,
        current: &Topic,
        commentary: String,
        hashtags: Vec<String>,
        now: DateTime<Utc>,
    ) -> Result<TopicPatch, ValidationError> {
        self.check_commentary(&commentary)?;
        let mut patch = self.status_change(current, Status::Approved, now)?;
        patch.approved_at = patch.updated_at;
        patch.commentary = Some(commentary);
        patch.hashtags = Some(hashtags);
        Ok(patch)
    }

    /// Approve using the commentary already stored on the topic.
    pub fn quick_approve(&self, current: &Topic, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.check_commentary(current.commentary.as_deref().unwrap_or(""))?;
        let mut patch = self.status_change(current, Status::Approved, now)?;
        patch.approved_at = patch.updated_at;
        Ok(patch)
    }

    /// Leaves `approved_at` as it was.
    pub fn archive(&self, current: &Topic, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.status_change(current, Status::Archived, now)
    }

    pub fn reject(&self, current: &Topic, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.status_change(current, Status::Rejected, now)
    }

    pub fn start_production(&self, current: &Topic, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.status_change(current, Status::InProduction, now)
    }

    pub fn publish(&self, current: &Topic, now: DateTime<Utc>) -> Result<TopicPatch, ValidationError> {
        self.status_change(current, Status::Published, now)
    }
}
