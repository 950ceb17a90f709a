use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable topic identifier assigned by the remote store. Never reused.
pub type TopicId = String;

/// Partial record sent to the remote store on writes.
pub type PartialRecord = serde_json::Map<String, serde_json::Value>;

/// Columns the remote store owns once a record exists.
pub const IMMUTABLE_FIELDS: &[&str] = &["id", "created_at"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Momentum {
    Breaking,
    Peaking,
    Critical,
    Emerging,
}

impl Momentum {
    pub const ALL: [Momentum; 4] = [
        Momentum::Breaking,
        Momentum::Peaking,
        Momentum::Critical,
        Momentum::Emerging,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Momentum::Breaking => "breaking",
            Momentum::Peaking => "peaking",
            Momentum::Critical => "critical",
            Momentum::Emerging => "emerging",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|m| m.as_str() == s)
    }
}

/// Lifecycle status of a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    PendingReview,
    Approved,
    InProduction,
    Published,
    Rejected,
    Archived,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Pending,
        Status::PendingReview,
        Status::Approved,
        Status::InProduction,
        Status::Published,
        Status::Rejected,
        Status::Archived,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Pending => "pending",
            Status::PendingReview => "pending_review",
            Status::Approved => "approved",
            Status::InProduction => "in_production",
            Status::Published => "published",
            Status::Rejected => "rejected",
            Status::Archived => "archived",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|st| st.as_str() == s)
    }

    /// Awaiting a reviewer decision.
    pub fn is_reviewable(&self) -> bool {
        matches!(self, Status::Pending | Status::PendingReview)
    }

    /// No transition leads out of a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Status::Archived | Status::Published)
    }

    /// Legal lifecycle moves. Self-transitions are never legal.
    pub fn can_transition_to(&self, next: Status) -> bool {
        if self.is_terminal() || *self == next {
            return false;
        }
        match next {
            Status::Archived | Status::Rejected => true,
            Status::Approved => self.is_reviewable(),
            Status::InProduction => *self == Status::Pending,
            Status::Published => *self == Status::InProduction,
            Status::Pending | Status::PendingReview => false,
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Display for Momentum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Strategic verdict attached by the upstream analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Verdict {
    Go,
    Pass,
    Pivot,
}

impl Verdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Verdict::Go => "GO",
            Verdict::Pass => "PASS",
            Verdict::Pivot => "PIVOT",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "GO" => Some(Verdict::Go),
            "PASS" => Some(Verdict::Pass),
            "PIVOT" => Some(Verdict::Pivot),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FirstMover {
    Yes,
    No,
}

impl FirstMover {
    pub fn as_str(&self) -> &'static str {
        match self {
            FirstMover::Yes => "yes",
            FirstMover::No => "no",
        }
    }
}

/// Suggested post copy per platform.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlatformSuggestions {
    #[serde(default)]
    pub instagram: Vec<String>,
    #[serde(default)]
    pub twitter: Vec<String>,
    #[serde(default)]
    pub youtube: Vec<String>,
}

/// A reviewable content idea as stored in the `topics` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Topic {
    pub id: TopicId,
    pub title: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub relevance: String,
    #[serde(default)]
    pub content_hook: String,
    pub momentum: Momentum,
    pub technical_depth: f64,
    pub viral_potential: f64,
    pub status: Status,
    /// Reviewer commentary; null until the first draft save.
    #[serde(default, rename = "my_commentary", alias = "commentary")]
    pub commentary: Option<String>,
    #[serde(default)]
    pub platform_suggestions: PlatformSuggestions,
    /// Kept in reviewer order; duplicates are preserved.
    #[serde(default)]
    pub hashtags: Vec<String>,

    // Strategic analysis, present only for topics that went through it.
    #[serde(default)]
    pub verdict: Option<Verdict>,
    #[serde(default)]
    pub angle: Option<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub content_goldmine_score: Option<f64>,
    #[serde(default)]
    pub urgency_score: Option<f64>,
    #[serde(default)]
    pub content_potential_score: Option<f64>,
    #[serde(default)]
    pub first_mover_advantage: Option<FirstMover>,

    #[serde(rename = "perplexity_generated_at")]
    pub generated_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub approved_at: Option<DateTime<Utc>>,
}

impl Topic {
    /// Length of the stored commentary in characters (0 when unset).
    pub fn commentary_len(&self) -> usize {
        self.commentary
            .as_deref()
            .map(|c| c.chars().count())
            .unwrap_or(0)
    }
}

/// What the stored row must still look like for a write to apply.
///
/// Checked by the store atomically with the write, so two commands built
/// from the same read cannot both land.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Precondition {
    /// `updated_at` as it was read.
    pub updated_at: Option<DateTime<Utc>>,
    /// Statuses the row may currently be in.
    pub status_in: Option<Vec<Status>>,
}

impl Precondition {
    pub fn is_empty(&self) -> bool {
        self.updated_at.is_none() && self.status_in.is_none()
    }

    pub fn holds(&self, topic: &Topic) -> bool {
        self.updated_at.map_or(true, |at| topic.updated_at == at)
            && self
                .status_in
                .as_ref()
                .map_or(true, |set| set.contains(&topic.status))
    }
}

/// Field-level update built by the lifecycle gate.
///
/// `None` leaves a column untouched. Identity and creation time are not
/// representable here.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TopicPatch {
    pub status: Option<Status>,
    pub commentary: Option<String>,
    pub hashtags: Option<Vec<String>>,
    pub approved_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Not written; guards the write.
    pub precondition: Precondition,
}

impl TopicPatch {
    pub fn into_record(self) -> PartialRecord {
        let mut record = PartialRecord::new();
        if let Some(status) = self.status {
            record.insert("status".into(), status.as_str().into());
        }
        if let Some(commentary) = self.commentary {
            record.insert("my_commentary".into(), commentary.into());
        }
        if let Some(hashtags) = self.hashtags {
            record.insert("hashtags".into(), hashtags.into());
        }
        if let Some(at) = self.approved_at {
            record.insert("approved_at".into(), at.to_rfc3339().into());
        }
        if let Some(at) = self.updated_at {
            record.insert("updated_at".into(), at.to_rfc3339().into());
        }
        record
    }
}

/// One notification from the change feed.
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Created(Topic),
    Updated(Topic),
    Deleted(TopicId),
}

impl ChangeEvent {
    pub fn topic_id(&self) -> &str {
        match self {
            ChangeEvent::Created(t) | ChangeEvent::Updated(t) => &t.id,
            ChangeEvent::Deleted(id) => id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChangeEvent::Created(_) => "created",
            ChangeEvent::Updated(_) => "updated",
            ChangeEvent::Deleted(_) => "deleted",
        }
    }
}


#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_transition_table() {
        assert!(Status::Pending.can_transition_to(Status::Approved));
        assert!(Status::PendingReview.can_transition_to(Status::Approved));
        assert!(Status::Pending.can_transition_to(Status::Archived));
        assert!(Status::Approved.can_transition_to(Status::Archived));
        assert!(Status::Pending.can_transition_to(Status::InProduction));
        assert!(Status::InProduction.can_transition_to(Status::Published));
        assert!(Status::Approved.can_transition_to(Status::Rejected));

        assert!(!Status::Approved.can_transition_to(Status::Approved));
        assert!(!Status::Approved.can_transition_to(Status::Published));
        assert!(!Status::Rejected.can_transition_to(Status::Approved));
        assert!(!Status::Archived.can_transition_to(Status::Rejected));
        assert!(!Status::Published.can_transition_to(Status::Archived));
    }

    #[test]
    fn test_topic_deserializes_remote_row() {
        let row = serde_json::json!({
            "id": "t1",
            "title": "New reasoning model",
            "summary": "s",
            "relevance": "r",
            "content_hook": "h",
            "momentum": "breaking",
            "technical_depth": 4,
            "viral_potential": 5,
            "status": "pending_review",
            "my_commentary": null,
            "hashtags": ["ai", "ai"],
            "verdict": "GO",
            "first_mover_advantage": "yes",
            "perplexity_generated_at": "2025-01-01T00:00:00Z",
            "created_at": "2025-01-01T00:00:00Z",
            "updated_at": "2025-01-01T00:00:00+00:00",
            "approved_at": null
        });
        let topic: Topic = serde_json::from_value(row).unwrap();
        assert_eq!(topic.status, Status::PendingReview);
        assert_eq!(topic.momentum, Momentum::Breaking);
        assert_eq!(topic.hashtags, vec!["ai", "ai"]);
        assert_eq!(topic.verdict, Some(Verdict::Go));
        assert_eq!(topic.first_mover_advantage, Some(FirstMover::Yes));
        assert!(topic.commentary.is_none());
        assert!(topic.platform_suggestions.instagram.is_empty());
    }

    #[test]
    fn test_patch_never_carries_identity() {
        let patch = TopicPatch {
            status: Some(Status::Approved),
            commentary: Some("c".into()),
            hashtags: Some(vec!["x".into()]),
            approved_at: Some(at(5)),
            updated_at: Some(at(5)),
            precondition: Precondition {
                updated_at: Some(at(1)),
                status_in: Some(vec![Status::Pending]),
            },
        };
        let record = patch.into_record();
        assert_eq!(record["status"], "approved");
        assert_eq!(record["my_commentary"], "c");
        for field in IMMUTABLE_FIELDS {
            assert!(!record.contains_key(*field));
        }
        assert_eq!(record.len(), 5);
    }

    #[test]
    fn test_precondition_checks_stamp_and_status() {
        let t = topic("a", 3);
        assert!(Precondition::default().holds(&t));
        let read = Precondition {
            updated_at: Some(at(3)),
            status_in: Some(vec![Status::Pending, Status::PendingReview]),
        };
        assert!(read.holds(&t));

        let mut moved = t.clone();
        moved.updated_at = at(4);
        assert!(!read.holds(&moved));

        let mut approved = t;
        approved.status = Status::Approved;
        assert!(!read.holds(&approved));
    }

    #[test]
    fn test_commentary_len_counts_chars() {
        let mut t = topic("a", 0);
        assert_eq!(t.commentary_len(), 0);
        t.commentary = Some("héllo ".into());
        assert_eq!(t.commentary_len(), 6);
    }
}
