//! Filter specification and its two compiled forms: a backend-neutral
//! remote query description and a local predicate over [`Topic`].
//!
//! Both forms must select exactly the same topics, because live change
//! events are filtered locally without asking the remote store.

use std::cmp::Ordering;

use chrono::{DateTime, SecondsFormat, Utc};

use super::types::{FirstMover, Momentum, Status, Topic, Verdict};

/// Inclusive numeric bounds. An unset bound is open.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Range {
    pub min: Option<f64>,
    pub max: Option<f64>,
}

impl Range {
    pub fn between(min: f64, max: f64) -> Self {
        Self {
            min: Some(min),
            max: Some(max),
        }
    }

    fn contains(&self, value: f64) -> bool {
        self.min.map_or(true, |min| value >= min) && self.max.map_or(true, |max| value <= max)
    }
}

/// Declarative topic filter. Unset fields impose no constraint.
///
/// An empty set for a set-valued field is treated exactly like an unset
/// field ("no filter"), not as "match nothing".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FilterSpec {
    pub status: Option<Vec<Status>>,
    pub momentum: Option<Vec<Momentum>>,
    pub technical_depth: Range,
    pub viral_potential: Range,
    /// Case-insensitive substring over title and summary.
    pub search: Option<String>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
    pub verdict: Option<Vec<Verdict>>,
    pub min_goldmine_score: Option<f64>,
    pub first_mover: Option<bool>,
}

fn non_empty<T>(set: &Option<Vec<T>>) -> Option<&[T]> {
    set.as_deref().filter(|s| !s.is_empty())
}

impl FilterSpec {
    pub fn with_status(statuses: &[Status]) -> Self {
        Self {
            status: Some(statuses.to_vec()),
            ..Self::default()
        }
    }

    /// Search term as matched on both sides. `*` is the remote wildcard
    /// character and is dropped so it cannot widen the remote match.
    pub fn search_needle(&self) -> Option<String> {
        let needle: String = self.search.as_deref()?.chars().filter(|c| *c != '*').collect();
        if needle.is_empty() {
            None
        } else {
            Some(needle)
        }
    }

    /// Local predicate, evaluated against change-feed payloads.
    pub fn matches(&self, topic: &Topic) -> bool {
        if let Some(statuses) = non_empty(&self.status) {
            if !statuses.contains(&topic.status) {
                return false;
            }
        }
        if let Some(momentum) = non_empty(&self.momentum) {
            if !momentum.contains(&topic.momentum) {
                return false;
            }
        }
        if !self.technical_depth.contains(topic.technical_depth)
            || !self.viral_potential.contains(topic.viral_potential)
        {
            return false;
        }
        if let Some(needle) = self.search_needle() {
            let needle = needle.to_lowercase();
            if !topic.title.to_lowercase().contains(&needle)
                && !topic.summary.to_lowercase().contains(&needle)
            {
                return false;
            }
        }
        if self.created_from.is_some_and(|from| topic.created_at < from)
            || self.created_to.is_some_and(|to| topic.created_at > to)
        {
            return false;
        }
        if let Some(verdicts) = non_empty(&self.verdict) {
            match topic.verdict {
                Some(v) if verdicts.contains(&v) => {}
                _ => return false,
            }
        }
        if let Some(min) = self.min_goldmine_score {
            if !topic.content_goldmine_score.is_some_and(|s| s >= min) {
                return false;
            }
        }
        if let Some(wanted) = self.first_mover {
            let expected = if wanted { FirstMover::Yes } else { FirstMover::No };
            if topic.first_mover_advantage != Some(expected) {
                return false;
            }
        }
        true
    }

    /// Remote query description, newest first.
    pub fn compile(&self) -> RemoteQuery {
        let mut constraints = Vec::new();

        if let Some(statuses) = non_empty(&self.status) {
            constraints.push(Constraint::In(
                Column::Status,
                statuses.iter().map(|s| Operand::text(s.as_str())).collect(),
            ));
        }
        if let Some(momentum) = non_empty(&self.momentum) {
            constraints.push(Constraint::In(
                Column::Momentum,
                momentum.iter().map(|m| Operand::text(m.as_str())).collect(),
            ));
        }
        push_range(&mut constraints, Column::TechnicalDepth, self.technical_depth);
        push_range(&mut constraints, Column::ViralPotential, self.viral_potential);
        if let Some(needle) = self.search_needle() {
            constraints.push(Constraint::Contains {
                columns: vec![Column::Title, Column::Summary],
                needle,
            });
        }
        if let Some(from) = self.created_from {
            constraints.push(Constraint::Gte(Column::CreatedAt, Operand::Time(from)));
        }
        if let Some(to) = self.created_to {
            constraints.push(Constraint::Lte(Column::CreatedAt, Operand::Time(to)));
        }
        if let Some(verdicts) = non_empty(&self.verdict) {
            constraints.push(Constraint::In(
                Column::Verdict,
                verdicts.iter().map(|v| Operand::text(v.as_str())).collect(),
            ));
        }
        if let Some(min) = self.min_goldmine_score {
            constraints.push(Constraint::Gte(
                Column::ContentGoldmineScore,
                Operand::Number(min),
            ));
        }
        if let Some(wanted) = self.first_mover {
            let value = if wanted { FirstMover::Yes } else { FirstMover::No };
            constraints.push(Constraint::Eq(
                Column::FirstMoverAdvantage,
                Operand::text(value.as_str()),
            ));
        }

        RemoteQuery {
            constraints,
            order: OrderBy::newest_first(),
        }
    }
}

fn push_range(constraints: &mut Vec<Constraint>, column: Column, range: Range) {
    if let Some(min) = range.min {
        constraints.push(Constraint::Gte(column, Operand::Number(min)));
    }
    if let Some(max) = range.max {
        constraints.push(Constraint::Lte(column, Operand::Number(max)));
    }
}

/// Remote columns a query can constrain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Column {
    Id,
    Status,
    Momentum,
    TechnicalDepth,
    ViralPotential,
    Title,
    Summary,
    CreatedAt,
    Verdict,
    ContentGoldmineScore,
    FirstMoverAdvantage,
}

impl Column {
    pub fn name(&self) -> &'static str {
        match self {
            Column::Id => "id",
            Column::Status => "status",
            Column::Momentum => "momentum",
            Column::TechnicalDepth => "technical_depth",
            Column::ViralPotential => "viral_potential",
            Column::Title => "title",
            Column::Summary => "summary",
            Column::CreatedAt => "created_at",
            Column::Verdict => "verdict",
            Column::ContentGoldmineScore => "content_goldmine_score",
            Column::FirstMoverAdvantage => "first_mover_advantage",
        }
    }

    /// Column value of a topic; `None` is SQL NULL.
    fn value(&self, topic: &Topic) -> Option<Operand> {
        match self {
            Column::Id => Some(Operand::text(&topic.id)),
            Column::Status => Some(Operand::text(topic.status.as_str())),
            Column::Momentum => Some(Operand::text(topic.momentum.as_str())),
            Column::TechnicalDepth => Some(Operand::Number(topic.technical_depth)),
            Column::ViralPotential => Some(Operand::Number(topic.viral_potential)),
            Column::Title => Some(Operand::text(&topic.title)),
            Column::Summary => Some(Operand::text(&topic.summary)),
            Column::CreatedAt => Some(Operand::Time(topic.created_at)),
            Column::Verdict => topic.verdict.map(|v| Operand::text(v.as_str())),
            Column::ContentGoldmineScore => topic.content_goldmine_score.map(Operand::Number),
            Column::FirstMoverAdvantage => topic
                .first_mover_advantage
                .map(|f| Operand::text(f.as_str())),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Text(String),
    Number(f64),
    Time(DateTime<Utc>),
}

impl Operand {
    pub fn text(s: impl Into<String>) -> Self {
        Operand::Text(s.into())
    }

    /// Wire rendering used in query strings.
    pub fn render(&self) -> String {
        match self {
            Operand::Text(s) => s.clone(),
            Operand::Number(n) => n.to_string(),
            Operand::Time(t) => t.to_rfc3339_opts(SecondsFormat::Micros, true),
        }
    }

    fn compare(&self, other: &Operand) -> Option<Ordering> {
        match (self, other) {
            (Operand::Text(a), Operand::Text(b)) => Some(a.cmp(b)),
            (Operand::Number(a), Operand::Number(b)) => a.partial_cmp(b),
            (Operand::Time(a), Operand::Time(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

/// One field-level constraint. All constraints of a query are ANDed.
#[derive(Debug, Clone, PartialEq)]
pub enum Constraint {
    Eq(Column, Operand),
    In(Column, Vec<Operand>),
    Gte(Column, Operand),
    Lte(Column, Operand),
    /// Case-insensitive substring match on any of the columns.
    Contains { columns: Vec<Column>, needle: String },
}

impl Constraint {
    fn holds(&self, topic: &Topic) -> bool {
        match self {
            Constraint::Eq(col, want) => col.value(topic).is_some_and(|v| v == *want),
            Constraint::In(col, set) => col.value(topic).is_some_and(|v| set.contains(&v)),
            Constraint::Gte(col, bound) => col
                .value(topic)
                .and_then(|v| v.compare(bound))
                .is_some_and(|o| o != Ordering::Less),
            Constraint::Lte(col, bound) => col
                .value(topic)
                .and_then(|v| v.compare(bound))
                .is_some_and(|o| o != Ordering::Greater),
            Constraint::Contains { columns, needle } => {
                let needle = needle.to_lowercase();
                columns.iter().any(|col| match col.value(topic) {
                    Some(Operand::Text(s)) => s.to_lowercase().contains(&needle),
                    _ => false,
                })
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OrderBy {
    pub column: Column,
    pub descending: bool,
}

impl OrderBy {
    pub fn newest_first() -> Self {
        Self {
            column: Column::CreatedAt,
            descending: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteQuery {
    pub constraints: Vec<Constraint>,
    pub order: OrderBy,
}

impl RemoteQuery {
    /// Single-record lookup by identifier.
    pub fn by_id(id: &str) -> Self {
        Self {
            constraints: vec![Constraint::Eq(Column::Id, Operand::text(id))],
            order: OrderBy::newest_first(),
        }
    }

    /// Evaluates the query against one record the way the remote store would.
    pub fn evaluate(&self, topic: &Topic) -> bool {
        self.constraints.iter().all(|c| c.holds(topic))
    }
}
