//! Read-only summaries over a set of topics.

use serde::Serialize;

use crate::topics::types::{Momentum, Status, Topic};

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MomentumBreakdown {
    pub breaking: usize,
    pub peaking: usize,
    pub critical: usize,
    pub emerging: usize,
}

impl MomentumBreakdown {
    fn count(&mut self, momentum: Momentum) {
        match momentum {
            Momentum::Breaking => self.breaking += 1,
            Momentum::Peaking => self.peaking += 1,
            Momentum::Critical => self.critical += 1,
            Momentum::Emerging => self.emerging += 1,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DashboardStats {
    pub total: usize,
    pub pending: usize,
    pub approved: usize,
    pub archived: usize,
    /// Hours from creation to approval, over approved topics that have an
    /// approval time.
    pub average_review_hours: f64,
    /// approved / (approved + archived), as a percentage.
    pub approval_rate: f64,
    pub momentum: MomentumBreakdown,
    pub technical_depth_average: f64,
    pub viral_potential_average: f64,
}

fn mean(values: impl Iterator<Item = f64>) -> f64 {
    let (sum, n) = values.fold((0.0, 0usize), |(sum, n), v| (sum + v, n + 1));
    if n == 0 {
        0.0
    } else {
        sum / n as f64
    }
}

pub fn stats(topics: &[Topic]) -> DashboardStats {
    let count = |status: Status| topics.iter().filter(|t| t.status == status).count();
    let approved = count(Status::Approved);
    let archived = count(Status::Archived);

    let mut momentum = MomentumBreakdown::default();
    for topic in topics {
        momentum.count(topic.momentum);
    }

    let review_hours = topics
        .iter()
        .filter(|t| t.status == Status::Approved)
        .filter_map(|t| t.approved_at.map(|at| (at - t.created_at).num_seconds() as f64 / 3600.0));

    let decided = approved + archived;
    DashboardStats {
        total: topics.len(),
        pending: count(Status::Pending),
        approved,
        archived,
        average_review_hours: mean(review_hours),
        approval_rate: if decided == 0 {
            0.0
        } else {
            approved as f64 / decided as f64 * 100.0
        },
        momentum,
        technical_depth_average: mean(topics.iter().map(|t| t.technical_depth)),
        viral_potential_average: mean(topics.iter().map(|t| t.viral_potential)),
    }
}

/// What needs attention today.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Briefing {
    pub pending: Vec<Topic>,
    pub breaking: Vec<Topic>,
    pub high_priority: Vec<Topic>,
}

pub fn briefing(topics: &[Topic], threshold: f64) -> Briefing {
    let pending: Vec<Topic> = topics
        .iter()
        .filter(|t| t.status == Status::Pending)
        .cloned()
        .collect();
    let breaking = pending
        .iter()
        .filter(|t| t.momentum == Momentum::Breaking)
        .cloned()
        .collect();
    let high_priority = pending
        .iter()
        .filter(|t| t.viral_potential >= threshold || t.technical_depth >= threshold)
        .cloned()
        .collect();
    Briefing {
        pending,
        breaking,
        high_priority,
    }
}
