use std::fmt::Write as _;

use anyhow::Result;

use crate::state::AppState;
use crate::stats;
use crate::sync::reconciler::{LoadOutcome, ViewState};
use crate::topics::types::Topic;
use crate::topics::FilterSpec;

fn line(topic: &Topic) -> String {
    format!(
        "{:<10} [{}] {:<9} depth {:.0} viral {:.0}  {}",
        topic.id,
        topic.status,
        topic.momentum.as_str(),
        topic.technical_depth,
        topic.viral_potential,
        topic.title
    )
}

fn outcome_text(outcome: LoadOutcome) -> String {
    match outcome {
        LoadOutcome::Committed { topics, replayed } if replayed > 0 => {
            format!("{} topics loaded ({} live updates applied)", topics, replayed)
        }
        LoadOutcome::Committed { topics, .. } => format!("{} topics loaded", topics),
        LoadOutcome::Discarded => "superseded by a newer load".to_string(),
    }
}

pub async fn list(state: &AppState) -> Result<String> {
    let topics = state.sync.current_view().await;
    let mut output = String::new();
    match state.sync.view_state().await {
        ViewState::Degraded => output.push_str("(live updates lost; `refresh` to resync)\n"),
        ViewState::Loading => output.push_str("(loading)\n"),
        _ => {}
    }
    if topics.is_empty() {
        output.push_str("No topics match the current filter.");
        return Ok(output);
    }
    for topic in &topics {
        output.push_str(&line(topic));
        output.push('\n');
    }
    let _ = write!(output, "{} topics", topics.len());
    Ok(output)
}

pub async fn show(state: &AppState, id: &str) -> Result<String> {
    let topics = state.sync.current_view().await;
    let Some(topic) = topics.iter().find(|t| t.id == id) else {
        anyhow::bail!("`{}` is not in the current view", id);
    };

    let mut out = line(topic);
    let _ = write!(out, "\n\n{}\n", topic.summary);
    if !topic.content_hook.is_empty() {
        let _ = writeln!(out, "Hook: {}", topic.content_hook);
    }
    if let Some(verdict) = topic.verdict {
        let _ = writeln!(
            out,
            "Verdict: {}  goldmine {}  angle: {}",
            verdict.as_str(),
            topic
                .content_goldmine_score
                .map(|s| s.to_string())
                .unwrap_or_else(|| "-".into()),
            topic.angle.as_deref().unwrap_or("-")
        );
    }
    let _ = writeln!(
        out,
        "Commentary ({} chars): {}",
        topic.commentary_len(),
        topic.commentary.as_deref().unwrap_or("")
    );
    if !topic.hashtags.is_empty() {
        let _ = writeln!(out, "Hashtags: #{}", topic.hashtags.join(" #"));
    }
    let _ = write!(out, "Created {}  updated {}", topic.created_at, topic.updated_at);
    if let Some(at) = topic.approved_at {
        let _ = write!(out, "  approved {}", at);
    }
    Ok(out)
}

pub async fn filter(state: &AppState, spec: FilterSpec) -> Result<String> {
    let outcome = state.sync.load(spec).await?;
    Ok(outcome_text(outcome))
}

pub async fn refresh(state: &AppState) -> Result<String> {
    let outcome = state.sync.refetch().await?;
    Ok(outcome_text(outcome))
}

pub async fn stats(state: &AppState) -> Result<String> {
    // Over the whole table, not just the filtered view.
    let s = stats::stats(&state.sync.all_topics().await?);
    Ok(format!(
        "Topics: {} (pending {}, approved {}, archived {})\n\
         Approval rate: {:.1}%  Avg review: {:.1}h\n\
         Momentum: breaking {} peaking {} critical {} emerging {}\n\
         Avg depth {:.1}  avg viral {:.1}",
        s.total,
        s.pending,
        s.approved,
        s.archived,
        s.approval_rate,
        s.average_review_hours,
        s.momentum.breaking,
        s.momentum.peaking,
        s.momentum.critical,
        s.momentum.emerging,
        s.technical_depth_average,
        s.viral_potential_average
    ))
}

pub async fn briefing(state: &AppState) -> Result<String> {
    let threshold = state.config.read().await.high_priority_threshold;
    let b = stats::briefing(&state.sync.all_topics().await?, threshold);

    let mut out = format!(
        "{} pending, {} breaking, {} high priority",
        b.pending.len(),
        b.breaking.len(),
        b.high_priority.len()
    );
    for topic in &b.breaking {
        let _ = write!(out, "\n  BREAKING  {}", line(topic));
    }
    for topic in b.high_priority.iter().filter(|t| !b.breaking.contains(t)) {
        let _ = write!(out, "\n  PRIORITY  {}", line(topic));
    }
    Ok(out)
}
