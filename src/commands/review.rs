use anyhow::Result;
use tracing::info;

use crate::state::AppState;

fn submitted(action: &str, id: &str) -> String {
    format!("{} `{}` submitted; the view updates when the change arrives.", action, id)
}

pub async fn draft(state: &AppState, id: &str, commentary: String, hashtags: Vec<String>) -> Result<String> {
    let len = commentary.chars().count();
    state.sync.save_draft(id, commentary, hashtags).await?;
    Ok(format!("Draft saved for `{}` ({} chars).", id, len))
}

pub async fn approve(state: &AppState, id: &str, commentary: String, hashtags: Vec<String>) -> Result<String> {
    info!(topic_id = id, commentary_len = commentary.chars().count(), "approve requested");
    state.sync.approve(id, commentary, hashtags).await?;
    Ok(submitted("Approval of", id))
}

pub async fn quick_approve(state: &AppState, id: &str) -> Result<String> {
    state.sync.quick_approve(id).await?;
    Ok(submitted("Approval of", id))
}

pub async fn archive(state: &AppState, id: &str) -> Result<String> {
    state.sync.archive(id).await?;
    Ok(submitted("Archive of", id))
}

pub async fn reject(state: &AppState, id: &str) -> Result<String> {
    state.sync.reject(id).await?;
    Ok(submitted("Rejection of", id))
}

pub async fn start_production(state: &AppState, id: &str) -> Result<String> {
    state.sync.start_production(id).await?;
    Ok(submitted("Production start for", id))
}

pub async fn publish(state: &AppState, id: &str) -> Result<String> {
    state.sync.publish(id).await?;
    Ok(submitted("Publication of", id))
}
