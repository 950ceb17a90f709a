use anyhow::Result;
use tracing::info;

use crate::state::AppState;

/// Show or change review parameters.
pub async fn config(state: &AppState, change: Option<(String, String)>) -> Result<String> {
    match change {
        None => {
            let config = state.config.read().await;
            Ok(format!(
                "Review configuration:\n  min_commentary_len: {}\n  high_priority_threshold: {}",
                config.min_commentary_len, config.high_priority_threshold
            ))
        }
        Some((key, value)) => {
            let rendered = state.config.write().await.set(&key, &value)?;
            info!(param = %key, value = %rendered, "review config changed");
            Ok(format!("`{}` set to {}", key, rendered))
        }
    }
}
