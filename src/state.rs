use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::RwLock;

use crate::gate::MIN_COMMENTARY_CHARS;
use crate::sync::TopicSync;

/// Review parameters operators can change at runtime.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewConfig {
    pub min_commentary_len: usize,
    /// Viral potential or technical depth at or above this marks a pending
    /// topic as high priority in the briefing.
    pub high_priority_threshold: f64,
}

impl Default for ReviewConfig {
    fn default() -> Self {
        Self {
            min_commentary_len: MIN_COMMENTARY_CHARS,
            high_priority_threshold: 4.0,
        }
    }
}

impl ReviewConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(raw) = dotenv::var("MIN_COMMENTARY_LEN") {
            config.min_commentary_len = raw
                .trim()
                .parse()
                .with_context(|| format!("MIN_COMMENTARY_LEN is not a number: {}", raw))?;
        }
        if let Ok(raw) = dotenv::var("HIGH_PRIORITY_THRESHOLD") {
            config.high_priority_threshold = raw
                .trim()
                .parse()
                .with_context(|| format!("HIGH_PRIORITY_THRESHOLD is not a number: {}", raw))?;
        }
        Ok(config)
    }

    /// Sets one parameter by name, returning the rendered new value.
    pub fn set(&mut self, key: &str, value: &str) -> Result<String> {
        match key {
            "min_commentary_len" => {
                self.min_commentary_len = value
                    .parse()
                    .with_context(|| format!("`{}` is not a whole number", value))?;
                Ok(self.min_commentary_len.to_string())
            }
            "high_priority_threshold" => {
                let threshold: f64 = value
                    .parse()
                    .with_context(|| format!("`{}` is not a number", value))?;
                anyhow::ensure!(
                    (1.0..=5.0).contains(&threshold),
                    "threshold must be between 1 and 5"
                );
                self.high_priority_threshold = threshold;
                Ok(threshold.to_string())
            }
            _ => anyhow::bail!(
                "unknown param `{}`. Valid: `min_commentary_len`, `high_priority_threshold`",
                key
            ),
        }
    }
}

pub struct AppState {
    pub sync: Arc<TopicSync>,
    pub config: Arc<RwLock<ReviewConfig>>,
}
