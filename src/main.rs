mod commands;
mod gate;
mod state;
mod stats;
mod store;
mod sync;
mod topics;

use std::str::FromStr;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::RwLock;
use tracing::{error, info, Level};

use commands::Command;
use state::{AppState, ReviewConfig};
use store::{memory, MemoryStore, PostgrestStore, RemoteStore, TableScope};
use sync::gateway::QueryGateway;
use sync::{Notice, TopicSync};
use topics::types::Status;
use topics::FilterSpec;

#[tokio::main]
async fn main() -> Result<()> {
    // Load env
    let _ = dotenv::dotenv();

    let level = dotenv::var("LOG_LEVEL")
        .ok()
        .and_then(|l| Level::from_str(&l).ok())
        .unwrap_or(Level::INFO);
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();

    let scope = dotenv::var("TOPICS_TABLE")
        .map(TableScope::new)
        .unwrap_or_default();

    let store: Arc<dyn RemoteStore> = match PostgrestStore::from_env()? {
        Some(remote) => {
            info!(table = %scope, "Using PostgREST topic store");
            Arc::new(remote)
        }
        None => {
            info!("SUPABASE_URL not set, using in-memory topic store with sample data");
            Arc::new(MemoryStore::with_topics(
                scope.clone(),
                memory::sample_topics(Utc::now()),
            ))
        }
    };

    let config = Arc::new(RwLock::new(ReviewConfig::from_env()?));
    let sync = Arc::new(TopicSync::new(QueryGateway::new(store, scope), config.clone()));
    let app_state = AppState { sync, config };

    // Toasts go to the log so they interleave with console output.
    let mut notices = app_state.sync.notices();
    tokio::spawn(async move {
        while let Ok(notice) = notices.recv().await {
            match notice {
                Notice::Info(msg) => info!("{}", msg),
                Notice::Error(err) => error!("{}", err),
            }
        }
    });

    match app_state
        .sync
        .load(FilterSpec::with_status(&[Status::Pending]))
        .await
    {
        Ok(outcome) => info!(?outcome, "Initial pending view loaded"),
        Err(e) => error!("Initial load failed: {}", e),
    }

    println!("{}", commands::HELP);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        let command = match Command::parse(&line) {
            Ok(command) => command,
            Err(e) => {
                println!("{}", e);
                continue;
            }
        };
        if command == Command::Quit {
            break;
        }
        match commands::dispatch(&app_state, command).await {
            Ok(output) => println!("{}", output),
            Err(e) => println!("Error: {:#}", e),
        }
    }

    app_state.sync.close().await;
    info!("Topic desk closed");
    Ok(())
}
