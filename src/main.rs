use anyhow::Result;
use piecemeal::tracker::HttpTracker;
use piecemeal::{Config, Source, SwarmConfig, TorrentManager};
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

const STATUS_LOG_INTERVAL_SECS: u64 = 5;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = Config::new();
    let source = Source::from_config(&config)?;

    let handle = TorrentManager::start(
        source,
        SwarmConfig::from(&config),
        Arc::new(HttpTracker::new()),
    )
    .await?;

    let mut status_log = interval(Duration::from_secs(STATUS_LOG_INTERVAL_SECS));
    let mut status = handle.subscribe();

    loop {
        tokio::select! {
            _ = status_log.tick() => info!("{}", handle.status()),
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                if let Some(e) = &current.error {
                    error!(%e, "torrent failed");
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
        }
    }

    handle.shutdown().await;

    Ok(())
}
