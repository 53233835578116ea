pub mod announce;
pub mod response;

pub use announce::{Announce, AnnounceEvent};
pub use response::Response;

use crate::capped_growing_interval::CappedGrowingInterval;
use crate::constants::METADATA_PIECE_SIZE;
use crate::data_structures::ID;
use crate::peers::Peer;
use crate::piece_store::PieceStore;
use crate::shutdown;
use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use bendy::decoding::{Decoder, FromBencode};
use serde::Serialize;
use std::fmt::Debug;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout, Duration};
use tracing::{debug, info, instrument, trace, warn};

const ANNOUNCE_RETRY: usize = 3;
const MAX_SECS_BETWEEN_FAILED_ANNOUNCES: f64 = 300.0;
const STOPPED_ANNOUNCE_TIMEOUT_SECS: u64 = 5;

fn announce_backoff(failures: f64) -> f64 {
    15.0 * 2f64.powf(failures)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum TrackerStatus {
    Pending,
    Ok { peers: usize },
    Failed(String),
    Disabled,
}

/// Where peers come from. Tests swap in a fake.
#[async_trait]
pub trait Tracker: Send + Sync + Debug {
    async fn announce(&self, announce: &Announce) -> Result<Response>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpTracker {
    client: reqwest::Client,
}

impl HttpTracker {
    pub fn new() -> Self {
        Self::default()
    }

    async fn fetch_response(&self, url: &str) -> Result<Response> {
        let response = self.client.get(url).send().await?.error_for_status()?;
        let bytes = response.bytes().await?;

        let mut decoder = Decoder::new(bytes.as_ref());
        let decoder_object = decoder
            .next_object()?
            .ok_or_else(|| anyhow!("response from tracker is empty"))?;
        let tracker_response = Response::decode_bencode_object(decoder_object)?;

        Ok(tracker_response)
    }
}

#[async_trait]
impl Tracker for HttpTracker {
    async fn announce(&self, announce: &Announce) -> Result<Response> {
        let announce_url = announce.as_url();

        let mut tracker_response = self.fetch_response(&announce_url).await;

        for _ in 0..ANNOUNCE_RETRY {
            if tracker_response.is_ok() {
                break;
            }
            tracker_response = self.fetch_response(&announce_url).await;
        }

        trace!(?tracker_response);
        let response = tracker_response?;

        if let Some(reason) = response.failure_reason {
            bail!("tracker refused: {}", reason);
        }

        Ok(response)
    }
}

/// What every announce of one torrent shares.
#[derive(Debug, Clone)]
pub struct AnnounceContext {
    pub tracker: Arc<dyn Tracker>,
    pub info_hash: ID,
    pub peer_id: ID,
    pub port: u16,
    pub store: PieceStore,
    pub peers: mpsc::Sender<Vec<Peer>>,
    pub status: Arc<watch::Sender<TrackerStatus>>,
    pub completed: watch::Receiver<bool>,
    pub shutdown: shutdown::Receiver,
}

impl AnnounceContext {
    fn refresh(&self, announce: &mut Announce) {
        match self.store.progress() {
            Some(progress) => {
                announce.uploaded = progress.uploaded;
                announce.downloaded = progress.downloaded;
                announce.left = progress.left;
            }
            // size unknown until the metadata arrives
            None => announce.left = METADATA_PIECE_SIZE as u64,
        }
    }
}

/// One announce worker per HTTP(S) tracker url.
pub fn spawn_announcers(urls: &[String], ctx: AnnounceContext) {
    let urls: Vec<&String> = urls
        .iter()
        .filter(|url| url.starts_with("http://") || url.starts_with("https://"))
        .collect();

    if urls.is_empty() {
        ctx.status.send_replace(TrackerStatus::Disabled);
        return;
    }

    let ip = local_ip_address::local_ip().ok();

    for url in urls {
        let announce = Announce {
            tracker_url: url.clone(),
            info_hash: ctx.info_hash,
            peer_id: ctx.peer_id,
            ip,
            port: ctx.port,
            uploaded: 0,
            downloaded: 0,
            left: 0,
            compact: true,
            no_peer_id: true,
            event: Some(AnnounceEvent::Started),
            tracker_id: None,
        };
        let ctx = ctx.clone();

        tokio::spawn(async move { manage_tracker(announce, ctx).await });
    }
}

#[instrument(skip_all, fields(tracker = %announce.tracker_url))]
async fn manage_tracker(mut announce: Announce, mut ctx: AnnounceContext) {
    let mut backoff = CappedGrowingInterval::new(MAX_SECS_BETWEEN_FAILED_ANNOUNCES, announce_backoff);
    let mut completed_reported = *ctx.completed.borrow();

    loop {
        ctx.refresh(&mut announce);

        let wait = match ctx.tracker.announce(&announce).await {
            Ok(response) => {
                if let Some(warning) = &response.warning_message {
                    warn!(%warning, "tracker warning");
                }
                if response.tracker_id.is_some() {
                    announce.tracker_id = response.tracker_id.clone();
                }

                info!(
                    peers = response.peers.len(),
                    interval = response.interval,
                    seeders = ?response.complete,
                    leechers = ?response.incomplete,
                    "announced"
                );

                ctx.status.send_replace(TrackerStatus::Ok {
                    peers: response.peers.len(),
                });
                if ctx.peers.send(response.peers).await.is_err() {
                    return;
                }

                announce.event = None;
                backoff.reset();

                let secs = std::cmp::max(response.interval, response.min_interval.unwrap_or(0));
                Duration::from_secs(std::cmp::max(secs, 1))
            }
            Err(e) => {
                warn!(%e, "announce failed");
                ctx.status.send_replace(TrackerStatus::Failed(e.to_string()));
                backoff.next_delay()
            }
        };

        tokio::select! {
            _ = sleep(wait) => (),
            changed = ctx.completed.changed() => {
                if changed.is_err() {
                    return;
                }
                if *ctx.completed.borrow() && !completed_reported {
                    completed_reported = true;
                    announce.event = Some(AnnounceEvent::Completed);
                }
            }
            _ = ctx.shutdown.recv() => {
                announce.event = Some(AnnounceEvent::Stopped);
                ctx.refresh(&mut announce);

                let stopped = timeout(
                    Duration::from_secs(STOPPED_ANNOUNCE_TIMEOUT_SECS),
                    ctx.tracker.announce(&announce),
                )
                .await;
                debug!(ok = matches!(stopped, Ok(Ok(_))), "stopped announce");

                return;
            }
        }
    }
}
