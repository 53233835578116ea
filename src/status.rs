use crate::data_structures::ID;
use crate::piece_store::{FileProgress, StoreProgress};
use crate::tracker::TrackerStatus;
use serde::Serialize;
use std::fmt;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SwarmState {
    AwaitingMetadata,
    SelectingPiece,
    AwaitingBlocks,
    Seeding,
    Failed,
}

impl fmt::Display for SwarmState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Snapshot published by the swarm controller after every change.
#[derive(Debug, Clone, Serialize)]
pub struct TorrentStatus {
    pub info_hash: String,
    pub name: Option<String>,
    pub state: SwarmState,
    pub peers: usize,
    /// Connected peers holding the whole torrent.
    pub seeds: usize,
    /// Bytes per second over the last second.
    pub download_rate: u64,
    pub upload_rate: u64,
    pub downloaded: u64,
    pub uploaded: u64,
    /// `None` until the metadata is known.
    pub left: Option<u64>,
    pub pieces_held: usize,
    pub piece_count: Option<usize>,
    pub files: Vec<FileProgress>,
    pub tracker: TrackerStatus,
    pub error: Option<String>,
}

impl TorrentStatus {
    pub fn new(info_hash: &ID, name: Option<String>, state: SwarmState) -> Self {
        Self {
            info_hash: info_hash.to_hex(),
            name,
            state,
            peers: 0,
            seeds: 0,
            download_rate: 0,
            upload_rate: 0,
            downloaded: 0,
            uploaded: 0,
            left: None,
            pieces_held: 0,
            piece_count: None,
            files: Vec::new(),
            tracker: TrackerStatus::Pending,
            error: None,
        }
    }

    pub fn apply_progress(&mut self, progress: StoreProgress) {
        self.downloaded = progress.downloaded;
        self.uploaded = progress.uploaded;
        self.left = Some(progress.left);
        self.pieces_held = progress.pieces_held;
        self.piece_count = Some(progress.piece_count);
        self.files = progress.files;
    }

    pub fn is_finished(&self) -> bool {
        matches!(self.state, SwarmState::Seeding | SwarmState::Failed)
    }
}

impl fmt::Display for TorrentStatus {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} [{}] {}/{} pieces, {} peers ({} seeds), down {} B/s, up {} B/s",
            self.name.as_deref().unwrap_or(&self.info_hash),
            self.state,
            self.pieces_held,
            self.piece_count.map_or_else(|| "?".to_string(), |c| c.to_string()),
            self.peers,
            self.seeds,
            self.download_rate,
            self.upload_rate,
        )
    }
}

/// Turns the store's running byte counters into per-second rates.
#[derive(Debug, Default)]
pub struct RateMeter {
    last: Option<(Instant, u64, u64)>,
    rates: (u64, u64),
}

impl RateMeter {
    pub fn sample(&mut self, now: Instant, downloaded: u64, uploaded: u64) -> (u64, u64) {
        if let Some((then, down, up)) = self.last {
            let secs = now.duration_since(then).as_secs_f64();

            if secs > 0.0 {
                self.rates = (
                    (downloaded.saturating_sub(down) as f64 / secs) as u64,
                    (uploaded.saturating_sub(up) as f64 / secs) as u64,
                );
            }
        }

        self.last = Some((now, downloaded, uploaded));
        self.rates
    }
}

#[cfg(test)]
mod tests {
    use super::{RateMeter, SwarmState, TorrentStatus};
    use crate::data_structures::ID;
    use std::time::Duration;
    use tokio::time::Instant;

    #[test]
    fn rates_per_second() {
        let mut meter = RateMeter::default();
        let start = Instant::now();

        assert_eq!((0, 0), meter.sample(start, 1000, 0));
        assert_eq!(
            (2048, 512),
            meter.sample(start + Duration::from_secs(2), 1000 + 4096, 1024)
        );
        assert_eq!(
            (0, 0),
            meter.sample(start + Duration::from_secs(3), 1000 + 4096, 1024)
        );
    }

    #[test]
    fn display_before_metadata() {
        let status = TorrentStatus::new(&ID::new([0xab; 20]), None, SwarmState::AwaitingMetadata);

        assert_eq!(
            format!(
                "{} [AwaitingMetadata] 0/? pieces, 0 peers (0 seeds), down 0 B/s, up 0 B/s",
                "ab".repeat(20)
            ),
            status.to_string()
        );
    }
}
