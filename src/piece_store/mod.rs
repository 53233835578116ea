//! Verified pieces held in memory, pending blocks, and the final merge to disk.

pub(crate) mod disk;
mod layout;
mod pending;

pub use layout::{FileSpan, PieceLayout};
pub use pending::{plan_blocks, BlockRequest};

use crate::data_structures::{Bitfield, ID};
use crate::lock;
use crate::transcoding::metainfo::Torrent;
use bytes::Bytes;
use pending::{AddBlockRes, PendingPiece};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("torrent metadata is not known yet")]
    NotReady,
    #[error("piece {0} is out of range")]
    OutOfRange(usize),
    #[error("piece {0} is not being downloaded")]
    NotPending(usize),
    #[error("piece {0} is missing blocks")]
    Incomplete(usize),
    #[error("piece {0} failed hash verification")]
    HashMismatch(usize),
    #[error("piece {0} is not held, can't merge")]
    MissingPiece(usize),
    #[error("files were already merged to disk")]
    AlreadyMerged,
    #[error("disk io: {0}")]
    Io(#[from] std::io::Error),
}

/// What happened to a delivered block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    Accepted { piece_complete: bool },
    Duplicate,
    Unexpected,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileProgress {
    pub path: Vec<String>,
    pub length: u64,
    pub downloaded: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreProgress {
    pub downloaded: u64,
    pub uploaded: u64,
    pub left: u64,
    pub pieces_held: usize,
    pub piece_count: usize,
    pub files: Vec<FileProgress>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MergeState {
    Idle,
    Started,
    Done,
}

#[derive(Debug)]
struct Store {
    torrent: Arc<Torrent>,
    layout: PieceLayout,
    block_size: usize,
    request_timeout: Duration,
    pieces: Vec<Option<Bytes>>,
    local: Bitfield,
    pending: HashMap<usize, PendingPiece>,
    file_downloaded: Vec<u64>,
    downloaded: u64,
    uploaded: u64,
    merge: MergeState,
}

impl Store {
    fn new(torrent: Arc<Torrent>, block_size: usize, request_timeout: Duration) -> Self {
        let layout = PieceLayout::new(&torrent.info);
        let piece_count = torrent.info.piece_count();

        Self {
            file_downloaded: vec![0; layout.file_count()],
            layout,
            block_size,
            request_timeout,
            pieces: vec![None; piece_count],
            local: Bitfield::new(piece_count),
            pending: HashMap::new(),
            downloaded: 0,
            uploaded: 0,
            merge: MergeState::Idle,
            torrent,
        }
    }

    fn check_range(&self, idx: usize) -> Result<(), StoreError> {
        if idx < self.pieces.len() {
            Ok(())
        } else {
            Err(StoreError::OutOfRange(idx))
        }
    }

    fn hold(&mut self, idx: usize, piece: Bytes) {
        for span in self.layout.piece_spans(idx) {
            self.file_downloaded[span.file_idx] += span.length as u64;
        }

        self.pieces[idx] = Some(piece);
        self.local.change(idx, true);
        self.pending.remove(&idx);
    }

    fn verify(&self, idx: usize, piece: &[u8]) -> bool {
        self.torrent.info.piece_hash(idx) == Some(&ID::hash(piece))
    }

    fn left(&self) -> u64 {
        (0..self.pieces.len())
            .filter(|idx| self.pieces[*idx].is_none())
            .map(|idx| self.torrent.info.piece_size(idx) as u64)
            .sum()
    }
}

/// Shared handle. Empty until metadata is known.
#[derive(Debug, Clone, Default)]
pub struct PieceStore {
    inner: Arc<StdMutex<Option<Store>>>,
}

impl PieceStore {
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn new(torrent: Arc<Torrent>, block_size: usize, request_timeout: Duration) -> Self {
        let store = Self::pending();
        store.install(torrent, block_size, request_timeout);
        store
    }

    /// Sizes the store for `torrent`. Later calls are no-ops.
    pub fn install(&self, torrent: Arc<Torrent>, block_size: usize, request_timeout: Duration) {
        let mut inner = lock!(self.inner);

        if inner.is_none() {
            *inner = Some(Store::new(torrent, block_size, request_timeout));
        }
    }

    pub fn is_ready(&self) -> bool {
        lock!(self.inner).is_some()
    }

    pub fn torrent(&self) -> Option<Arc<Torrent>> {
        lock!(self.inner).as_ref().map(|s| s.torrent.clone())
    }

    pub fn local_bitfield(&self) -> Option<Bitfield> {
        lock!(self.inner).as_ref().map(|s| s.local.clone())
    }

    pub fn has_piece(&self, idx: usize) -> bool {
        lock!(self.inner)
            .as_ref()
            .map_or(false, |s| s.local.get(idx))
    }

    pub fn is_complete(&self) -> bool {
        lock!(self.inner)
            .as_ref()
            .map_or(false, |s| s.local.is_complete())
    }

    pub fn is_merged(&self) -> bool {
        lock!(self.inner)
            .as_ref()
            .map_or(false, |s| s.merge == MergeState::Done)
    }

    /// Blocks of `idx` that still need asking for: never requested or
    /// requested longer than the request timeout ago. Received blocks are kept.
    pub fn begin_piece_request(&self, idx: usize) -> Result<Vec<BlockRequest>, StoreError> {
        let mut inner = lock!(self.inner);
        let store = inner.as_mut().ok_or(StoreError::NotReady)?;
        store.check_range(idx)?;

        if store.local.get(idx) {
            return Ok(Vec::new());
        }

        let piece_size = store.torrent.info.piece_size(idx);
        let block_size = store.block_size;
        let timeout = store.request_timeout;

        Ok(store
            .pending
            .entry(idx)
            .or_insert_with(|| PendingPiece::new(plan_blocks(idx, piece_size, block_size)))
            .requestable(Instant::now(), timeout))
    }

    pub fn mark_requested(&self, block: &BlockRequest, peer: ID) {
        if let Some(store) = lock!(self.inner).as_mut() {
            if let Some(pending) = store.pending.get_mut(&block.piece) {
                pending.mark_requested(block.begin, peer, Instant::now());
            }
        }
    }

    /// Accepts a delivered block. Repeats are harmless and counted once.
    pub fn add_block(
        &self,
        peer: &ID,
        idx: usize,
        begin: usize,
        data: Bytes,
    ) -> Result<BlockOutcome, StoreError> {
        let mut inner = lock!(self.inner);
        let store = inner.as_mut().ok_or(StoreError::NotReady)?;
        store.check_range(idx)?;

        if store.local.get(idx) {
            return Ok(BlockOutcome::Duplicate);
        }

        let Some(pending) = store.pending.get_mut(&idx) else {
            debug!(%peer, idx, begin, "block for a piece nobody asked for");
            return Ok(BlockOutcome::Unexpected);
        };

        let length = data.len() as u64;

        let outcome = match pending.add_block(begin, data) {
            AddBlockRes::Added => BlockOutcome::Accepted {
                piece_complete: false,
            },
            AddBlockRes::AddedLast => BlockOutcome::Accepted {
                piece_complete: true,
            },
            AddBlockRes::Duplicate => BlockOutcome::Duplicate,
            AddBlockRes::Unexpected => BlockOutcome::Unexpected,
        };

        if let BlockOutcome::Accepted { .. } = outcome {
            store.downloaded += length;
        }

        Ok(outcome)
    }

    pub fn is_piece_complete(&self, idx: usize) -> bool {
        lock!(self.inner).as_ref().map_or(false, |s| {
            s.local.get(idx) || s.pending.get(&idx).map_or(false, |p| p.is_complete())
        })
    }

    /// Concatenates the blocks of a complete piece and verifies its hash.
    /// A mismatch throws the blocks away so the piece gets downloaded again.
    #[instrument(skip(self))]
    pub fn assemble_piece(&self, idx: usize) -> Result<Bytes, StoreError> {
        let mut inner = lock!(self.inner);
        let store = inner.as_mut().ok_or(StoreError::NotReady)?;
        store.check_range(idx)?;

        if let Some(piece) = &store.pieces[idx] {
            return Ok(piece.clone());
        }

        let pending = store
            .pending
            .get_mut(&idx)
            .ok_or(StoreError::NotPending(idx))?;
        let piece = pending.assemble().ok_or(StoreError::Incomplete(idx))?;

        if !store.verify(idx, &piece) {
            warn!(idx, "piece hash mismatch, discarding blocks");
            if let Some(pending) = store.pending.get_mut(&idx) {
                pending.reset();
            }
            return Err(StoreError::HashMismatch(idx));
        }

        store.hold(idx, piece.clone());
        debug!(idx, held = store.local.weight(), "piece verified");

        Ok(piece)
    }

    /// Forgets every block request addressed to `peer`.
    pub fn release_peer(&self, peer: &ID) -> usize {
        let mut inner = lock!(self.inner);
        let Some(store) = inner.as_mut() else {
            return 0;
        };

        store
            .pending
            .values_mut()
            .map(|pending| pending.cancel_pending(peer))
            .sum()
    }

    /// Serves a slice of a held piece and counts it as uploaded.
    pub fn get_block(&self, idx: usize, begin: usize, length: usize) -> Option<Bytes> {
        let mut inner = lock!(self.inner);
        let store = inner.as_mut()?;

        let piece = store.pieces.get(idx)?.as_ref()?;
        let end = begin.checked_add(length)?;
        if end > piece.len() {
            return None;
        }

        let block = piece.slice(begin..end);
        store.uploaded += length as u64;

        Some(block)
    }

    pub fn progress(&self) -> Option<StoreProgress> {
        let inner = lock!(self.inner);
        let store = inner.as_ref()?;

        let files = store
            .torrent
            .info
            .files()
            .into_iter()
            .zip(store.file_downloaded.iter())
            .map(|(file, downloaded)| FileProgress {
                path: file.path,
                length: file.length,
                downloaded: *downloaded,
            })
            .collect();

        Some(StoreProgress {
            downloaded: store.downloaded,
            uploaded: store.uploaded,
            left: store.left(),
            pieces_held: store.local.weight(),
            piece_count: store.pieces.len(),
            files,
        })
    }

    /// Writes every file under `target` once all pieces are held. Runs at
    /// most once; a failed merge is not retried.
    #[instrument(skip(self))]
    pub async fn merge_to_disk(&self, target: &Path) -> Result<(), StoreError> {
        let (layout, paths, pieces) = {
            let mut inner = lock!(self.inner);
            let store = inner.as_mut().ok_or(StoreError::NotReady)?;

            if store.merge != MergeState::Idle {
                return Err(StoreError::AlreadyMerged);
            }

            if let Some(missing) = store.pieces.iter().position(Option::is_none) {
                return Err(StoreError::MissingPiece(missing));
            }

            store.merge = MergeState::Started;

            (
                store.layout.clone(),
                store.torrent.info.file_paths(target),
                store.pieces.iter().flatten().cloned().collect::<Vec<_>>(),
            )
        };

        disk::write_files(&layout, paths, &pieces).await?;

        if let Some(store) = lock!(self.inner).as_mut() {
            store.merge = MergeState::Done;
        }
        info!("files merged to disk");

        Ok(())
    }

    /// Picks up verified pieces already present under `target`. When the
    /// whole torrent is there, the store is treated as merged.
    #[instrument(skip(self))]
    pub async fn load_from_disk(&self, target: &Path) -> Result<usize, StoreError> {
        let (layout, paths, piece_count) = {
            let inner = lock!(self.inner);
            let store = inner.as_ref().ok_or(StoreError::NotReady)?;

            (
                store.layout.clone(),
                store.torrent.info.file_paths(target),
                store.pieces.len(),
            )
        };

        let found = disk::read_pieces(&layout, &paths, piece_count).await?;

        let mut inner = lock!(self.inner);
        let store = inner.as_mut().ok_or(StoreError::NotReady)?;
        let mut loaded = 0;

        for (idx, piece) in found.into_iter().enumerate() {
            let Some(piece) = piece else {
                continue;
            };

            if store.local.get(idx) || !store.verify(idx, &piece) {
                continue;
            }

            store.hold(idx, piece);
            loaded += 1;
        }

        if store.local.is_complete() && store.merge == MergeState::Idle {
            store.merge = MergeState::Done;
        }

        info!(loaded, held = store.local.weight(), "pieces loaded from disk");

        Ok(loaded)
    }
}

#[cfg(test)]
mod tests {
    use super::disk::tests::scratch_dir;
    use super::{BlockOutcome, PieceStore, StoreError};
    use crate::constants::BLOCK_SIZE;
    use crate::data_structures::ID;
    use crate::transcoding::metainfo::tests::info_for;
    use crate::transcoding::metainfo::Torrent;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const KB: usize = 1024;
    const TIMEOUT: Duration = Duration::from_secs(30);

    fn content(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    fn store_for(files: &[(&str, &[u8])], piece_length: usize) -> PieceStore {
        let info = info_for("store", piece_length as u64, files);
        let torrent = Torrent::from_info(&info, Vec::new()).unwrap();

        PieceStore::new(Arc::new(torrent), BLOCK_SIZE, TIMEOUT)
    }

    fn deliver_all(store: &PieceStore, peer: &ID, stream: &[u8], piece_length: usize) {
        let piece_count = (stream.len() + piece_length - 1) / piece_length;

        for idx in 0..piece_count {
            let piece_start = idx * piece_length;
            for block in store.begin_piece_request(idx).unwrap() {
                store.mark_requested(&block, *peer);
                let start = piece_start + block.begin;
                let data = Bytes::copy_from_slice(&stream[start..start + block.length]);
                store.add_block(peer, idx, block.begin, data).unwrap();
            }
            store.assemble_piece(idx).unwrap();
        }
    }

    #[test]
    fn not_ready_without_metadata() {
        let store = PieceStore::pending();

        assert!(matches!(
            store.begin_piece_request(0),
            Err(StoreError::NotReady)
        ));
        assert!(store.progress().is_none());
        assert!(!store.has_piece(0));
    }

    #[tokio::test]
    async fn merge_splits_pieces_across_files() {
        let a = content(700 * KB, 1);
        let b = content(400 * KB, 2);
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let store = store_for(&[("a", &a), ("b", &b)], 512 * KB);
        let peer = ID::new([1; 20]);

        deliver_all(&store, &peer, &stream, 512 * KB);

        let progress = store.progress().unwrap();
        assert_eq!(0, progress.left);
        assert_eq!(stream.len() as u64, progress.downloaded);
        assert_eq!(700 * KB as u64, progress.files[0].downloaded);
        assert_eq!(400 * KB as u64, progress.files[1].downloaded);

        let dir = scratch_dir();
        store.merge_to_disk(&dir).await.unwrap();

        let a_on_disk = std::fs::read(dir.join("store").join("a")).unwrap();
        let b_on_disk = std::fs::read(dir.join("store").join("b")).unwrap();
        assert_eq!(716_800, a_on_disk.len());
        assert_eq!(409_600, b_on_disk.len());
        assert_eq!(a, a_on_disk);
        assert_eq!(b, b_on_disk);

        assert!(matches!(
            store.merge_to_disk(&dir).await,
            Err(StoreError::AlreadyMerged)
        ));

        std::fs::remove_dir_all(dir).unwrap();
    }

    #[tokio::test]
    async fn merge_needs_every_piece() {
        let a = content(3 * BLOCK_SIZE, 3);
        let store = store_for(&[("a", &a)], 2 * BLOCK_SIZE);

        assert!(matches!(
            store.merge_to_disk(&scratch_dir()).await,
            Err(StoreError::MissingPiece(0))
        ));
    }

    #[test]
    fn disconnect_mid_piece_keeps_received_blocks() {
        let a = content(4 * BLOCK_SIZE, 4);
        let store = store_for(&[("a", &a)], 4 * BLOCK_SIZE);
        let first = ID::new([1; 20]);
        let second = ID::new([2; 20]);

        let blocks = store.begin_piece_request(0).unwrap();
        assert_eq!(4, blocks.len());
        for block in blocks.iter() {
            store.mark_requested(block, first);
        }
        for block in blocks.iter().take(2) {
            let data = Bytes::copy_from_slice(&a[block.begin..block.begin + block.length]);
            store.add_block(&first, 0, block.begin, data).unwrap();
        }

        assert_eq!(2, store.release_peer(&first));
        assert!(!store.is_piece_complete(0));

        let remaining = store.begin_piece_request(0).unwrap();
        assert_eq!(
            vec![2 * BLOCK_SIZE, 3 * BLOCK_SIZE],
            remaining.iter().map(|b| b.begin).collect::<Vec<_>>()
        );

        for block in remaining.iter() {
            store.mark_requested(block, second);
            let data = Bytes::copy_from_slice(&a[block.begin..block.begin + block.length]);
            store.add_block(&second, 0, block.begin, data).unwrap();
        }

        assert!(store.is_piece_complete(0));
        assert_eq!(a, store.assemble_piece(0).unwrap().to_vec());
        assert!(store.has_piece(0));
        assert!(store.is_complete());
    }

    #[test]
    fn duplicate_blocks_count_once() {
        let a = content(2 * BLOCK_SIZE, 5);
        let store = store_for(&[("a", &a)], 2 * BLOCK_SIZE);
        let peer = ID::new([1; 20]);

        store.begin_piece_request(0).unwrap();
        let data = Bytes::copy_from_slice(&a[..BLOCK_SIZE]);

        assert_eq!(
            BlockOutcome::Accepted {
                piece_complete: false
            },
            store.add_block(&peer, 0, 0, data.clone()).unwrap()
        );
        assert_eq!(
            BlockOutcome::Duplicate,
            store.add_block(&peer, 0, 0, data).unwrap()
        );
        assert_eq!(BLOCK_SIZE as u64, store.progress().unwrap().downloaded);
    }

    #[test]
    fn unrequested_pieces_are_dropped() {
        let a = content(2 * BLOCK_SIZE, 6);
        let store = store_for(&[("a", &a)], BLOCK_SIZE);
        let peer = ID::new([1; 20]);

        let data = Bytes::copy_from_slice(&a[BLOCK_SIZE..]);
        assert_eq!(
            BlockOutcome::Unexpected,
            store.add_block(&peer, 1, 0, data).unwrap()
        );
        assert!(matches!(
            store.add_block(&peer, 2, 0, Bytes::new()),
            Err(StoreError::OutOfRange(2))
        ));
        assert_eq!(0, store.progress().unwrap().downloaded);
    }

    #[test]
    fn corrupt_piece_is_downloaded_again() {
        let a = content(2 * BLOCK_SIZE, 7);
        let store = store_for(&[("a", &a)], 2 * BLOCK_SIZE);
        let peer = ID::new([1; 20]);

        store.begin_piece_request(0).unwrap();
        store
            .add_block(&peer, 0, 0, Bytes::copy_from_slice(&a[..BLOCK_SIZE]))
            .unwrap();
        store
            .add_block(&peer, 0, BLOCK_SIZE, Bytes::from(vec![0u8; BLOCK_SIZE]))
            .unwrap();

        assert!(matches!(
            store.assemble_piece(0),
            Err(StoreError::HashMismatch(0))
        ));
        assert!(!store.has_piece(0));
        assert_eq!(2, store.begin_piece_request(0).unwrap().len());
    }

    #[test]
    fn blocks_are_served_from_held_pieces() {
        let a = content(3 * BLOCK_SIZE, 8);
        let store = store_for(&[("a", &a)], 2 * BLOCK_SIZE);
        let peer = ID::new([1; 20]);

        assert_eq!(None, store.get_block(0, 0, BLOCK_SIZE));

        deliver_all(&store, &peer, &a, 2 * BLOCK_SIZE);

        assert_eq!(
            Some(Bytes::copy_from_slice(&a[2 * BLOCK_SIZE..])),
            store.get_block(1, 0, BLOCK_SIZE)
        );
        assert_eq!(None, store.get_block(1, 1, BLOCK_SIZE));
        assert_eq!(BLOCK_SIZE as u64, store.progress().unwrap().uploaded);
    }

    #[tokio::test]
    async fn seeding_store_loads_what_is_on_disk() {
        let a = content(3 * BLOCK_SIZE, 9);
        let b = content(BLOCK_SIZE, 10);
        let stream: Vec<u8> = a.iter().chain(b.iter()).copied().collect();
        let leecher = store_for(&[("a", &a), ("b", &b)], 2 * BLOCK_SIZE);
        deliver_all(&leecher, &ID::new([1; 20]), &stream, 2 * BLOCK_SIZE);

        let dir = scratch_dir();
        leecher.merge_to_disk(&dir).await.unwrap();

        let seeder = store_for(&[("a", &a), ("b", &b)], 2 * BLOCK_SIZE);
        assert_eq!(2, seeder.load_from_disk(&dir).await.unwrap());
        assert!(seeder.is_complete());
        assert!(seeder.is_merged());
        assert_eq!(0, seeder.progress().unwrap().left);

        std::fs::remove_dir_all(dir).unwrap();
    }
}
