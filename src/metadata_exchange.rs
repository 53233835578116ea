//! ut_metadata (BEP9): fetching the info dictionary from peers when all we
//! have is a magnet link, and serving it once we know it.

use crate::constants::MAX_METADATA_SIZE;
use crate::data_structures::ID;
use crate::lock;
use crate::peers::connection::extension::MetadataMessage;
use crate::transcoding::metainfo::Torrent;
use crate::unsigned_ceil_div;
use anyhow::{bail, Result};
use bytes::{Bytes, BytesMut};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
enum Slot {
    Needed,
    InFlight { peer: ID, since: Instant },
    Received(Bytes),
}

/// Metadata pieces collected so far. Discarded once the info dictionary is
/// resolved.
#[derive(Debug)]
pub struct MetadataAssembly {
    total_size: usize,
    piece_size: usize,
    slots: Vec<Slot>,
}

impl MetadataAssembly {
    pub fn new(total_size: usize, piece_size: usize) -> Result<Self> {
        if total_size == 0 || total_size > MAX_METADATA_SIZE {
            bail!("unusable metadata size {}", total_size);
        }

        if piece_size == 0 {
            bail!("metadata piece size must be positive");
        }

        Ok(Self {
            total_size,
            piece_size,
            slots: vec![Slot::Needed; unsigned_ceil_div!(total_size, piece_size)],
        })
    }

    pub fn total_size(&self) -> usize {
        self.total_size
    }

    pub fn piece_count(&self) -> usize {
        self.slots.len()
    }

    pub fn expected_len(&self, idx: usize) -> usize {
        let start = idx * self.piece_size;
        std::cmp::min(self.piece_size, self.total_size.saturating_sub(start))
    }

    /// Hands out a piece nobody is fetching and marks it in flight to `peer`.
    pub fn next_needed_piece(&mut self, peer: ID) -> Option<usize> {
        let idx = self
            .slots
            .iter()
            .position(|slot| matches!(slot, Slot::Needed))?;

        self.slots[idx] = Slot::InFlight {
            peer,
            since: Instant::now(),
        };

        Some(idx)
    }

    pub fn store_piece(&mut self, idx: usize, data: Bytes) -> Result<()> {
        if idx >= self.slots.len() {
            bail!("metadata piece {} of {}", idx, self.slots.len());
        }

        if data.len() != self.expected_len(idx) {
            bail!(
                "metadata piece {} should be {} bytes, got {}",
                idx,
                self.expected_len(idx),
                data.len()
            );
        }

        self.slots[idx] = Slot::Received(data);

        Ok(())
    }

    /// Makes `idx` fetchable again, e.g. after a reject.
    pub fn release(&mut self, idx: usize) {
        if let Some(slot) = self.slots.get_mut(idx) {
            if let Slot::InFlight { .. } = slot {
                *slot = Slot::Needed;
            }
        }
    }

    pub fn release_peer(&mut self, from: &ID) {
        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::InFlight { peer, .. } if peer == from) {
                *slot = Slot::Needed;
            }
        }
    }

    pub fn release_expired(&mut self, timeout: Duration) {
        let now = Instant::now();

        for slot in self.slots.iter_mut() {
            if matches!(slot, Slot::InFlight { since, .. } if now.duration_since(*since) >= timeout)
            {
                *slot = Slot::Needed;
            }
        }
    }

    pub fn is_complete(&self) -> bool {
        self.slots
            .iter()
            .all(|slot| matches!(slot, Slot::Received(_)))
    }

    /// Pieces concatenated in index order, `None` while any is missing.
    pub fn assemble(&self) -> Option<Bytes> {
        let mut rv = BytesMut::with_capacity(self.total_size);

        for slot in self.slots.iter() {
            let Slot::Received(data) = slot else {
                return None;
            };
            rv.extend_from_slice(data);
        }

        Some(rv.freeze())
    }
}

#[derive(Debug)]
enum State {
    Unknown,
    Assembling(MetadataAssembly),
    Resolved(Arc<Torrent>),
}

#[derive(Debug)]
struct Inner {
    info_hash: ID,
    announce: Vec<String>,
    piece_size: usize,
    state: State,
}

#[derive(Debug, Clone)]
pub struct MetadataExchange {
    inner: Arc<StdMutex<Inner>>,
    resolved: Arc<watch::Sender<Option<Arc<Torrent>>>>,
}

impl MetadataExchange {
    /// Exchange for a torrent known only by its info hash.
    pub fn pending(info_hash: ID, announce: Vec<String>, piece_size: usize) -> Self {
        Self::with_state(info_hash, announce, piece_size, State::Unknown, None)
    }

    /// Exchange that only serves, metadata is already known.
    pub fn resolved(torrent: Arc<Torrent>, piece_size: usize) -> Self {
        Self::with_state(
            torrent.info_hash,
            torrent.announce.clone(),
            piece_size,
            State::Resolved(torrent.clone()),
            Some(torrent),
        )
    }

    fn with_state(
        info_hash: ID,
        announce: Vec<String>,
        piece_size: usize,
        state: State,
        torrent: Option<Arc<Torrent>>,
    ) -> Self {
        let (resolved, _) = watch::channel(torrent);

        Self {
            inner: Arc::new(StdMutex::new(Inner {
                info_hash,
                announce,
                piece_size,
                state,
            })),
            resolved: Arc::new(resolved),
        }
    }

    pub fn info_hash(&self) -> ID {
        lock!(self.inner).info_hash
    }

    pub fn torrent(&self) -> Option<Arc<Torrent>> {
        match &lock!(self.inner).state {
            State::Resolved(torrent) => Some(torrent.clone()),
            _ => None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        matches!(lock!(self.inner).state, State::Resolved(_))
    }

    /// Fires once with the resolved torrent.
    pub fn subscribe(&self) -> watch::Receiver<Option<Arc<Torrent>>> {
        self.resolved.subscribe()
    }

    /// Size we advertise in our extension handshake.
    pub fn metadata_size(&self) -> Option<u64> {
        match &lock!(self.inner).state {
            State::Resolved(torrent) => Some(torrent.metadata_size() as u64),
            _ => None,
        }
    }

    /// A peer's extension handshake announced `size`. The first usable size
    /// starts the assembly; returns whether there is anything to fetch.
    pub fn offer_size(&self, size: u64) -> bool {
        let mut inner = lock!(self.inner);

        match &inner.state {
            State::Resolved(_) => false,
            State::Assembling(assembly) => {
                if assembly.total_size() as u64 != size {
                    debug!(
                        offered = size,
                        assembling = assembly.total_size(),
                        "peer disagrees on metadata size"
                    );
                }
                true
            }
            State::Unknown => match MetadataAssembly::new(size as usize, inner.piece_size) {
                Ok(assembly) => {
                    info!(
                        size,
                        pieces = assembly.piece_count(),
                        "fetching metadata"
                    );
                    inner.state = State::Assembling(assembly);
                    true
                }
                Err(e) => {
                    warn!(size, %e, "ignoring metadata size");
                    false
                }
            },
        }
    }

    /// Metadata size being assembled, for peers whose handshake omitted it.
    pub fn assembling_size(&self) -> Option<u64> {
        match &lock!(self.inner).state {
            State::Assembling(assembly) => Some(assembly.total_size() as u64),
            _ => None,
        }
    }

    pub fn next_needed_piece(&self, peer: ID) -> Option<u32> {
        match &mut lock!(self.inner).state {
            State::Assembling(assembly) => assembly.next_needed_piece(peer).map(|idx| idx as u32),
            _ => None,
        }
    }

    /// Stores one piece. When it completes the dictionary, verifies it
    /// against the info hash, decodes it and publishes the torrent.
    /// A dictionary that fails either check is thrown away and fetched again.
    pub fn store_piece(
        &self,
        peer: &ID,
        idx: u32,
        total_size: u64,
        data: Bytes,
    ) -> Result<Option<Arc<Torrent>>> {
        let mut inner = lock!(self.inner);
        let inner = &mut *inner;

        let State::Assembling(assembly) = &mut inner.state else {
            return Ok(None);
        };

        if assembly.total_size() as u64 != total_size {
            bail!(
                "{} sent total_size {}, expected {}",
                peer,
                total_size,
                assembly.total_size()
            );
        }

        assembly.store_piece(idx as usize, data)?;

        let Some(bytes) = assembly.assemble() else {
            return Ok(None);
        };

        if ID::hash(&bytes) != inner.info_hash {
            warn!(%peer, "assembled metadata does not match the info hash");
            *assembly = MetadataAssembly::new(assembly.total_size(), inner.piece_size)?;
            bail!("metadata hash mismatch");
        }

        let torrent = match Torrent::from_info_bytes(&bytes, inner.announce.clone()) {
            Ok(torrent) => Arc::new(torrent),
            Err(e) => {
                *assembly = MetadataAssembly::new(assembly.total_size(), inner.piece_size)?;
                bail!("assembled metadata does not decode: {}", e);
            }
        };

        info!(name = %torrent.info.name, pieces = torrent.info.piece_count(), "metadata resolved");

        inner.state = State::Resolved(torrent.clone());
        self.resolved.send_replace(Some(torrent.clone()));

        Ok(Some(torrent))
    }

    pub fn reject(&self, idx: u32) {
        if let State::Assembling(assembly) = &mut lock!(self.inner).state {
            assembly.release(idx as usize);
        }
    }

    pub fn release_peer(&self, peer: &ID) {
        if let State::Assembling(assembly) = &mut lock!(self.inner).state {
            assembly.release_peer(peer);
        }
    }

    pub fn release_expired(&self, timeout: Duration) {
        if let State::Assembling(assembly) = &mut lock!(self.inner).state {
            assembly.release_expired(timeout);
        }
    }

    /// Answer to a peer's metadata request.
    pub fn serve_piece(&self, idx: u32) -> MetadataMessage {
        let inner = lock!(self.inner);

        let State::Resolved(torrent) = &inner.state else {
            return MetadataMessage::Reject { piece: idx };
        };

        let start = idx as usize * inner.piece_size;
        if start >= torrent.info_bytes.len() {
            return MetadataMessage::Reject { piece: idx };
        }

        let end = std::cmp::min(start + inner.piece_size, torrent.info_bytes.len());

        MetadataMessage::Data {
            piece: idx,
            total_size: torrent.info_bytes.len() as u64,
            data: torrent.info_bytes.slice(start..end),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{MetadataAssembly, MetadataExchange};
    use crate::data_structures::ID;
    use crate::peers::connection::extension::MetadataMessage;
    use crate::transcoding::metainfo::tests::info_for;
    use crate::transcoding::metainfo::{Info, Torrent};
    use bendy::encoding::ToBencode;
    use bytes::Bytes;
    use std::sync::Arc;
    use std::time::Duration;

    const KB: usize = 1024;

    fn peer(n: u8) -> ID {
        ID::new([n; 20])
    }

    /// Info dictionary padded through its name to exactly `size` bytes.
    fn info_of_size(size: usize) -> (Info, Vec<u8>) {
        let content = vec![7u8; 40 * KB];

        for name_len in 1..size {
            let info = info_for(&"n".repeat(name_len), 16 * KB as u64, &[("f", &content)]);
            let bytes = info.to_bencode().unwrap();

            if bytes.len() == size {
                return (info, bytes);
            }
        }

        panic!("no name pads the info dictionary to {} bytes", size);
    }

    #[test]
    fn single_piece_bootstrap() {
        let (info, bytes) = info_of_size(1000);
        let exchange = MetadataExchange::pending(ID::hash(&bytes), Vec::new(), 512 * KB);

        assert!(exchange.offer_size(1000));
        assert_eq!(Some(0), exchange.next_needed_piece(peer(1)));
        assert_eq!(None, exchange.next_needed_piece(peer(2)));

        let torrent = exchange
            .store_piece(&peer(1), 0, 1000, Bytes::from(bytes.clone()))
            .unwrap()
            .unwrap();

        assert_eq!(None, exchange.next_needed_piece(peer(1)));
        assert!(exchange.is_resolved());
        assert_eq!(info, torrent.info);
        assert_eq!(3, torrent.info.piece_count());
        assert_eq!(Some(1000), exchange.metadata_size());
        assert_eq!(
            Some(torrent.info_hash),
            exchange.subscribe().borrow().as_ref().map(|t| t.info_hash)
        );
    }

    #[test]
    fn pieces_are_spread_and_retried() {
        let (_, bytes) = info_of_size(1000);
        let exchange = MetadataExchange::pending(ID::hash(&bytes), Vec::new(), 400);
        exchange.offer_size(1000);

        assert_eq!(Some(0), exchange.next_needed_piece(peer(1)));
        assert_eq!(Some(1), exchange.next_needed_piece(peer(2)));
        assert_eq!(Some(2), exchange.next_needed_piece(peer(2)));
        assert_eq!(None, exchange.next_needed_piece(peer(3)));

        exchange.reject(1);
        exchange.release_peer(&peer(1));
        assert_eq!(Some(0), exchange.next_needed_piece(peer(3)));
        assert_eq!(Some(1), exchange.next_needed_piece(peer(3)));

        let data = Bytes::from(bytes);
        for (idx, range) in [(2u32, 800..1000), (0, 0..400)] {
            let rv = exchange
                .store_piece(&peer(3), idx, 1000, data.slice(range))
                .unwrap();
            assert!(rv.is_none());
        }

        let torrent = exchange
            .store_piece(&peer(3), 1, 1000, data.slice(400..800))
            .unwrap();
        assert!(torrent.is_some());
    }

    #[test]
    fn corrupt_metadata_is_fetched_again() {
        let (_, bytes) = info_of_size(1000);
        let exchange = MetadataExchange::pending(ID::hash(&bytes), Vec::new(), 512 * KB);
        exchange.offer_size(1000);
        exchange.next_needed_piece(peer(1));

        let mut corrupt = bytes.clone();
        corrupt[500] ^= 0xFF;

        assert!(exchange
            .store_piece(&peer(1), 0, 1000, Bytes::from(corrupt))
            .is_err());
        assert!(!exchange.is_resolved());
        assert_eq!(Some(0), exchange.next_needed_piece(peer(2)));
    }

    #[test]
    fn wrong_sizes_are_refused() {
        let exchange = MetadataExchange::pending(ID::new([0; 20]), Vec::new(), 512 * KB);

        assert!(!exchange.offer_size(0));
        assert!(exchange.offer_size(100));
        assert!(exchange
            .store_piece(&peer(1), 0, 99, Bytes::from(vec![0; 99]))
            .is_err());
        assert!(exchange
            .store_piece(&peer(1), 0, 100, Bytes::from(vec![0; 99]))
            .is_err());
    }

    #[test]
    fn serves_only_resolved_metadata() {
        let (info, _) = info_of_size(1000);
        let torrent = Arc::new(Torrent::from_info(&info, Vec::new()).unwrap());

        let pending = MetadataExchange::pending(torrent.info_hash, Vec::new(), 400);
        assert_eq!(
            MetadataMessage::Reject { piece: 0 },
            pending.serve_piece(0)
        );

        let exchange = MetadataExchange::resolved(torrent.clone(), 400);
        assert_eq!(
            MetadataMessage::Data {
                piece: 2,
                total_size: 1000,
                data: torrent.info_bytes.slice(800..1000),
            },
            exchange.serve_piece(2)
        );
        assert_eq!(
            MetadataMessage::Reject { piece: 3 },
            exchange.serve_piece(3)
        );
        assert!(!exchange.offer_size(1000));
    }

    #[tokio::test]
    async fn unanswered_requests_expire() {
        let mut assembly = MetadataAssembly::new(1000, 512).unwrap();

        assert_eq!(Some(0), assembly.next_needed_piece(peer(1)));
        assert_eq!(Some(1), assembly.next_needed_piece(peer(1)));
        assert_eq!(None, assembly.next_needed_piece(peer(1)));

        assembly.release_expired(Duration::ZERO);
        assert_eq!(Some(0), assembly.next_needed_piece(peer(2)));
        assert_eq!(488, assembly.expected_len(1));
    }
}
