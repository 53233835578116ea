//! Who holds which piece, and which wanted piece is rarest.
//!
//! Every session feeds bitfields and haves in here. The tracker keeps one
//! counter per piece the local node still wants; a piece leaves the counter
//! map for good once the piece store confirms it.

use crate::data_structures::{Bitfield, ID};
use crate::lock;
use anyhow::{bail, Result};
use rand::seq::SliceRandom;
use rand::{thread_rng, Rng};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Selection {
    Piece { index: usize, holders: Vec<ID> },
    /// Nothing left to want.
    Done,
    /// Wanted pieces remain but nobody connected has any of them.
    Unavailable,
}

#[derive(Debug, Default)]
struct Early {
    bitfield: Option<Vec<u8>>,
    haves: Vec<u32>,
}

#[derive(Debug, Default)]
struct Inner {
    piece_count: Option<usize>,
    counts: BTreeMap<usize, u32>,
    bitfields: HashMap<ID, Bitfield>,
    // announcements that arrive before the piece count is known
    early: HashMap<ID, Early>,
}

#[derive(Debug, Clone, Default)]
pub struct AvailabilityTracker {
    inner: Arc<StdMutex<Inner>>,
}

impl AvailabilityTracker {
    /// Tracker for a torrent whose size is not known yet.
    pub fn pending() -> Self {
        Self::default()
    }

    pub fn new(local: &Bitfield) -> Self {
        let tracker = Self::pending();
        tracker.set_piece_count(local);
        tracker
    }

    /// Starts counting every piece missing from `local` and replays whatever
    /// peers announced before the size was known. Peers whose early bitfield
    /// has the wrong length are reported back so their sessions can be dropped.
    pub fn set_piece_count(&self, local: &Bitfield) -> Vec<ID> {
        let mut inner = lock!(self.inner);

        let piece_count = local.len();
        inner.piece_count = Some(piece_count);
        inner.counts = (0..piece_count)
            .filter(|idx| !local.get(*idx))
            .map(|idx| (idx, 0))
            .collect();

        let mut misbehaving = Vec::new();

        for (peer, early) in std::mem::take(&mut inner.early) {
            let mut bitfield = match early.bitfield {
                Some(raw) => match Bitfield::from_bytes(&raw, piece_count) {
                    Ok(bitfield) => bitfield,
                    Err(e) => {
                        warn!(%peer, ?e, "early bitfield does not fit the torrent");
                        misbehaving.push(peer);
                        continue;
                    }
                },
                None => Bitfield::new(piece_count),
            };

            if early.haves.iter().any(|idx| *idx as usize >= piece_count) {
                misbehaving.push(peer);
                continue;
            }

            for idx in early.haves {
                bitfield.change(idx as usize, true);
            }

            Self::count_in(&mut inner.counts, &bitfield);
            inner.bitfields.insert(peer, bitfield);
        }

        misbehaving
    }

    fn count_in(counts: &mut BTreeMap<usize, u32>, bitfield: &Bitfield) {
        for idx in bitfield.ones() {
            if let Some(count) = counts.get_mut(&idx) {
                *count += 1;
            }
        }
    }

    fn count_out(counts: &mut BTreeMap<usize, u32>, bitfield: &Bitfield) {
        for idx in bitfield.ones() {
            if let Some(count) = counts.get_mut(&idx) {
                *count = count.saturating_sub(1);
            }
        }
    }

    /// Replaces whatever was known about `peer`. Returns whether the peer
    /// holds every piece.
    pub fn observe_bitfield(&self, peer: ID, raw: &[u8]) -> Result<bool> {
        let mut inner = lock!(self.inner);
        let inner = &mut *inner;

        let Some(piece_count) = inner.piece_count else {
            inner.early.entry(peer).or_default().bitfield = Some(raw.to_vec());
            return Ok(false);
        };

        let bitfield = Bitfield::from_bytes(raw, piece_count)?;

        if let Some(old) = inner.bitfields.remove(&peer) {
            Self::count_out(&mut inner.counts, &old);
        }

        Self::count_in(&mut inner.counts, &bitfield);
        let complete = bitfield.is_complete();
        inner.bitfields.insert(peer, bitfield);

        Ok(complete)
    }

    /// Returns whether the peer now holds every piece.
    pub fn observe_have(&self, peer: ID, idx: u32) -> Result<bool> {
        let mut inner = lock!(self.inner);
        let inner = &mut *inner;

        let Some(piece_count) = inner.piece_count else {
            inner.early.entry(peer).or_default().haves.push(idx);
            return Ok(false);
        };

        let idx = idx as usize;
        if idx >= piece_count {
            bail!("have for piece {} of {}", idx, piece_count);
        }

        let bitfield = inner
            .bitfields
            .entry(peer)
            .or_insert_with(|| Bitfield::new(piece_count));

        if !bitfield.change(idx, true) {
            if let Some(count) = inner.counts.get_mut(&idx) {
                *count += 1;
            }
        }

        Ok(bitfield.is_complete())
    }

    pub fn select_rarest_piece(&self) -> Selection {
        self.select_rarest_piece_with(&mut thread_rng())
    }

    pub fn select_rarest_piece_with<R: Rng + ?Sized>(&self, rng: &mut R) -> Selection {
        let inner = lock!(self.inner);

        if inner.piece_count.is_none() {
            return Selection::Unavailable;
        }

        if inner.counts.is_empty() {
            return Selection::Done;
        }

        let Some(min) = inner.counts.values().copied().filter(|c| *c > 0).min() else {
            return Selection::Unavailable;
        };

        let rarest: Vec<usize> = inner
            .counts
            .iter()
            .filter_map(|(idx, count)| (*count == min).then_some(*idx))
            .collect();

        let Some(index) = rarest.choose(rng).copied() else {
            return Selection::Unavailable;
        };

        let holders = Self::holders_in(&inner, index);
        debug!(index, count = min, "rarest piece");

        Selection::Piece { index, holders }
    }

    fn holders_in(inner: &Inner, idx: usize) -> Vec<ID> {
        let mut holders: Vec<ID> = inner
            .bitfields
            .iter()
            .filter_map(|(peer, bitfield)| bitfield.get(idx).then_some(*peer))
            .collect();
        holders.sort();
        holders
    }

    pub fn peers_holding(&self, idx: usize) -> Vec<ID> {
        Self::holders_in(&lock!(self.inner), idx)
    }

    pub fn holds(&self, peer: &ID, idx: usize) -> bool {
        lock!(self.inner)
            .bitfields
            .get(peer)
            .map_or(false, |bitfield| bitfield.get(idx))
    }

    /// Does `peer` have anything we still want?
    pub fn is_interesting(&self, peer: &ID) -> bool {
        let inner = lock!(self.inner);

        let Some(bitfield) = inner.bitfields.get(peer) else {
            return false;
        };

        inner.counts.keys().any(|idx| bitfield.get(*idx))
    }

    pub fn count(&self, idx: usize) -> Option<u32> {
        lock!(self.inner).counts.get(&idx).copied()
    }

    pub fn remaining(&self) -> usize {
        lock!(self.inner).counts.len()
    }

    /// Connected peers that hold every piece.
    pub fn seeds(&self) -> usize {
        lock!(self.inner)
            .bitfields
            .values()
            .filter(|bitfield| bitfield.is_complete())
            .count()
    }

    /// The local node completed `idx`, never select it again.
    pub fn remove_piece(&self, idx: usize) {
        lock!(self.inner).counts.remove(&idx);
    }

    /// Retracts everything `peer` contributed in one step.
    pub fn remove_peer(&self, peer: &ID) {
        let mut inner = lock!(self.inner);
        let inner = &mut *inner;

        inner.early.remove(peer);

        if let Some(bitfield) = inner.bitfields.remove(peer) {
            Self::count_out(&mut inner.counts, &bitfield);
        }
    }
}
