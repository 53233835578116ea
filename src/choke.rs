//! Tit-for-tat unchoke set with a rotating optimistic slot.

use crate::data_structures::ID;
use crate::lock;
use rand::seq::{IteratorRandom, SliceRandom};
use rand::{thread_rng, Rng};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::debug;

/// Transitions a tick produced. Peers in neither list keep their state.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ChokeDecision {
    pub unchoke: Vec<ID>,
    pub choke: Vec<ID>,
}

#[derive(Debug, Default)]
struct PeerChoke {
    interested: bool,
    finished: bool,
    contribution: u64,
}

#[derive(Debug, Default)]
struct Inner {
    peers: HashMap<ID, PeerChoke>,
    unchoked: HashSet<ID>,
    optimistic: Option<ID>,
    ticks: u64,
}

#[derive(Debug, Clone)]
pub struct ChokePolicy {
    max_unchoked: usize,
    optimistic_rotation_ticks: u64,
    inner: Arc<StdMutex<Inner>>,
}

impl ChokePolicy {
    pub fn new(max_unchoked: usize, optimistic_rotation_ticks: u32) -> Self {
        Self {
            max_unchoked,
            optimistic_rotation_ticks: std::cmp::max(optimistic_rotation_ticks, 1) as u64,
            inner: Arc::new(StdMutex::new(Inner::default())),
        }
    }

    pub fn add_peer(&self, peer: ID) {
        lock!(self.inner).peers.entry(peer).or_default();
    }

    pub fn remove_peer(&self, peer: &ID) {
        let mut inner = lock!(self.inner);

        inner.peers.remove(peer);
        inner.unchoked.remove(peer);
        if inner.optimistic == Some(*peer) {
            inner.optimistic = None;
        }
    }

    pub fn set_interested(&self, peer: ID, interested: bool) {
        lock!(self.inner).peers.entry(peer).or_default().interested = interested;
    }

    /// Peer holds everything, uploading to it is pointless.
    pub fn set_finished(&self, peer: ID) {
        lock!(self.inner).peers.entry(peer).or_default().finished = true;
    }

    pub fn record_contribution(&self, peer: ID, bytes: u64) {
        lock!(self.inner).peers.entry(peer).or_default().contribution += bytes;
    }

    pub fn is_unchoked(&self, peer: &ID) -> bool {
        lock!(self.inner).unchoked.contains(peer)
    }

    pub fn unchoked(&self) -> Vec<ID> {
        let mut rv: Vec<ID> = lock!(self.inner).unchoked.iter().copied().collect();
        rv.sort();
        rv
    }

    pub fn tick(&self, seeding: bool) -> ChokeDecision {
        self.tick_with(seeding, &mut thread_rng())
    }

    /// Recomputes the unchoke set and starts a fresh contribution window.
    pub fn tick_with<R: Rng + ?Sized>(&self, seeding: bool, rng: &mut R) -> ChokeDecision {
        let mut inner = lock!(self.inner);
        inner.ticks += 1;

        let mut candidates: Vec<(ID, u64)> = inner
            .peers
            .iter()
            .filter(|(_, p)| p.interested && !p.finished)
            .map(|(id, p)| (*id, p.contribution))
            .collect();
        candidates.sort_by(|(l_id, l), (r_id, r)| r.cmp(l).then(l_id.cmp(r_id)));

        let regular: HashSet<ID> = if seeding {
            candidates
                .iter()
                .map(|(id, _)| *id)
                .choose_multiple(rng, self.max_unchoked)
                .into_iter()
                .collect()
        } else {
            candidates
                .iter()
                .take(self.max_unchoked)
                .map(|(id, _)| *id)
                .collect()
        };

        let outside: Vec<ID> = candidates
            .iter()
            .map(|(id, _)| *id)
            .filter(|id| !regular.contains(id))
            .collect();

        let optimistic = if inner.ticks % self.optimistic_rotation_ticks == 0 {
            outside.choose(rng).copied()
        } else {
            inner.optimistic.filter(|id| outside.contains(id))
        };

        let mut unchoked = regular;
        if let Some(id) = optimistic {
            unchoked.insert(id);
        }

        let mut decision = ChokeDecision {
            unchoke: unchoked.difference(&inner.unchoked).copied().collect(),
            choke: inner.unchoked.difference(&unchoked).copied().collect(),
        };
        decision.unchoke.sort();
        decision.choke.sort();

        debug!(
            tick = inner.ticks,
            unchoked = unchoked.len(),
            optimistic = ?optimistic,
            "choke tick"
        );

        inner.unchoked = unchoked;
        inner.optimistic = optimistic;
        for peer in inner.peers.values_mut() {
            peer.contribution = 0;
        }

        decision
    }
}

#[cfg(test)]
mod tests {
    use super::ChokePolicy;
    use crate::data_structures::ID;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn peer(n: u8) -> ID {
        ID::new([n; 20])
    }

    fn three_interested(policy: &ChokePolicy) {
        for n in 1..=3 {
            policy.set_interested(peer(n), true);
        }
    }

    fn contribute(policy: &ChokePolicy) {
        policy.record_contribution(peer(1), 500);
        policy.record_contribution(peer(2), 100);
        policy.record_contribution(peer(3), 0);
    }

    #[test]
    fn top_contributors_then_optimistic() {
        let policy = ChokePolicy::new(2, 3);
        let mut rng = StdRng::seed_from_u64(1);
        three_interested(&policy);

        contribute(&policy);
        let decision = policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(1), peer(2)], decision.unchoke);
        assert!(decision.choke.is_empty());
        assert_eq!(vec![peer(1), peer(2)], policy.unchoked());

        contribute(&policy);
        let decision = policy.tick_with(false, &mut rng);
        assert!(decision.unchoke.is_empty());
        assert_eq!(vec![peer(1), peer(2)], policy.unchoked());

        contribute(&policy);
        let decision = policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(3)], decision.unchoke);
        assert_eq!(vec![peer(1), peer(2), peer(3)], policy.unchoked());
    }

    #[test]
    fn ranking_follows_last_tick_only() {
        let policy = ChokePolicy::new(1, 3);
        let mut rng = StdRng::seed_from_u64(2);
        three_interested(&policy);

        policy.record_contribution(peer(1), 10_000);
        policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(1)], policy.unchoked());

        policy.record_contribution(peer(2), 10);
        let decision = policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(2)], decision.unchoke);
        assert_eq!(vec![peer(1)], decision.choke);
    }

    #[test]
    fn seeding_picks_random_interested() {
        let policy = ChokePolicy::new(2, 3);
        let mut rng = StdRng::seed_from_u64(3);
        three_interested(&policy);
        policy.set_interested(peer(4), false);

        let decision = policy.tick_with(true, &mut rng);

        assert_eq!(2, decision.unchoke.len());
        assert!(!decision.unchoke.contains(&peer(4)));
    }

    #[test]
    fn uninterested_finished_and_gone_peers_are_skipped() {
        let policy = ChokePolicy::new(4, 3);
        let mut rng = StdRng::seed_from_u64(4);
        three_interested(&policy);
        policy.set_finished(peer(2));

        policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(1), peer(3)], policy.unchoked());

        policy.set_interested(peer(3), false);
        let decision = policy.tick_with(false, &mut rng);
        assert_eq!(vec![peer(3)], decision.choke);

        policy.remove_peer(&peer(1));
        assert!(!policy.is_unchoked(&peer(1)));
        assert!(policy.unchoked().is_empty());
    }
}
