//! Quorum membership view.
//!
//! Each node keeps one [`QuorumView`]: the configured membership, per-peer
//! liveness as observed by handshakes, and the single designated leader.
//! The view is pure bookkeeping; the heartbeat driver feeds it transitions
//! and the round/queue layers gate on [`QuorumView::is_ready`].

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use crate::endpoint::Endpoint;

/// Observed liveness of a peer.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub enum Liveness {
    /// Never handshaked, or state was reset.
    #[default]
    Unknown,
    Alive,
    Dead,
}

/// Per-peer record owned by the view.
#[derive(Clone, Debug, Default)]
pub struct PeerRecord {
    pub liveness: Liveness,
    /// When the last successful handshake completed.
    pub last_handshake: Option<Instant>,
    /// Leader this peer reported in its last handshake response.
    pub reported_leader: Option<Endpoint>,
}

/// Snapshot of a view, for status queries and tests.
#[derive(Clone, Debug)]
pub struct QuorumStatus {
    pub leader: Option<Endpoint>,
    pub peers: Vec<(Endpoint, Liveness)>,
    pub is_ready: bool,
}

/// The membership view: an ordered set of peer records plus the current
/// leader designation.
///
/// Invariants, holding between handler invocations:
/// - at most one record per endpoint (map key);
/// - the leader, when set, names a peer currently marked alive.
#[derive(Clone, Debug, Default)]
pub struct QuorumView {
    peers: BTreeMap<Endpoint, PeerRecord>,
    leader: Option<Endpoint>,
}

impl QuorumView {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare a member. Idempotent.
    pub fn add(&mut self, endpoint: Endpoint) {
        self.peers.entry(endpoint).or_default();
    }

    #[must_use]
    pub fn contains(&self, endpoint: Endpoint) -> bool {
        self.peers.contains_key(&endpoint)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    /// Endpoints of all configured members, in endpoint order.
    pub fn members(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.peers.keys().copied()
    }

    /// Strict-majority threshold over the configured membership.
    #[must_use]
    pub fn majority(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    #[must_use]
    pub fn is_alive(&self, endpoint: Endpoint) -> bool {
        self.peers
            .get(&endpoint)
            .is_some_and(|p| p.liveness == Liveness::Alive)
    }

    /// Alive peers, in endpoint order.
    #[must_use]
    pub fn live_peers(&self) -> BTreeSet<Endpoint> {
        self.peers
            .iter()
            .filter(|(_, p)| p.liveness == Liveness::Alive)
            .map(|(ep, _)| *ep)
            .collect()
    }

    /// The alive peer set, when it forms a strict majority of the
    /// membership.
    #[must_use]
    pub fn live_majority(&self) -> Option<BTreeSet<Endpoint>> {
        let live = self.live_peers();
        (live.len() >= self.majority()).then_some(live)
    }

    pub fn mark_alive(&mut self, endpoint: Endpoint) {
        if let Some(record) = self.peers.get_mut(&endpoint) {
            record.liveness = Liveness::Alive;
            record.last_handshake = Some(Instant::now());
        }
    }

    /// Mark a peer dead. Clears the leader designation if the dead peer was
    /// the leader, keeping the leader-is-alive invariant.
    ///
    /// Returns `true` when this lost the current leader; the caller is
    /// expected to [`reset_state`](Self::reset_state) in response.
    pub fn mark_dead(&mut self, endpoint: Endpoint) -> bool {
        if let Some(record) = self.peers.get_mut(&endpoint) {
            record.liveness = Liveness::Dead;
        }
        if self.leader == Some(endpoint) {
            self.leader = None;
            return true;
        }
        false
    }

    #[must_use]
    pub fn leader(&self) -> Option<Endpoint> {
        self.leader
    }

    /// Designate a leader. A `Some` leader must be alive in this view.
    pub fn set_leader(&mut self, leader: Option<Endpoint>) {
        debug_assert!(
            leader.is_none_or(|ep| self.is_alive(ep)),
            "leader must be an alive peer"
        );
        self.leader = leader;
    }

    /// Ready means a strict majority of peers are alive and an alive leader
    /// is designated.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.live_majority().is_some()
            && self.leader.is_some_and(|ep| self.is_alive(ep))
    }

    #[must_use]
    pub fn needs_new_leader(&self) -> bool {
        !self.leader.is_some_and(|ep| self.is_alive(ep))
    }

    #[must_use]
    pub fn we_are_leader(&self, us: Endpoint) -> bool {
        self.leader == Some(us)
    }

    /// The deterministic election candidate: the alive peer with the
    /// highest endpoint. Every node computes the same answer from the same
    /// liveness picture.
    #[must_use]
    pub fn candidate(&self) -> Option<Endpoint> {
        self.live_peers().into_iter().next_back()
    }

    /// Drop the leader designation and return every peer to `Unknown`,
    /// forcing a re-handshake. Invoked when the current leader is lost.
    pub fn reset_state(&mut self) {
        self.leader = None;
        for record in self.peers.values_mut() {
            record.liveness = Liveness::Unknown;
            record.reported_leader = None;
        }
    }

    /// Record who a peer claimed the leader was in its handshake response.
    pub fn record_reported_leader(&mut self, from: Endpoint, leader: Option<Endpoint>) {
        if let Some(record) = self.peers.get_mut(&from) {
            record.reported_leader = leader;
        }
    }

    /// The endpoint reported as leader by a strict majority of the
    /// configured membership, provided it is alive in this view. Used by
    /// clients, which observe leadership rather than voting on it.
    #[must_use]
    pub fn majority_reported_leader(&self) -> Option<Endpoint> {
        let mut tally: BTreeMap<Endpoint, usize> = BTreeMap::new();
        for record in self.peers.values() {
            if let Some(reported) = record.reported_leader {
                *tally.entry(reported).or_default() += 1;
            }
        }
        tally
            .into_iter()
            .find(|(ep, votes)| *votes >= self.majority() && self.is_alive(*ep))
            .map(|(ep, _)| ep)
    }

    #[must_use]
    pub fn status(&self) -> QuorumStatus {
        QuorumStatus {
            leader: self.leader,
            peers: self
                .peers
                .iter()
                .map(|(ep, record)| (*ep, record.liveness))
                .collect(),
            is_ready: self.is_ready(),
        }
    }
}
