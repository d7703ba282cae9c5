//! Leader-election bookkeeping.
//!
//! Election is deterministic: every node computes the same candidate (the
//! highest-ordered alive endpoint) from its own view, so the protocol here
//! only has to agree on terms. A candidate claims a fresh term, voters grant
//! the claim when the term is new and the claimant matches their own
//! computation, and a majority of grants lets the claimant announce itself.
//! Concurrent terms resolve toward the higher `(term, claimant)` pair.

use std::collections::BTreeSet;

use crate::endpoint::Endpoint;

/// A claim this node is currently driving.
#[derive(Clone, Debug)]
pub struct PendingClaim {
    pub term: u64,
    acks: BTreeSet<Endpoint>,
}

/// Term bookkeeping for one node, on both the claimant and the voter side.
#[derive(Clone, Debug, Default)]
pub struct ElectionState {
    /// Highest `(term, claimant)` this node has granted or adopted.
    accepted: Option<(u64, Endpoint)>,
    claim: Option<PendingClaim>,
}

impl ElectionState {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The term this node lives in: the highest it has granted or adopted.
    #[must_use]
    pub fn current_term(&self) -> u64 {
        self.accepted.map_or(0, |(term, _)| term)
    }

    /// The term a fresh claim from this node should carry.
    #[must_use]
    pub fn next_term(&self) -> u64 {
        let claimed = self.claim.as_ref().map_or(0, |c| c.term);
        self.current_term().max(claimed) + 1
    }

    /// Start driving a claim for `term`.
    pub fn begin_claim(&mut self, term: u64) {
        self.claim = Some(PendingClaim {
            term,
            acks: BTreeSet::new(),
        });
    }

    #[must_use]
    pub fn claim_in_flight(&self) -> Option<u64> {
        self.claim.as_ref().map(|c| c.term)
    }

    /// Drop the in-flight claim without winning it.
    pub fn abandon_claim(&mut self) {
        self.claim = None;
    }

    /// Record a grant for our in-flight claim. Returns `true` the moment the
    /// grants reach `quorum`; the claimant then adopts the term and
    /// announces.
    pub fn record_ack(&mut self, from: Endpoint, term: u64, quorum: usize) -> bool {
        let Some(claim) = &mut self.claim else {
            return false;
        };
        if claim.term != term {
            return false;
        }
        claim.acks.insert(from);
        claim.acks.len() >= quorum
    }

    /// Voter side: grant a claim iff its `(term, claimant)` beats everything
    /// granted before (equal terms break toward the higher endpoint) and the
    /// claimant matches this node's own candidate computation.
    pub fn consider_claim(
        &mut self,
        claimant: Endpoint,
        term: u64,
        our_candidate: Option<Endpoint>,
    ) -> bool {
        if our_candidate != Some(claimant) {
            return false;
        }
        if self.accepted.is_some_and(|acc| (term, claimant) <= acc) {
            return false;
        }
        self.accepted = Some((term, claimant));
        true
    }

    /// Adopt an announced leader iff the announcement's term is at least as
    /// high as everything granted before. Returns whether to adopt.
    pub fn consider_announce(&mut self, leader: Endpoint, term: u64) -> bool {
        if self.accepted.is_some_and(|(acc_term, _)| term < acc_term) {
            return false;
        }
        self.accepted = Some((term, leader));
        // Any claim of ours at or below the announced term is beaten.
        if self.claim.as_ref().is_some_and(|c| c.term <= term) {
            self.claim = None;
        }
        true
    }

    /// Claimant side: adopt our own won term.
    pub fn adopt_won_claim(&mut self, us: Endpoint, term: u64) {
        self.accepted = Some((term, us));
        self.claim = None;
    }
}
