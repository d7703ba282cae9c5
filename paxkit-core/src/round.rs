//! Round state machines: the leader-side tally and the follower-side rule.
//!
//! [`RoundCore`] tracks one two-phase commit from the leader's seat. It is
//! push-based: the driver feeds in promises, accepts, peer failures, and
//! deadline expiry, and acts on the returned [`RoundStep`]. [`AcceptorCore`]
//! is the whole of a follower's obligation: never go back on a promise.

use std::collections::{BTreeMap, BTreeSet};

use crate::command::ProposalId;
use crate::endpoint::Endpoint;

/// Phase of a round. `Completed` and `Failed` are terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RoundPhase {
    Preparing,
    Accepting,
    Completed,
    Failed,
}

/// What the driver should do after feeding an event into the tally.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RoundStep {
    /// Keep collecting responses.
    Pending,
    /// Prepare quorum reached: send `Accept` to every participant.
    StartAccept,
    /// Accept quorum reached: deliver this reply to the requester.
    Deliver(Vec<u8>),
    /// The round can no longer reach quorum (or its deadline passed).
    Abort,
}

/// Leader-side tally of one round.
#[derive(Clone, Debug)]
pub struct RoundCore {
    id: ProposalId,
    digest: u64,
    phase: RoundPhase,
    /// Peers the round was opened against (alive at round start).
    participants: BTreeSet<Endpoint>,
    /// Strict majority of the full membership, fixed at round start.
    quorum: usize,
    promised: BTreeSet<Endpoint>,
    replies: BTreeMap<Endpoint, Vec<u8>>,
    /// Participants that rejected or failed; they will not respond again.
    lost: BTreeSet<Endpoint>,
}

impl RoundCore {
    #[must_use]
    pub fn new(
        id: ProposalId,
        digest: u64,
        participants: BTreeSet<Endpoint>,
        quorum: usize,
    ) -> Self {
        Self {
            id,
            digest,
            phase: RoundPhase::Preparing,
            participants,
            quorum,
            promised: BTreeSet::new(),
            replies: BTreeMap::new(),
            lost: BTreeSet::new(),
        }
    }

    #[must_use]
    pub fn id(&self) -> ProposalId {
        self.id
    }

    #[must_use]
    pub fn digest(&self) -> u64 {
        self.digest
    }

    #[must_use]
    pub fn phase(&self) -> RoundPhase {
        self.phase
    }

    pub fn participants(&self) -> impl Iterator<Item = Endpoint> + '_ {
        self.participants.iter().copied()
    }

    /// Feed a `Promise` response.
    pub fn handle_promise(&mut self, from: Endpoint, granted: bool) -> RoundStep {
        if self.phase != RoundPhase::Preparing || !self.participants.contains(&from) {
            return RoundStep::Pending;
        }
        if granted {
            self.promised.insert(from);
        } else {
            self.lost.insert(from);
        }
        self.check_prepare()
    }

    /// Feed an `Accepted` response. The reply is the follower's callback
    /// output.
    pub fn handle_accepted(&mut self, from: Endpoint, granted: bool, reply: Vec<u8>) -> RoundStep {
        if self.phase != RoundPhase::Accepting || !self.participants.contains(&from) {
            return RoundStep::Pending;
        }
        if granted {
            self.replies.insert(from, reply);
        } else {
            self.lost.insert(from);
        }
        self.check_accept()
    }

    /// A participant's connection failed mid-round: it counts as having not
    /// responded, and the round continues while quorum is still reachable.
    pub fn handle_peer_failure(&mut self, from: Endpoint) -> RoundStep {
        if !self.participants.contains(&from) {
            return RoundStep::Pending;
        }
        self.lost.insert(from);
        self.promised.remove(&from);
        self.replies.remove(&from);
        match self.phase {
            RoundPhase::Preparing => self.check_prepare(),
            RoundPhase::Accepting => self.check_accept(),
            RoundPhase::Completed | RoundPhase::Failed => RoundStep::Pending,
        }
    }

    /// The current phase's deadline passed.
    pub fn expire(&mut self) -> RoundStep {
        match self.phase {
            RoundPhase::Preparing | RoundPhase::Accepting => {
                self.phase = RoundPhase::Failed;
                RoundStep::Abort
            }
            RoundPhase::Completed | RoundPhase::Failed => RoundStep::Pending,
        }
    }

    fn reachable(&self) -> bool {
        self.participants.len() - self.lost.len() >= self.quorum
    }

    fn check_prepare(&mut self) -> RoundStep {
        if self.promised.len() >= self.quorum {
            self.phase = RoundPhase::Accepting;
            return RoundStep::StartAccept;
        }
        if self.reachable() {
            RoundStep::Pending
        } else {
            self.phase = RoundPhase::Failed;
            RoundStep::Abort
        }
    }

    fn check_accept(&mut self) -> RoundStep {
        if self.replies.len() >= self.quorum {
            self.phase = RoundPhase::Completed;
            return RoundStep::Deliver(self.select_reply());
        }
        if self.reachable() {
            RoundStep::Pending
        } else {
            self.phase = RoundPhase::Failed;
            RoundStep::Abort
        }
    }

    /// Reply selection: if every collected reply is byte-identical, that
    /// value; otherwise the reply of the lowest-ordered endpoint. The user
    /// callback is contractually deterministic, so divergence is a user bug,
    /// but the pick must still be defined. Both cases reduce to the first
    /// entry of the reply map, which iterates in endpoint order.
    fn select_reply(&self) -> Vec<u8> {
        self.replies.values().next().cloned().unwrap_or_default()
    }
}

/// Follower-side acceptance rule.
///
/// A `prepare` is granted only above the highest promise made so far; an
/// `accept` is granted at or above it, so the accept that follows a
/// proposer's own prepare is not self-rejected. Proposal ids therefore never
/// regress within a term from this node's point of view.
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptorCore {
    promised: Option<ProposalId>,
}

impl AcceptorCore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn promised(&self) -> Option<ProposalId> {
        self.promised
    }

    /// Handle a `prepare`; returns whether to promise.
    pub fn prepare(&mut self, id: ProposalId) -> bool {
        if self.promised.is_some_and(|p| id <= p) {
            return false;
        }
        self.promised = Some(id);
        true
    }

    /// Handle an `accept`; returns whether to accept.
    pub fn accept(&mut self, id: ProposalId) -> bool {
        if self.promised.is_some_and(|p| id < p) {
            return false;
        }
        self.promised = Some(id);
        true
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    fn pid(term: u64, sequence: u64) -> ProposalId {
        ProposalId::new(term, sequence, ep(1339))
    }

    fn round_of_three() -> RoundCore {
        let participants = [ep(1337), ep(1338), ep(1339)].into_iter().collect();
        RoundCore::new(pid(1, 1), 42, participants, 2)
    }

    #[test]
    fn majority_promises_then_majority_accepts_delivers() {
        let mut round = round_of_three();

        assert_eq!(round.handle_promise(ep(1337), true), RoundStep::Pending);
        assert_eq!(round.handle_promise(ep(1339), true), RoundStep::StartAccept);
        assert_eq!(round.phase(), RoundPhase::Accepting);

        assert_eq!(
            round.handle_accepted(ep(1337), true, b"bar".to_vec()),
            RoundStep::Pending
        );
        assert_eq!(
            round.handle_accepted(ep(1339), true, b"bar".to_vec()),
            RoundStep::Deliver(b"bar".to_vec())
        );
        assert_eq!(round.phase(), RoundPhase::Completed);
    }

    #[test]
    fn one_failure_of_three_still_completes() {
        let mut round = round_of_three();

        assert_eq!(round.handle_peer_failure(ep(1337)), RoundStep::Pending);
        assert_eq!(round.handle_promise(ep(1338), true), RoundStep::Pending);
        assert_eq!(round.handle_promise(ep(1339), true), RoundStep::StartAccept);

        round.handle_accepted(ep(1338), true, b"bar".to_vec());
        assert_eq!(
            round.handle_accepted(ep(1339), true, b"bar".to_vec()),
            RoundStep::Deliver(b"bar".to_vec())
        );
    }

    #[test]
    fn losing_quorum_aborts() {
        let mut round = round_of_three();

        assert_eq!(round.handle_peer_failure(ep(1337)), RoundStep::Pending);
        assert_eq!(round.handle_peer_failure(ep(1338)), RoundStep::Abort);
        assert_eq!(round.phase(), RoundPhase::Failed);

        // Terminal rounds ignore further events.
        assert_eq!(round.handle_promise(ep(1339), true), RoundStep::Pending);
        assert_eq!(round.expire(), RoundStep::Pending);
    }

    #[test]
    fn rejections_count_against_quorum() {
        let mut round = round_of_three();

        assert_eq!(round.handle_promise(ep(1337), false), RoundStep::Pending);
        assert_eq!(round.handle_promise(ep(1338), false), RoundStep::Abort);
    }

    #[test]
    fn expiry_fails_the_round() {
        let mut round = round_of_three();
        assert_eq!(round.expire(), RoundStep::Abort);
        assert_eq!(round.phase(), RoundPhase::Failed);
    }

    #[test]
    fn diverging_replies_pick_the_lowest_endpoint() {
        let mut round = round_of_three();
        round.handle_promise(ep(1337), true);
        round.handle_promise(ep(1338), true);

        round.handle_accepted(ep(1339), true, b"from-high".to_vec());
        let step = round.handle_accepted(ep(1337), true, b"from-low".to_vec());
        assert_eq!(step, RoundStep::Deliver(b"from-low".to_vec()));
    }

    #[test]
    fn acceptor_never_regresses_a_promise() {
        let mut acceptor = AcceptorCore::new();

        assert!(acceptor.prepare(pid(1, 1)));
        // The accept that follows our own prepare is granted.
        assert!(acceptor.accept(pid(1, 1)));
        // Anything at or below the promise is rejected at prepare.
        assert!(!acceptor.prepare(pid(1, 1)));
        assert!(!acceptor.prepare(pid(1, 0)));
        // A lower accept is rejected.
        assert!(!acceptor.accept(pid(1, 0)));
        // A higher term supersedes.
        assert!(acceptor.prepare(pid(2, 0)));
        assert_eq!(acceptor.promised(), Some(pid(2, 0)));
    }
}
