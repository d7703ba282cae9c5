//! Pluggable round algorithm.
//!
//! A [`Strategy`] owns the four protocol touch-points of a round:
//! `prepare`/`accept` run on a follower receiving phase messages, and
//! `promise`/`accepted` run on the leader folding responses into its tally.
//! The default is classic basic Paxos; tests inject implementations that
//! misbehave (close the connection, stay silent) to exercise the failure
//! paths.

use paxkit_core::{AcceptorCore, Command, Endpoint, ProposalId, RoundCore, RoundStep};

/// The user-supplied workload callback.
///
/// Must be deterministic and side-effect-free with respect to any state it
/// does not own: every live node executes it on the same workload and the
/// replies are expected to agree.
pub type WorkloadCallback = dyn Fn(&[u8]) -> Vec<u8> + Send + Sync;

/// What a follower-side handler wants done with the connection the phase
/// message arrived on.
pub enum StrategyAction {
    /// Write this command back.
    Respond(Command),
    /// Close the connection without responding.
    Close,
    /// Do nothing; the leader's phase deadline will handle the silence.
    Ignore,
}

/// Follower-side state handed to `prepare`/`accept`.
pub struct FollowerContext<'a> {
    pub acceptor: &'a mut AcceptorCore,
    pub callback: &'a WorkloadCallback,
}

/// The round algorithm of one node.
pub trait Strategy: Send {
    /// A `prepare` arrived from the leader.
    fn prepare(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        digest: u64,
    ) -> StrategyAction;

    /// An `accept` arrived from the leader. Granting it executes the
    /// workload callback and carries the reply back.
    fn accept(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        workload: &[u8],
    ) -> StrategyAction;

    /// A `promise` arrived for the round this leader is driving.
    fn promise(&mut self, round: &mut RoundCore, from: Endpoint, granted: bool) -> RoundStep;

    /// An `accepted` arrived for the round this leader is driving.
    fn accepted(
        &mut self,
        round: &mut RoundCore,
        from: Endpoint,
        granted: bool,
        reply: Vec<u8>,
    ) -> RoundStep;
}

/// Creates one [`Strategy`] per node at startup.
pub trait StrategyFactory: Send + Sync {
    fn create(&self) -> Box<dyn Strategy>;
}

/// Classic two-phase Paxos; the default strategy.
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicPaxos;

impl Strategy for BasicPaxos {
    fn prepare(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        _digest: u64,
    ) -> StrategyAction {
        let granted = follower.acceptor.prepare(id);
        StrategyAction::Respond(Command::Promise { id, granted })
    }

    fn accept(
        &mut self,
        follower: &mut FollowerContext<'_>,
        id: ProposalId,
        workload: &[u8],
    ) -> StrategyAction {
        let granted = follower.acceptor.accept(id);
        let reply = if granted {
            (follower.callback)(workload)
        } else {
            Vec::new()
        };
        StrategyAction::Respond(Command::Accepted { id, granted, reply })
    }

    fn promise(&mut self, round: &mut RoundCore, from: Endpoint, granted: bool) -> RoundStep {
        round.handle_promise(from, granted)
    }

    fn accepted(
        &mut self,
        round: &mut RoundCore,
        from: Endpoint,
        granted: bool,
        reply: Vec<u8>,
    ) -> RoundStep {
        round.handle_accepted(from, granted, reply)
    }
}

/// Factory producing [`BasicPaxos`].
#[derive(Clone, Copy, Debug, Default)]
pub struct BasicPaxosFactory;

impl StrategyFactory for BasicPaxosFactory {
    fn create(&self) -> Box<dyn Strategy> {
        Box::new(BasicPaxos)
    }
}
