//! The server-side node actor.
//!
//! One task owns every piece of protocol state for a node: the quorum view,
//! election bookkeeping, the follower's acceptance rule, and the round the
//! node drives while it leads. Connections, timers, and API handles talk to
//! it through channels; between two handler invocations nothing else can
//! observe or mutate the state, which is what the protocol's invariants are
//! stated against.
//!
//! Every heartbeat tick performs, in order: a handshake sweep over all
//! configured peers (dialing the missing ones), an election step when the
//! view has no usable leader, and a leadership re-announcement when this
//! node leads.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use paxkit_core::election::ElectionState;
use paxkit_core::{
    AcceptorCore, Command, Endpoint, PROTOCOL_MAGIC, PROTOCOL_VERSION, ProposalId, QuorumStatus,
    QuorumView, RoundCore, RoundStep, WireError, workload_digest,
};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Configuration;
use crate::connection::{CommandLink, ConnKey, NetEvent, spawn_accepted, spawn_dial};
use crate::strategy::{FollowerContext, Strategy, StrategyAction, WorkloadCallback};

/// Interval at which pending deadlines (handshakes, round phases) are
/// checked.
const DEADLINE_TICK: Duration = Duration::from_millis(50);

/// Requests from the `Server` handle into the actor.
pub(crate) enum ServerRequest {
    Status(oneshot::Sender<QuorumStatus>),
}

/// The round this node is currently driving as leader.
struct ActiveRound {
    core: RoundCore,
    workload: Vec<u8>,
    /// Inbound connection the `request_initiate` arrived on.
    origin: u64,
    deadline: Instant,
}

pub(crate) struct NodeActor {
    me: Endpoint,
    config: Configuration,
    callback: Arc<WorkloadCallback>,
    strategy: Box<dyn Strategy>,

    view: QuorumView,
    election: ElectionState,
    acceptor: AcceptorCore,

    /// Pooled outbound connections to peers.
    links: HashMap<Endpoint, CommandLink>,
    dialing: HashSet<Endpoint>,
    /// Accepted connections: peers dialing us, and clients.
    conns: HashMap<u64, CommandLink>,
    /// Peers with an unanswered handshake and the instant we give up.
    pending_handshakes: HashMap<Endpoint, Instant>,
    /// Peers observed failing during the current handler; processed after
    /// it returns so failure handling never re-enters itself.
    pending_failures: Vec<Endpoint>,

    round: Option<ActiveRound>,
    backlog: VecDeque<(u64, Vec<u8>)>,
    sequence: u64,

    events_tx: mpsc::Sender<NetEvent>,
    events_rx: mpsc::Receiver<NetEvent>,
    requests_rx: mpsc::Receiver<ServerRequest>,
    cancel: CancellationToken,
}

impl NodeActor {
    pub(crate) fn new(
        me: Endpoint,
        peers: &[Endpoint],
        callback: Arc<WorkloadCallback>,
        config: Configuration,
        requests_rx: mpsc::Receiver<ServerRequest>,
        cancel: CancellationToken,
    ) -> Self {
        let mut view = QuorumView::new();
        // The node is its own peer: it dials itself over loopback and its
        // own replies arrive like anyone else's.
        view.add(me);
        for peer in peers {
            view.add(*peer);
        }

        let strategy = config.strategy_factory.create();
        let (events_tx, events_rx) = mpsc::channel(256);

        Self {
            me,
            config,
            callback,
            strategy,
            view,
            election: ElectionState::new(),
            acceptor: AcceptorCore::new(),
            links: HashMap::new(),
            dialing: HashSet::new(),
            conns: HashMap::new(),
            pending_handshakes: HashMap::new(),
            pending_failures: Vec::new(),
            round: None,
            backlog: VecDeque::new(),
            sequence: 0,
            events_tx,
            events_rx,
            requests_rx,
            cancel,
        }
    }

    pub(crate) async fn run(mut self, ready: oneshot::Sender<Result<Endpoint, std::io::Error>>) {
        let listener = match TcpListener::bind(self.me.addr()).await {
            Ok(listener) => listener,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let local = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                let _ = ready.send(Err(e));
                return;
            }
        };
        let _ = ready.send(Ok(Endpoint::from(local)));
        info!(me = %self.me, "node listening");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadlines = tokio::time::interval(DEADLINE_TICK);
        deadlines.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut next_conn_id: u64 = 0;

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                _ = heartbeat.tick() => self.on_heartbeat(),

                _ = deadlines.tick() => self.on_deadlines(),

                accepted = listener.accept() => match accepted {
                    Ok((stream, remote)) => {
                        let id = next_conn_id;
                        next_conn_id += 1;
                        trace!(%remote, id, "accepted connection");
                        spawn_accepted(
                            id,
                            stream,
                            self.config.max_frame_size,
                            self.events_tx.clone(),
                            self.cancel.clone(),
                        );
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                },

                Some(event) = self.events_rx.recv() => self.on_net(event),

                request = self.requests_rx.recv() => match request {
                    Some(ServerRequest::Status(tx)) => {
                        let _ = tx.send(self.view.status());
                    }
                    // The server handle is gone; stop serving.
                    None => break,
                },
            }
        }

        self.drain();
    }

    // ------------------------------------------------------------------
    // Heartbeat: handshake sweep, election, announcement
    // ------------------------------------------------------------------

    fn on_heartbeat(&mut self) {
        self.sweep_handshakes();
        self.drive_election();
        if self.view.we_are_leader(self.me) {
            self.announce_leadership();
        }
        self.flush_failures();
    }

    fn sweep_handshakes(&mut self) {
        let deadline = Instant::now() + self.config.handshake_deadline();
        for peer in self.view.members().collect::<Vec<_>>() {
            if let Some(link) = self.links.get(&peer) {
                if self.pending_handshakes.contains_key(&peer) {
                    continue;
                }
                if link.send(Command::handshake_start(Some(self.me))) {
                    self.pending_handshakes.insert(peer, deadline);
                } else {
                    self.pending_failures.push(peer);
                }
            } else if self.dialing.insert(peer) {
                spawn_dial(
                    peer,
                    self.config.max_frame_size,
                    self.config.handshake_deadline(),
                    self.events_tx.clone(),
                    self.cancel.clone(),
                );
            }
        }
    }

    fn drive_election(&mut self) {
        if !self.view.needs_new_leader() {
            self.election.abandon_claim();
            return;
        }
        // A claim that has not won by the next tick is stale; retry with a
        // fresh term.
        self.election.abandon_claim();
        if self.view.candidate() != Some(self.me) {
            return;
        }
        let term = self.election.next_term();
        debug!(term, "claiming leadership");
        self.election.begin_claim(term);
        let claim = Command::LeaderClaim {
            candidate: self.me,
            term,
        };
        for peer in self.view.live_peers() {
            self.queue_send(peer, claim.clone());
        }
    }

    fn announce_leadership(&mut self) {
        let announce = Command::LeaderAnnounce {
            leader: self.me,
            term: self.election.current_term(),
        };
        for peer in self.view.live_peers() {
            self.queue_send(peer, announce.clone());
        }
    }

    // ------------------------------------------------------------------
    // Network events
    // ------------------------------------------------------------------

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened { key, link } => match key {
                ConnKey::Peer(peer) => {
                    self.dialing.remove(&peer);
                    // Handshake right away instead of waiting for the tick.
                    if link.send(Command::handshake_start(Some(self.me))) {
                        self.pending_handshakes
                            .insert(peer, Instant::now() + self.config.handshake_deadline());
                        self.links.insert(peer, link);
                    } else {
                        self.pending_failures.push(peer);
                    }
                }
                ConnKey::Inbound(id) => {
                    self.conns.insert(id, link);
                }
            },
            NetEvent::DialFailed { peer } => {
                self.dialing.remove(&peer);
                self.pending_failures.push(peer);
            }
            NetEvent::Frame { key, command } => match key {
                ConnKey::Peer(peer) => self.on_peer_response(peer, command),
                ConnKey::Inbound(id) => self.on_inbound_command(id, command),
            },
            NetEvent::Closed { key } => match key {
                ConnKey::Peer(peer) => {
                    if self.links.remove(&peer).is_some() {
                        self.pending_failures.push(peer);
                    }
                }
                ConnKey::Inbound(id) => {
                    // A peer or client went away. An active round keeps
                    // running; its reply delivery is best-effort.
                    self.conns.remove(&id);
                }
            },
        }
        self.flush_failures();
    }

    /// Commands arriving on pooled peer connections: responses to exchanges
    /// this node initiated.
    fn on_peer_response(&mut self, peer: Endpoint, command: Command) {
        match command {
            Command::HandshakeResponse { leader, .. } => {
                self.pending_handshakes.remove(&peer);
                self.view.mark_alive(peer);
                self.view.record_reported_leader(peer, leader);
            }
            Command::LeaderClaimAck { term, granted } => {
                if granted && self.election.record_ack(peer, term, self.view.majority()) {
                    self.win_election(term);
                }
            }
            Command::Promise { id, granted } => {
                let step = match &mut self.round {
                    Some(active) if active.core.id() == id => {
                        Some(self.strategy.promise(&mut active.core, peer, granted))
                    }
                    _ => None,
                };
                if let Some(step) = step {
                    self.apply_round_step(step);
                }
            }
            Command::Accepted { id, granted, reply } => {
                let step = match &mut self.round {
                    Some(active) if active.core.id() == id => {
                        Some(self.strategy.accepted(&mut active.core, peer, granted, reply))
                    }
                    _ => None,
                };
                if let Some(step) = step {
                    self.apply_round_step(step);
                }
            }
            Command::Error { kind } => {
                debug!(%peer, ?kind, "peer reported an error");
                self.pending_failures.push(peer);
            }
            other => {
                warn!(%peer, kind = other.kind(), "unexpected command on peer connection");
                self.pending_failures.push(peer);
            }
        }
    }

    /// Commands arriving on accepted connections: exchanges initiated by a
    /// peer or a client.
    fn on_inbound_command(&mut self, id: u64, command: Command) {
        match command {
            Command::HandshakeStart {
                magic,
                version,
                sender,
            } => {
                if magic != PROTOCOL_MAGIC || version != PROTOCOL_VERSION {
                    warn!(?sender, magic, version, "wire format mismatch, closing connection");
                    self.respond(id, Command::Error {
                        kind: WireError::Protocol,
                    });
                    self.conns.remove(&id);
                    return;
                }
                self.respond(
                    id,
                    Command::HandshakeResponse {
                        sender: self.me,
                        leader: self.view.leader(),
                    },
                );
            }
            Command::LeaderClaim { candidate, term } => {
                let granted =
                    self.election
                        .consider_claim(candidate, term, self.view.candidate());
                trace!(%candidate, term, granted, "leader claim");
                self.respond(id, Command::LeaderClaimAck { term, granted });
            }
            Command::LeaderAnnounce { leader, term } => {
                if self.election.consider_announce(leader, term) && self.view.is_alive(leader) {
                    if self.view.leader() != Some(leader) {
                        debug!(%leader, term, "following announced leader");
                    }
                    self.view.set_leader(Some(leader));
                }
            }
            Command::Prepare { id: proposal, digest } => {
                let mut follower = FollowerContext {
                    acceptor: &mut self.acceptor,
                    callback: &*self.callback,
                };
                let action = self.strategy.prepare(&mut follower, proposal, digest);
                self.apply_strategy_action(id, action);
            }
            Command::Accept {
                id: proposal,
                workload,
            } => {
                let mut follower = FollowerContext {
                    acceptor: &mut self.acceptor,
                    callback: &*self.callback,
                };
                let action = self.strategy.accept(&mut follower, proposal, &workload);
                self.apply_strategy_action(id, action);
            }
            Command::RequestInitiate { workload } => self.on_request_initiate(id, workload),
            other => {
                warn!(conn = id, kind = other.kind(), "unexpected command on inbound connection");
                self.respond(id, Command::Error {
                    kind: WireError::Protocol,
                });
                self.conns.remove(&id);
            }
        }
    }

    fn apply_strategy_action(&mut self, conn: u64, action: StrategyAction) {
        match action {
            StrategyAction::Respond(command) => self.respond(conn, command),
            StrategyAction::Close => {
                debug!(conn, "strategy closed the connection");
                self.conns.remove(&conn);
            }
            StrategyAction::Ignore => {}
        }
    }

    /// Best-effort write to an accepted connection.
    fn respond(&mut self, conn: u64, command: Command) {
        let delivered = self.conns.get(&conn).is_some_and(|link| link.send(command));
        if !delivered {
            self.conns.remove(&conn);
        }
    }

    // ------------------------------------------------------------------
    // Leading: election wins and rounds
    // ------------------------------------------------------------------

    fn win_election(&mut self, term: u64) {
        if !self.view.is_alive(self.me) {
            // Lost our own liveness while the claim was in flight.
            self.election.abandon_claim();
            return;
        }
        info!(term, "won leadership");
        self.election.adopt_won_claim(self.me, term);
        self.view.set_leader(Some(self.me));
        self.announce_leadership();
    }

    fn on_request_initiate(&mut self, conn: u64, workload: Vec<u8>) {
        if !self.view.is_ready() {
            self.respond(conn, Command::Error {
                kind: WireError::NotReady,
            });
            return;
        }
        if !self.view.we_are_leader(self.me) {
            self.respond(conn, Command::Error {
                kind: WireError::NotLeader,
            });
            return;
        }
        if self.round.is_some() {
            // One round at a time; later initiations keep their arrival
            // order.
            self.backlog.push_back((conn, workload));
            return;
        }
        self.begin_round(conn, workload);
    }

    fn begin_round(&mut self, origin: u64, workload: Vec<u8>) {
        let participants = self.view.live_peers();
        if participants.len() < self.view.majority() {
            self.respond(origin, Command::Error {
                kind: WireError::RoundFailed,
            });
            return;
        }

        self.sequence += 1;
        let id = ProposalId::new(self.election.current_term(), self.sequence, self.me);
        let digest = workload_digest(&workload);
        debug!(?id, participants = participants.len(), "starting round");

        let core = RoundCore::new(id, digest, participants.clone(), self.view.majority());
        self.round = Some(ActiveRound {
            core,
            workload,
            origin,
            deadline: Instant::now() + self.config.heartbeat_interval,
        });
        for peer in participants {
            self.queue_send(peer, Command::Prepare { id, digest });
        }
    }

    fn apply_round_step(&mut self, step: RoundStep) {
        match step {
            RoundStep::Pending => {}
            RoundStep::StartAccept => self.start_accept_phase(),
            RoundStep::Deliver(reply) => self.finish_round(Ok(reply)),
            RoundStep::Abort => self.finish_round(Err(WireError::RoundFailed)),
        }
    }

    fn start_accept_phase(&mut self) {
        let Some(active) = &mut self.round else {
            return;
        };
        active.deadline = Instant::now() + self.config.heartbeat_interval;
        let id = active.core.id();
        let workload = active.workload.clone();
        let participants: Vec<Endpoint> = active.core.participants().collect();
        debug!(?id, "prepare quorum reached, sending accepts");
        for peer in participants {
            self.queue_send(peer, Command::Accept {
                id,
                workload: workload.clone(),
            });
        }
    }

    fn finish_round(&mut self, outcome: Result<Vec<u8>, WireError>) {
        let Some(active) = self.round.take() else {
            return;
        };
        let id = active.core.id();
        let response = match outcome {
            Ok(reply) => {
                debug!(?id, "round completed");
                Command::RequestResponse { reply }
            }
            Err(kind) => {
                warn!(?id, ?kind, "round failed");
                Command::Error { kind }
            }
        };
        self.respond(active.origin, response);
        self.start_next_round();
    }

    fn start_next_round(&mut self) {
        while self.round.is_none() {
            let Some((origin, workload)) = self.backlog.pop_front() else {
                return;
            };
            // Re-check admission: leadership or readiness may be gone.
            self.on_request_initiate(origin, workload);
        }
    }

    // ------------------------------------------------------------------
    // Failure handling and deadlines
    // ------------------------------------------------------------------

    /// Queue a command to a pooled peer connection, recording a failure for
    /// later processing if it cannot be written.
    fn queue_send(&mut self, peer: Endpoint, command: Command) {
        let sent = self.links.get(&peer).is_some_and(|link| link.send(command));
        if !sent {
            self.pending_failures.push(peer);
        }
    }

    /// Apply recorded peer failures. Loops because failure handling can
    /// finish a round, which starts the next one, whose sends can fail in
    /// turn.
    fn flush_failures(&mut self) {
        while let Some(peer) = self.pending_failures.pop() {
            self.peer_failed(peer);
        }
    }

    fn peer_failed(&mut self, peer: Endpoint) {
        self.links.remove(&peer);
        self.pending_handshakes.remove(&peer);
        if self.view.mark_dead(peer) {
            debug!(%peer, "leader lost, resetting quorum state");
            self.view.reset_state();
            // A round is only valid under the leadership it was started
            // with; remaining responders cannot save it.
            if self.round.is_some() {
                self.finish_round(Err(WireError::RoundFailed));
            }
            return;
        }
        let step = self
            .round
            .as_mut()
            .map(|active| active.core.handle_peer_failure(peer));
        if let Some(step) = step {
            self.apply_round_step(step);
        }
    }

    fn on_deadlines(&mut self) {
        let now = Instant::now();

        let expired: Vec<Endpoint> = self
            .pending_handshakes
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(peer, _)| *peer)
            .collect();
        for peer in expired {
            debug!(%peer, "handshake timed out");
            self.pending_handshakes.remove(&peer);
            self.pending_failures.push(peer);
        }

        if self.round.as_ref().is_some_and(|r| r.deadline <= now) {
            let step = self.round.as_mut().map(|r| r.core.expire());
            if let Some(step) = step {
                self.apply_round_step(step);
            }
        }

        self.flush_failures();
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Fail everything still in flight. Connection tasks exit through the
    /// cancellation token.
    fn drain(&mut self) {
        if let Some(active) = self.round.take() {
            self.respond(active.origin, Command::Error {
                kind: WireError::RoundFailed,
            });
        }
        while let Some((origin, _)) = self.backlog.pop_front() {
            self.respond(origin, Command::Error {
                kind: WireError::RoundFailed,
            });
        }
        self.links.clear();
        self.conns.clear();
        info!(me = %self.me, "node stopped");
    }
}
