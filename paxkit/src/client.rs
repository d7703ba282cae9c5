//! Client: submit workloads to the cluster and collect replies.
//!
//! A client keeps its own quorum view of the configured servers. It never
//! votes; it learns the leader from handshake responses and adopts one only
//! when a strict majority of the membership report the same alive endpoint.
//! Requests pass through a serialized queue (one in flight at a time),
//! and transient failures are retried after a fixed backoff until the retry
//! budget runs out.

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::net::IpAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use error_stack::Report;
use paxkit_core::{Command, Endpoint, QuorumStatus, QuorumView, SendError};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::Configuration;
use crate::connection::{CommandLink, ConnKey, NetEvent, spawn_dial};
use crate::queue::{AdmissionGuard, PendingRequest, RequestQueue};
use crate::runtime::{EventLoop, StartError};

const DEADLINE_TICK: Duration = Duration::from_millis(50);

/// Requests from the `Client` handle into the actor.
enum ClientRequest {
    Submit {
        workload: Vec<u8>,
        retries: u32,
        reply: oneshot::Sender<Result<Vec<u8>, SendError>>,
    },
    AwaitReady(oneshot::Sender<()>),
    Status(oneshot::Sender<QuorumStatus>),
}

/// One-shot handle to the outcome of a `send`.
///
/// Resolves exactly once, with the agreed reply or a [`SendError`].
pub struct ResponseHandle {
    rx: oneshot::Receiver<Result<Vec<u8>, SendError>>,
}

impl Future for ResponseHandle {
    type Output = Result<Vec<u8>, SendError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(|received| match received {
            Ok(outcome) => outcome,
            // The actor was torn down without fulfilling us.
            Err(_) => Err(SendError::RequestError),
        })
    }
}

/// Where the admitted request currently stands.
enum DispatchState {
    /// Waiting for the fixed backoff (or the initial dispatch) to fire.
    Backoff { resume_at: Instant },
    /// Sent to the leader; waiting for its response.
    AwaitingReply { leader: Endpoint, deadline: Instant },
}

struct ActiveRequest {
    workload: Vec<u8>,
    retries_left: u32,
    reply: oneshot::Sender<Result<Vec<u8>, SendError>>,
    guard: AdmissionGuard,
    state: DispatchState,
}

struct ClientActor {
    config: Configuration,
    view: QuorumView,

    links: HashMap<Endpoint, CommandLink>,
    dialing: HashSet<Endpoint>,
    pending_handshakes: HashMap<Endpoint, Instant>,
    pending_failures: Vec<Endpoint>,

    queue: RequestQueue,
    active: Option<ActiveRequest>,
    ready_waiters: Vec<oneshot::Sender<()>>,

    events_tx: mpsc::Sender<NetEvent>,
    events_rx: mpsc::Receiver<NetEvent>,
    requests_rx: mpsc::Receiver<ClientRequest>,
    cancel: CancellationToken,
}

impl ClientActor {
    fn new(
        peers: &[Endpoint],
        config: Configuration,
        requests_rx: mpsc::Receiver<ClientRequest>,
        cancel: CancellationToken,
    ) -> Self {
        let mut view = QuorumView::new();
        for peer in peers {
            view.add(*peer);
        }
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            config,
            view,
            links: HashMap::new(),
            dialing: HashSet::new(),
            pending_handshakes: HashMap::new(),
            pending_failures: Vec::new(),
            queue: RequestQueue::default(),
            active: None,
            ready_waiters: Vec::new(),
            events_tx,
            events_rx,
            requests_rx,
            cancel,
        }
    }

    async fn run(mut self, ready: oneshot::Sender<()>) {
        let _ = ready.send(());
        info!(peers = self.view.len(), "client started");

        let mut heartbeat = tokio::time::interval(self.config.heartbeat_interval);
        heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut deadlines = tokio::time::interval(DEADLINE_TICK);
        deadlines.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                () = self.cancel.cancelled() => break,

                _ = heartbeat.tick() => self.on_heartbeat(),

                _ = deadlines.tick() => self.on_deadlines(),

                Some(event) = self.events_rx.recv() => self.on_net(event),

                request = self.requests_rx.recv() => match request {
                    Some(request) => self.on_request(request),
                    // Client handle dropped.
                    None => break,
                },
            }
        }

        self.drain();
    }

    // ------------------------------------------------------------------
    // Heartbeat and liveness
    // ------------------------------------------------------------------

    fn on_heartbeat(&mut self) {
        self.sweep_handshakes();
        self.flush_failures();
        self.pump();
    }

    fn sweep_handshakes(&mut self) {
        let deadline = Instant::now() + self.config.handshake_deadline();
        for peer in self.view.members().collect::<Vec<_>>() {
            if let Some(link) = self.links.get(&peer) {
                if self.pending_handshakes.contains_key(&peer) {
                    continue;
                }
                if link.send(Command::handshake_start(None)) {
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

    /// Follow the leader the membership reports: adopted when a strict
    /// majority agree on an alive endpoint, dropped when they no longer do.
    fn adopt_leader(&mut self) {
        let reported = self.view.majority_reported_leader();
        if self.view.leader() != reported {
            match reported {
                Some(leader) => debug!(%leader, "adopting reported leader"),
                None => debug!("no majority-reported leader"),
            }
            self.view.set_leader(reported);
        }
        if self.view.is_ready() {
            for waiter in self.ready_waiters.drain(..) {
                let _ = waiter.send(());
            }
        }
    }

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
        }
        let awaiting_failed_leader = matches!(
            &self.active,
            Some(ActiveRequest {
                state: DispatchState::AwaitingReply { leader, .. },
                ..
            }) if *leader == peer
        );
        if awaiting_failed_leader {
            self.retry_or_fail();
        }
    }

    // ------------------------------------------------------------------
    // Network events
    // ------------------------------------------------------------------

    fn on_net(&mut self, event: NetEvent) {
        match event {
            NetEvent::Opened { key, link } => {
                let ConnKey::Peer(peer) = key else { return };
                self.dialing.remove(&peer);
                if link.send(Command::handshake_start(None)) {
                    self.pending_handshakes
                        .insert(peer, Instant::now() + self.config.handshake_deadline());
                    self.links.insert(peer, link);
                } else {
                    self.pending_failures.push(peer);
                }
            }
            NetEvent::DialFailed { peer } => {
                self.dialing.remove(&peer);
                self.pending_failures.push(peer);
            }
            NetEvent::Frame { key, command } => {
                let ConnKey::Peer(peer) = key else { return };
                self.on_server_command(peer, command);
            }
            NetEvent::Closed { key } => {
                let ConnKey::Peer(peer) = key else { return };
                if self.links.remove(&peer).is_some() {
                    self.pending_failures.push(peer);
                }
            }
        }
        self.flush_failures();
        self.pump();
    }

    fn on_server_command(&mut self, peer: Endpoint, command: Command) {
        match command {
            Command::HandshakeResponse { leader, .. } => {
                self.pending_handshakes.remove(&peer);
                self.view.mark_alive(peer);
                self.view.record_reported_leader(peer, leader);
                self.adopt_leader();
            }
            Command::RequestResponse { reply } => {
                let from_awaited_leader = matches!(
                    &self.active,
                    Some(ActiveRequest {
                        state: DispatchState::AwaitingReply { leader, .. },
                        ..
                    }) if *leader == peer
                );
                if from_awaited_leader {
                    self.complete(Ok(reply));
                } else {
                    trace!(%peer, "stray response ignored");
                }
            }
            Command::Error { kind } => {
                let from_awaited_leader = matches!(
                    &self.active,
                    Some(ActiveRequest {
                        state: DispatchState::AwaitingReply { leader, .. },
                        ..
                    }) if *leader == peer
                );
                if from_awaited_leader {
                    debug!(%peer, ?kind, "leader rejected the request");
                    self.retry_or_fail();
                }
            }
            other => {
                warn!(%peer, kind = other.kind(), "unexpected command from server");
            }
        }
    }

    // ------------------------------------------------------------------
    // Request lifecycle
    // ------------------------------------------------------------------

    fn on_request(&mut self, request: ClientRequest) {
        match request {
            ClientRequest::Submit {
                workload,
                retries,
                reply,
            } => {
                self.queue.push(PendingRequest {
                    workload,
                    retries,
                    reply,
                });
                self.pump();
            }
            ClientRequest::AwaitReady(tx) => {
                if self.view.is_ready() {
                    let _ = tx.send(());
                } else {
                    self.ready_waiters.push(tx);
                }
            }
            ClientRequest::Status(tx) => {
                let _ = tx.send(self.view.status());
            }
        }
    }

    /// Admit and dispatch until something is genuinely in flight (or the
    /// queue is empty). Requests that complete immediately — not ready,
    /// retries exhausted — fall straight through to the next admission.
    fn pump(&mut self) {
        loop {
            if self.active.is_none() {
                let Some((request, guard)) = self.queue.admit() else {
                    return;
                };
                self.active = Some(ActiveRequest {
                    workload: request.workload,
                    retries_left: request.retries,
                    reply: request.reply,
                    guard,
                    state: DispatchState::Backoff {
                        resume_at: Instant::now(),
                    },
                });
            }

            let due = matches!(
                &self.active,
                Some(ActiveRequest {
                    state: DispatchState::Backoff { resume_at },
                    ..
                }) if *resume_at <= Instant::now()
            );
            if due {
                self.dispatch();
            }
            if self.active.is_some() {
                return;
            }
        }
    }

    /// Send the admitted request to the current leader, or complete it with
    /// `not_ready` when the view has none.
    fn dispatch(&mut self) {
        if self.active.is_none() {
            return;
        }
        if !self.view.is_ready() {
            self.complete(Err(SendError::NotReady));
            return;
        }
        let Some(leader) = self.view.leader() else {
            self.complete(Err(SendError::NotReady));
            return;
        };

        let workload = self
            .active
            .as_ref()
            .map(|active| active.workload.clone())
            .unwrap_or_default();
        let sent = self
            .links
            .get(&leader)
            .is_some_and(|link| link.send(Command::RequestInitiate { workload }));

        if sent {
            trace!(%leader, "request dispatched");
            if let Some(active) = &mut self.active {
                active.state = DispatchState::AwaitingReply {
                    leader,
                    deadline: Instant::now() + self.config.heartbeat_interval,
                };
            }
        } else {
            self.pending_failures.push(leader);
            self.retry_or_fail();
        }
    }

    /// Transient failure of the in-flight attempt: burn a retry and back
    /// off, or roll up into `request_error`.
    fn retry_or_fail(&mut self) {
        let Some(retries_left) = self.active.as_ref().map(|active| active.retries_left) else {
            return;
        };
        if retries_left == 0 {
            self.complete(Err(SendError::RequestError));
            return;
        }
        if let Some(active) = &mut self.active {
            active.retries_left -= 1;
            active.state = DispatchState::Backoff {
                resume_at: Instant::now() + self.config.retry_backoff,
            };
            debug!(retries_left = active.retries_left, "retrying after backoff");
        }
    }

    fn complete(&mut self, outcome: Result<Vec<u8>, SendError>) {
        if let Some(active) = self.active.take() {
            let _ = active.reply.send(outcome);
            self.queue.release(active.guard);
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

        let reply_overdue = matches!(
            &self.active,
            Some(ActiveRequest {
                state: DispatchState::AwaitingReply { deadline, .. },
                ..
            }) if *deadline <= now
        );
        if reply_overdue {
            debug!("request timed out");
            self.retry_or_fail();
        }

        self.flush_failures();
        self.pump();
    }

    /// Fulfill everything still pending with a terminal error; nothing is
    /// silently dropped.
    fn drain(&mut self) {
        self.complete(Err(SendError::RequestError));
        let drained: Vec<PendingRequest> = self.queue.drain().collect();
        for request in drained {
            let _ = request.reply.send(Err(SendError::RequestError));
        }
        self.ready_waiters.clear();
        self.links.clear();
        info!("client stopped");
    }
}

// ----------------------------------------------------------------------
// Public handle
// ----------------------------------------------------------------------

/// Handle to a replication client.
///
/// `new` → `add` the cluster membership → `start` → `send`. Dropping the
/// handle (or calling [`stop`](Client::stop)) drains in-flight requests with
/// an error and tears the event loop down.
pub struct Client {
    config: Configuration,
    peers: Vec<Endpoint>,
    requests_tx: Option<mpsc::Sender<ClientRequest>>,
    event_loop: Option<EventLoop>,
}

impl Client {
    /// Create a client.
    ///
    /// # Errors
    ///
    /// Returns [`paxkit_core::ConfigError`] for invalid tunables.
    pub fn new(config: Configuration) -> Result<Self, paxkit_core::ConfigError> {
        config.validate()?;
        Ok(Self {
            config,
            peers: Vec::new(),
            requests_tx: None,
            event_loop: None,
        })
    }

    /// Declare one server of the cluster.
    pub fn add(&mut self, host: IpAddr, port: u16) {
        self.peers.push(Endpoint::new(host, port));
    }

    /// Declare several servers at once.
    pub fn add_all<I>(&mut self, servers: I)
    where
        I: IntoIterator<Item = (IpAddr, u16)>,
    {
        for (host, port) in servers {
            self.add(host, port);
        }
    }

    /// Start the event loop.
    ///
    /// # Errors
    ///
    /// Fails when the client is already started or the event loop could not
    /// be brought up.
    pub async fn start(&mut self) -> Result<(), Report<StartError>> {
        if self.event_loop.is_some() {
            return Err(Report::new(StartError).attach("client already started"));
        }

        let (requests_tx, requests_rx) = mpsc::channel(256);
        let cancel = CancellationToken::new();
        let actor = ClientActor::new(&self.peers, self.config.clone(), requests_rx, cancel.clone());
        let (ready_tx, ready_rx) = oneshot::channel();

        let event_loop = EventLoop::spawn(
            self.config.runtime.clone(),
            cancel,
            actor.run(ready_tx),
        );

        ready_rx
            .await
            .map_err(|_| Report::new(StartError).attach("event loop terminated during startup"))?;

        self.requests_tx = Some(requests_tx);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    /// Resolve when the quorum is ready: a strict majority of servers alive
    /// and a leader adopted. Returns immediately if the client is stopped.
    pub async fn wait_until_quorum_ready(&self) {
        let (tx, rx) = oneshot::channel();
        let Some(requests) = &self.requests_tx else {
            return;
        };
        if requests.try_send(ClientRequest::AwaitReady(tx)).is_err() {
            return;
        }
        let _ = rx.await;
    }

    /// Replicate `workload` with the configured default retry budget.
    pub fn send(&self, workload: impl Into<Vec<u8>>) -> ResponseHandle {
        self.send_with_retries(workload, self.config.default_retries)
    }

    /// Replicate `workload`, retrying transient failures up to `retries`
    /// times with the configured backoff between attempts.
    pub fn send_with_retries(&self, workload: impl Into<Vec<u8>>, retries: u32) -> ResponseHandle {
        let (tx, rx) = oneshot::channel();
        let submit = ClientRequest::Submit {
            workload: workload.into(),
            retries,
            reply: tx,
        };
        match &self.requests_tx {
            Some(requests) => {
                if let Err(rejected) = requests.try_send(submit) {
                    if let ClientRequest::Submit { reply, .. } = rejected.into_inner() {
                        let _ = reply.send(Err(SendError::RequestError));
                    }
                }
            }
            None => {
                if let ClientRequest::Submit { reply, .. } = submit {
                    let _ = reply.send(Err(SendError::RequestError));
                }
            }
        }
        ResponseHandle { rx }
    }

    /// Snapshot of the client's quorum view; `None` once stopped.
    pub async fn status(&self) -> Option<QuorumStatus> {
        let (tx, rx) = oneshot::channel();
        let requests = self.requests_tx.as_ref()?;
        requests.try_send(ClientRequest::Status(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop the client. In-flight and queued requests are fulfilled with an
    /// error before the event loop is torn down.
    pub fn stop(&mut self) {
        self.requests_tx = None;
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.shutdown();
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.stop();
    }
}
