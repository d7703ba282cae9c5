//! Server: one replica of the cluster.

use std::net::IpAddr;
use std::sync::Arc;

use error_stack::Report;
use paxkit_core::{Endpoint, QuorumStatus};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::config::Configuration;
use crate::node::{NodeActor, ServerRequest};
use crate::runtime::{EventLoop, StartError};
use crate::strategy::WorkloadCallback;

/// Handle to one replica.
///
/// `new` with the endpoint to listen on and the workload callback, `add`
/// every member of the cluster (this server included — it participates in
/// rounds like any other peer), then `start`. The callback runs on the
/// event-loop thread whenever an `accept` is granted; it must be
/// deterministic and side-effect-free with respect to state it does not own.
pub struct Server {
    endpoint: Endpoint,
    peers: Vec<Endpoint>,
    callback: Arc<WorkloadCallback>,
    config: Configuration,
    requests_tx: Option<mpsc::Sender<ServerRequest>>,
    event_loop: Option<EventLoop>,
}

impl Server {
    /// Create a server listening on `host:port`.
    ///
    /// # Errors
    ///
    /// Returns [`paxkit_core::ConfigError`] for invalid tunables.
    pub fn new<F>(
        host: IpAddr,
        port: u16,
        callback: F,
        config: Configuration,
    ) -> Result<Self, paxkit_core::ConfigError>
    where
        F: Fn(&[u8]) -> Vec<u8> + Send + Sync + 'static,
    {
        config.validate()?;
        Ok(Self {
            endpoint: Endpoint::new(host, port),
            peers: Vec::new(),
            callback: Arc::new(callback),
            config,
            requests_tx: None,
            event_loop: None,
        })
    }

    /// Declare a member of the cluster. Declaring this server's own
    /// endpoint is allowed and redundant; it is always a member.
    pub fn add(&mut self, host: IpAddr, port: u16) {
        self.peers.push(Endpoint::new(host, port));
    }

    /// The endpoint this server was created with.
    #[must_use]
    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    /// Bind the listener and start the event loop. Resolves once the node
    /// accepts connections.
    ///
    /// # Errors
    ///
    /// Fails when the server is already started, the listener cannot bind,
    /// or the event loop could not be brought up.
    pub async fn start(&mut self) -> Result<(), Report<StartError>> {
        if self.event_loop.is_some() {
            return Err(Report::new(StartError).attach("server already started"));
        }

        let (requests_tx, requests_rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        let actor = NodeActor::new(
            self.endpoint,
            &self.peers,
            Arc::clone(&self.callback),
            self.config.clone(),
            requests_rx,
            cancel.clone(),
        );
        let (ready_tx, ready_rx) = oneshot::channel();

        let event_loop = EventLoop::spawn(
            self.config.runtime.clone(),
            cancel,
            actor.run(ready_tx),
        );

        match ready_rx.await {
            Ok(Ok(_bound)) => {}
            Ok(Err(e)) => {
                return Err(Report::new(StartError).attach(format!("bind failed: {e}")));
            }
            Err(_) => {
                return Err(
                    Report::new(StartError).attach("event loop terminated during startup")
                );
            }
        }

        self.requests_tx = Some(requests_tx);
        self.event_loop = Some(event_loop);
        Ok(())
    }

    /// Snapshot of this node's quorum view; `None` once stopped.
    pub async fn status(&self) -> Option<QuorumStatus> {
        let (tx, rx) = oneshot::channel();
        let requests = self.requests_tx.as_ref()?;
        requests.try_send(ServerRequest::Status(tx)).ok()?;
        rx.await.ok()
    }

    /// Stop serving: close the listener and every connection, fail whatever
    /// rounds are in flight, and tear the event loop down.
    pub fn stop(&mut self) {
        self.requests_tx = None;
        if let Some(mut event_loop) = self.event_loop.take() {
            event_loop.shutdown();
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}
