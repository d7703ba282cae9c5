//! Leader-driven Paxos replication of opaque workloads over TCP.
//!
//! A small static cluster of servers replicates byte-string workloads: a
//! client submits one, the elected leader drives a two-phase Paxos round
//! across a quorum of peers, every live node executes the user-supplied
//! callback on the workload, and the client gets back a single agreed
//! reply. Applications get a linearizable replication primitive without
//! implementing consensus themselves.
//!
//! # Quick start
//!
//! ```ignore
//! use paxkit::{Client, Configuration, Server};
//!
//! let host = "127.0.0.1".parse()?;
//! let mut server = Server::new(host, 1337, |workload| workload.to_vec(), Configuration::default())?;
//! server.add(host, 1337);
//! server.add(host, 1338);
//! server.add(host, 1339);
//! server.start().await?;
//! // ... start the other two members the same way ...
//!
//! let mut client = Client::new(Configuration::default())?;
//! client.add_all([(host, 1337), (host, 1338), (host, 1339)]);
//! client.start().await?;
//! client.wait_until_quorum_ready().await;
//! let reply = client.send("foo").await?;
//! ```
//!
//! # Shape
//!
//! Each `Client`/`Server` runs one actor task owning all of its protocol
//! state; by default the library spawns a single worker thread to drive it
//! (set [`Configuration::runtime`] to use an existing runtime instead).
//! Liveness comes from a periodic handshake sweep; leadership from a
//! deterministic election (highest alive endpoint wins); replication from
//! the classic prepare/promise, accept/accepted exchange, pluggable through
//! [`strategy::Strategy`].

#![warn(clippy::pedantic)]

pub mod config;
pub mod strategy;

mod client;
mod connection;
mod node;
mod queue;
mod runtime;
mod server;

pub use client::{Client, ResponseHandle};
pub use config::Configuration;
pub use paxkit_core::{
    AcceptorCore, Command, ConfigError, Endpoint, Liveness, ProposalId, QuorumStatus, RoundCore,
    RoundStep, SendError,
};
pub use runtime::StartError;
pub use server::Server;
