//! Pure protocol state machines and wire types for paxkit.
//!
//! This crate contains everything that can be expressed without I/O or a
//! runtime:
//!
//! - **Wire types**: the [`Command`] enum exchanged between nodes and the
//!   length-delimited [`codec::CommandCodec`] that frames it.
//! - **Quorum view**: [`quorum::QuorumView`], the per-node picture of which
//!   peers are alive and who leads.
//! - **Election bookkeeping**: [`election::ElectionState`], term tracking on
//!   both the claimant and the voter side.
//! - **Round state machines**: [`round::RoundCore`] (the leader-side tally of
//!   one two-phase commit) and [`round::AcceptorCore`] (the follower-side
//!   promise rule).
//!
//! All of it is push-based: callers feed events in and act on the returned
//! steps. Timing, sockets, and retries live in the `paxkit` crate.

#![warn(clippy::pedantic)]

pub mod codec;
pub mod command;
pub mod election;
pub mod endpoint;
pub mod error;
pub mod quorum;
pub mod round;

pub use codec::{CommandCodec, DEFAULT_MAX_FRAME};
pub use command::{Command, PROTOCOL_MAGIC, PROTOCOL_VERSION, ProposalId, WireError, workload_digest};
pub use endpoint::Endpoint;
pub use error::{ConfigError, SendError};
pub use quorum::{Liveness, QuorumStatus, QuorumView};
pub use round::{AcceptorCore, RoundCore, RoundPhase, RoundStep};
