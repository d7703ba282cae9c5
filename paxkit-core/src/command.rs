//! Wire commands exchanged between nodes.
//!
//! Every frame on the wire is one [`Command`]. The serialized body carries
//! its own type discriminator (the enum tag), so a receiver can dispatch
//! without any out-of-band context. Commands are serialized with postcard
//! inside the length-delimited framing of [`crate::codec::CommandCodec`].

use serde::{Deserialize, Serialize};

use crate::endpoint::Endpoint;

/// Magic constant carried on `HandshakeStart` so peers built against a
/// different wire format fail fast instead of misparsing frames.
pub const PROTOCOL_MAGIC: u32 = u32::from_be_bytes(*b"pxk\0");

/// Wire protocol version, bumped on any incompatible change.
pub const PROTOCOL_VERSION: u32 = 1;

/// Identifier of one proposal.
///
/// Ordered by `(term, sequence, proposer)`. `term` names the leadership
/// epoch, `sequence` increments per round within the term, and the proposer
/// endpoint is the final tie-break between proposals from distinct leaders
/// that somehow share a term.
#[derive(
    Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize, Deserialize,
)]
pub struct ProposalId {
    pub term: u64,
    pub sequence: u64,
    pub proposer: Endpoint,
}

impl ProposalId {
    #[must_use]
    pub fn new(term: u64, sequence: u64, proposer: Endpoint) -> Self {
        Self {
            term,
            sequence,
            proposer,
        }
    }
}

/// Failure kinds carried by [`Command::Error`].
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum WireError {
    /// The receiver is not the current leader.
    NotLeader,
    /// The receiver's quorum has no live majority or no leader.
    NotReady,
    /// The round driven for this request failed.
    RoundFailed,
    /// The sender violated the protocol; the connection will close.
    Protocol,
}

/// A protocol command.
///
/// Request/response pairing is positional: a node that initiates an exchange
/// reads the response on the same connection it wrote the request to, and no
/// cross-connection ordering is assumed anywhere.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub enum Command {
    /// Liveness probe. Carries the wire magic and version so incompatible
    /// peers are detected at first contact. `sender` is the dialer's own
    /// endpoint; clients, which have none, send `None`.
    HandshakeStart {
        magic: u32,
        version: u32,
        sender: Option<Endpoint>,
    },
    /// Reply to `HandshakeStart`: who we are and who we believe leads.
    HandshakeResponse {
        sender: Endpoint,
        leader: Option<Endpoint>,
    },
    /// A candidate claims leadership for `term`.
    LeaderClaim { candidate: Endpoint, term: u64 },
    /// Vote on a `LeaderClaim`.
    LeaderClaimAck { term: u64, granted: bool },
    /// The claimant won a majority and announces itself for `term`.
    LeaderAnnounce { leader: Endpoint, term: u64 },
    /// Client-to-leader: replicate this workload and return one reply.
    RequestInitiate { workload: Vec<u8> },
    /// Phase one of a round. Carries a digest of the workload, not the
    /// workload itself; the payload travels with `Accept`.
    Prepare { id: ProposalId, digest: u64 },
    /// Follower's answer to `Prepare`.
    Promise { id: ProposalId, granted: bool },
    /// Phase two of a round: the workload to execute.
    Accept { id: ProposalId, workload: Vec<u8> },
    /// Follower's answer to `Accept`. `reply` is the callback output and is
    /// empty when not granted.
    Accepted {
        id: ProposalId,
        granted: bool,
        reply: Vec<u8>,
    },
    /// Leader-to-client: the agreed reply for a `RequestInitiate`.
    RequestResponse { reply: Vec<u8> },
    /// Terminal failure for the exchange in progress on this connection.
    Error { kind: WireError },
}

impl Command {
    /// A `HandshakeStart` stamped with this build's magic and version.
    #[must_use]
    pub fn handshake_start(sender: Option<Endpoint>) -> Self {
        Command::HandshakeStart {
            magic: PROTOCOL_MAGIC,
            version: PROTOCOL_VERSION,
            sender,
        }
    }

    /// Short name of the command type, for logging.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Command::HandshakeStart { .. } => "handshake_start",
            Command::HandshakeResponse { .. } => "handshake_response",
            Command::LeaderClaim { .. } => "leader_claim",
            Command::LeaderClaimAck { .. } => "leader_claim_ack",
            Command::LeaderAnnounce { .. } => "leader_announce",
            Command::RequestInitiate { .. } => "request_initiate",
            Command::Prepare { .. } => "prepare",
            Command::Promise { .. } => "promise",
            Command::Accept { .. } => "accept",
            Command::Accepted { .. } => "accepted",
            Command::RequestResponse { .. } => "request_response",
            Command::Error { .. } => "error",
        }
    }
}

/// FNV-1a 64-bit digest of a workload, carried on `Prepare`.
///
/// Stable across platforms and builds; followers may compare it against the
/// workload delivered with `Accept`.
#[must_use]
pub fn workload_digest(workload: &[u8]) -> u64 {
    const OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET;
    for byte in workload {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}
