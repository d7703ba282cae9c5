//! Length-delimited command framing.
//!
//! Every frame is `[length: u32 big-endian][body]`, where the body is a
//! postcard-serialized [`Command`]. The length prefix counts only the body.
//! Big-endian is fixed for every peer; the handshake magic catches builds
//! that disagree.

use std::io;

use bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

use crate::command::Command;

/// Default (and minimum) frame cap: 16 MiB, large enough for any workload
/// the protocol is intended to carry.
pub const DEFAULT_MAX_FRAME: usize = 16 * 1024 * 1024;

/// Wraps [`LengthDelimitedCodec`] with automatic postcard serialization of
/// [`Command`] bodies.
///
/// A frame longer than the configured cap surfaces as an
/// [`io::ErrorKind::InvalidData`] decode error; the connection owner is
/// expected to close the connection and not reuse it.
#[derive(Debug)]
pub struct CommandCodec {
    inner: LengthDelimitedCodec,
}

impl CommandCodec {
    #[must_use]
    pub fn new(max_frame: usize) -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .max_frame_length(max_frame)
                .new_codec(),
        }
    }
}

impl Default for CommandCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FRAME)
    }
}

impl Decoder for CommandCodec {
    type Item = Command;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.inner.decode(src)? {
            Some(bytes) => {
                let command = postcard::from_bytes(&bytes)
                    .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
                Ok(Some(command))
            }
            None => Ok(None),
        }
    }
}

impl Encoder<Command> for CommandCodec {
    type Error = io::Error;

    fn encode(&mut self, item: Command, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let bytes = postcard::to_allocvec(&item)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        self.inner.encode(Bytes::from(bytes), dst)
    }
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr};

    use super::*;
    use crate::command::{ProposalId, WireError, workload_digest};
    use crate::endpoint::Endpoint;

    fn ep(port: u16) -> Endpoint {
        Endpoint::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[test]
    fn every_command_type_round_trips() {
        let id = ProposalId::new(3, 7, ep(1337));
        let commands = vec![
            Command::handshake_start(Some(ep(1337))),
            Command::HandshakeResponse {
                sender: ep(1338),
                leader: Some(ep(1339)),
            },
            Command::LeaderClaim {
                candidate: ep(1339),
                term: 4,
            },
            Command::LeaderClaimAck {
                term: 4,
                granted: true,
            },
            Command::LeaderAnnounce {
                leader: ep(1339),
                term: 4,
            },
            Command::RequestInitiate {
                workload: b"foo".to_vec(),
            },
            Command::Prepare {
                id,
                digest: workload_digest(b"foo"),
            },
            Command::Promise { id, granted: false },
            Command::Accept {
                id,
                workload: b"foo".to_vec(),
            },
            Command::Accepted {
                id,
                granted: true,
                reply: b"bar".to_vec(),
            },
            Command::RequestResponse {
                reply: b"bar".to_vec(),
            },
            Command::Error {
                kind: WireError::RoundFailed,
            },
        ];

        let mut codec = CommandCodec::default();
        let mut buf = BytesMut::new();
        for command in &commands {
            codec.encode(command.clone(), &mut buf).unwrap();
        }
        for expected in &commands {
            let decoded = codec.decode(&mut buf).unwrap().unwrap();
            assert_eq!(&decoded, expected);
        }
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn length_prefix_is_big_endian() {
        let mut codec = CommandCodec::default();
        let mut buf = BytesMut::new();
        codec
            .encode(
                Command::RequestResponse {
                    reply: b"bar".to_vec(),
                },
                &mut buf,
            )
            .unwrap();

        let body_len = buf.len() - 4;
        assert_eq!(
            &buf[..4],
            u32::try_from(body_len).unwrap().to_be_bytes(),
            "length prefix must be network byte order"
        );
    }

    #[test]
    fn oversize_frame_is_rejected() {
        let mut small = CommandCodec::new(64);
        let mut buf = BytesMut::new();

        // A frame claiming a body far beyond the cap.
        buf.extend_from_slice(&1_000_000u32.to_be_bytes());
        buf.extend_from_slice(&[0u8; 16]);

        let err = small.decode(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn truncated_frame_waits_for_more_bytes() {
        let mut codec = CommandCodec::default();
        let mut full = BytesMut::new();
        codec
            .encode(
                Command::RequestInitiate {
                    workload: b"foo".to_vec(),
                },
                &mut full,
            )
            .unwrap();

        let mut partial = BytesMut::from(&full[..full.len() - 1]);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
