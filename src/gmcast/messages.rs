/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The framed wire format spoken between members.
//!
//! Every message is a fixed 32-byte header followed by a payload:
//!
//! ```text
//! { version: 1, type: 1, flags: 1, reserved: 1, source_uuid: 16, seq: 8, payload_len: 4 }
//! ```
//!
//! Multi-byte fields are little-endian. The header is written by hand (it is a fixed
//! byte layout, not a borsh struct); payloads inside frames are borsh-encoded.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::MemberId;

pub const FRAME_VERSION: u8 = 0;
pub const FRAME_HEADER_LEN: usize = 32;

/// Largest payload a frame may carry. Guards the reader against a corrupt length field.
pub const MAX_FRAME_PAYLOAD: usize = 1 << 27;

/// Discriminates what a frame carries.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameType {
    /// First frame on every link: group name + listen address of the dialing member.
    Handshake = 1,
    /// Accepting side's reply to a valid handshake.
    HandshakeOk = 2,
    /// Liveness probe; carries no payload.
    Keepalive = 3,
    /// Gossip: the sender's current address book.
    Topology = 4,
    /// An application payload: a borsh-encoded [`WireMessage`](crate::network::WireMessage).
    User = 5,
}

impl FrameType {
    pub fn from_u8(raw: u8) -> Option<FrameType> {
        match raw {
            1 => Some(FrameType::Handshake),
            2 => Some(FrameType::HandshakeOk),
            3 => Some(FrameType::Keepalive),
            4 => Some(FrameType::Topology),
            5 => Some(FrameType::User),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub frame_type: FrameType,
    pub flags: u8,
    pub source: MemberId,
    /// Per-link frame counter, used to detect a stuck peer that still holds the
    /// connection open.
    pub seq: u64,
    pub payload_len: u32,
}

impl FrameHeader {
    pub fn encode(&self) -> [u8; FRAME_HEADER_LEN] {
        let mut bytes = [0u8; FRAME_HEADER_LEN];
        bytes[0] = self.version;
        bytes[1] = self.frame_type as u8;
        bytes[2] = self.flags;
        // bytes[3] reserved
        bytes[4..20].copy_from_slice(&self.source.bytes());
        bytes[20..28].copy_from_slice(&self.seq.to_le_bytes());
        bytes[28..32].copy_from_slice(&self.payload_len.to_le_bytes());
        bytes
    }

    pub fn decode(bytes: &[u8]) -> Result<FrameHeader, FrameError> {
        if bytes.len() != FRAME_HEADER_LEN {
            return Err(FrameError::Truncated);
        }
        if bytes[0] != FRAME_VERSION {
            return Err(FrameError::BadVersion(bytes[0]));
        }
        let frame_type = FrameType::from_u8(bytes[1]).ok_or(FrameError::BadType(bytes[1]))?;
        let mut uuid = [0u8; 16];
        uuid.copy_from_slice(&bytes[4..20]);
        let mut seq_bytes = [0u8; 8];
        seq_bytes.copy_from_slice(&bytes[20..28]);
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&bytes[28..32]);
        let payload_len = u32::from_le_bytes(len_bytes);
        if payload_len as usize > MAX_FRAME_PAYLOAD {
            return Err(FrameError::Oversize(payload_len));
        }
        Ok(FrameHeader {
            version: bytes[0],
            frame_type,
            flags: bytes[2],
            source: MemberId::new(uuid),
            seq: u64::from_le_bytes(seq_bytes),
            payload_len,
        })
    }
}

/// Assemble a complete frame: header + payload.
pub fn encode_frame(
    frame_type: FrameType,
    source: MemberId,
    seq: u64,
    payload: &[u8],
) -> Vec<u8> {
    let header = FrameHeader {
        version: FRAME_VERSION,
        frame_type,
        flags: 0,
        source,
        seq,
        payload_len: payload.len() as u32,
    };
    let mut frame = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    frame.extend_from_slice(&header.encode());
    frame.extend_from_slice(payload);
    frame
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameError {
    Truncated,
    BadVersion(u8),
    BadType(u8),
    Oversize(u32),
}

/// Payload of a [`FrameType::Handshake`] frame.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Handshake {
    /// The cluster name; links between differently-named clusters are refused.
    pub group: String,
    /// Address the dialing member accepts connections on, for gossip.
    pub listen_addr: String,
}

/// One gossip entry: a member and the address it listens on.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PeerAddress {
    pub member: MemberId,
    pub addr: String,
}

/// Payload of a [`FrameType::Topology`] frame.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Topology {
    pub peers: Vec<PeerAddress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let source = MemberId::generate();
        let frame = encode_frame(FrameType::User, source, 42, b"payload");
        let header = FrameHeader::decode(&frame[..FRAME_HEADER_LEN]).unwrap();
        assert_eq!(header.frame_type, FrameType::User);
        assert_eq!(header.source, source);
        assert_eq!(header.seq, 42);
        assert_eq!(header.payload_len as usize, b"payload".len());
        assert_eq!(&frame[FRAME_HEADER_LEN..], b"payload");
    }

    #[test]
    fn decode_rejects_bad_version_and_type() {
        let source = MemberId::generate();
        let mut frame = encode_frame(FrameType::Keepalive, source, 0, &[]);
        frame[0] = 9;
        assert_eq!(
            FrameHeader::decode(&frame[..FRAME_HEADER_LEN]),
            Err(FrameError::BadVersion(9))
        );
        frame[0] = FRAME_VERSION;
        frame[1] = 200;
        assert_eq!(
            FrameHeader::decode(&frame[..FRAME_HEADER_LEN]),
            Err(FrameError::BadType(200))
        );
    }

    #[test]
    fn decode_rejects_oversize_payload_length() {
        let source = MemberId::generate();
        let mut frame = encode_frame(FrameType::User, source, 0, &[]);
        frame[28..32].copy_from_slice(&u32::MAX.to_le_bytes());
        assert!(matches!(
            FrameHeader::decode(&frame[..FRAME_HEADER_LEN]),
            Err(FrameError::Oversize(_))
        ));
    }
}
