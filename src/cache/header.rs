/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Buffer headers: the fixed-layout metadata that prefixes every cached payload.
//!
//! The layout is stable because file-backed pages are rescanned on recovery: a page is
//! a sequence of `[header][payload]` records, walked front to back.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::Seqno;

/// Serialized header length in bytes: magic(4) + size(4) + seqno(8) + flags(2) +
/// store(1) + reserved(5).
pub const BUFFER_HEADER_LEN: usize = 24;

const BUFFER_MAGIC: u32 = 0x544E_4442; // "TNDB"

/// Which store owns a buffer. Stored as a tag, never as a pointer, so buffers stay
/// relocatable and recovery can re-home them.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
#[borsh(use_discriminant = true)]
pub enum StoreId {
    Mem = 1,
    Page = 2,
}

impl StoreId {
    fn from_u8(raw: u8) -> Option<StoreId> {
        match raw {
            1 => Some(StoreId::Mem),
            2 => Some(StoreId::Page),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, BorshSerialize, BorshDeserialize)]
pub struct BufferFlags(u16);

impl BufferFlags {
    /// The owning layer no longer needs the payload; the buffer may be reclaimed once
    /// it leaves the seqno window.
    pub const RELEASED: BufferFlags = BufferFlags(1);
    /// The write-set was rejected by certification; kept for seqno continuity only.
    pub const SKIPPED: BufferFlags = BufferFlags(1 << 1);
    /// Must survive into recovery regardless of ring pressure.
    pub const PERSISTENT: BufferFlags = BufferFlags(1 << 2);

    pub const fn none() -> BufferFlags {
        BufferFlags(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: BufferFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn set(&mut self, other: BufferFlags) {
        self.0 |= other.0;
    }

    pub fn clear(&mut self, other: BufferFlags) {
        self.0 &= !other.0;
    }
}

/// The metadata prefixing every cached payload.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BufferHeader {
    /// Payload size in bytes (the header itself excluded).
    pub size: u32,
    /// Global seqno, or [`Seqno::NONE`] until assignment.
    pub seqno: Seqno,
    pub flags: BufferFlags,
    pub store: StoreId,
}

impl BufferHeader {
    pub fn new(size: u32, store: StoreId) -> BufferHeader {
        BufferHeader {
            size,
            seqno: Seqno::NONE,
            flags: BufferFlags::none(),
            store,
        }
    }

    pub fn is_released(&self) -> bool {
        self.flags.contains(BufferFlags::RELEASED)
    }

    pub fn encode(&self) -> [u8; BUFFER_HEADER_LEN] {
        let mut bytes = [0u8; BUFFER_HEADER_LEN];
        bytes[0..4].copy_from_slice(&BUFFER_MAGIC.to_le_bytes());
        bytes[4..8].copy_from_slice(&self.size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.seqno.int().to_le_bytes());
        bytes[16..18].copy_from_slice(&self.flags.bits().to_le_bytes());
        bytes[18] = self.store as u8;
        bytes
    }

    /// Decode a header from the front of `bytes`. `None` means "no record here":
    /// either unwritten space or a deliberately erased record.
    pub fn decode(bytes: &[u8]) -> Option<BufferHeader> {
        if bytes.len() < BUFFER_HEADER_LEN {
            return None;
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[0..4]);
        if u32::from_le_bytes(magic) != BUFFER_MAGIC {
            return None;
        }
        let mut size = [0u8; 4];
        size.copy_from_slice(&bytes[4..8]);
        let mut seqno = [0u8; 8];
        seqno.copy_from_slice(&bytes[8..16]);
        let mut flags = [0u8; 2];
        flags.copy_from_slice(&bytes[16..18]);
        let store = StoreId::from_u8(bytes[18])?;
        Some(BufferHeader {
            size: u32::from_le_bytes(size),
            seqno: Seqno::new(i64::from_le_bytes(seqno)),
            flags: BufferFlags(u16::from_le_bytes(flags)),
            store,
        })
    }

    /// Overwrite the magic so a rescan no longer sees this record.
    pub fn erase(bytes: &mut [u8]) {
        bytes[0..4].copy_from_slice(&0u32.to_le_bytes());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trip() {
        let mut header = BufferHeader::new(512, StoreId::Page);
        header.seqno = Seqno::new(77);
        header.flags.set(BufferFlags::RELEASED);
        let bytes = header.encode();
        assert_eq!(BufferHeader::decode(&bytes), Some(header));
    }

    #[test]
    fn erased_header_decodes_to_none() {
        let header = BufferHeader::new(16, StoreId::Mem);
        let mut bytes = header.encode();
        BufferHeader::erase(&mut bytes);
        assert_eq!(BufferHeader::decode(&bytes), None);
    }

    #[test]
    fn flag_set_and_clear() {
        let mut flags = BufferFlags::none();
        flags.set(BufferFlags::RELEASED);
        flags.set(BufferFlags::SKIPPED);
        assert!(flags.contains(BufferFlags::RELEASED));
        flags.clear(BufferFlags::RELEASED);
        assert!(!flags.contains(BufferFlags::RELEASED));
        assert!(flags.contains(BufferFlags::SKIPPED));
    }
}
