/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Transaction write-sets: the unit of replication.
//!
//! A write-set is prepared by the embedding database on the originating member. It carries
//! the certification keys the transaction read or wrote, the opaque binary change-log the
//! database will replay on remote members, and the originator's snapshot horizon
//! (`last_seen`): the highest global seqno the originator had applied when the write-set
//! was built. Certification compares `last_seen` against the index of recently certified
//! key accesses to detect conflicts with concurrent transactions.

use borsh::{BorshDeserialize, BorshSerialize};
use sha2::{Digest, Sha256};

use super::basic::{MemberId, Seqno, TrxId};

/// A certification key: an ordered list of opaque byte strings drawn from the database's
/// key namespace (e.g., schema, table, primary key), plus a match tag.
///
/// A `full_match` key denotes an exclusive access (write); a partial key denotes a shared
/// access (reference). Two shared accesses to the same key do not conflict; an exclusive
/// access conflicts with both kinds.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WsKey {
    pub parts: Vec<Vec<u8>>,
    pub full_match: bool,
}

impl WsKey {
    pub fn exclusive(parts: Vec<Vec<u8>>) -> Self {
        Self {
            parts,
            full_match: true,
        }
    }

    pub fn shared(parts: Vec<Vec<u8>>) -> Self {
        Self {
            parts,
            full_match: false,
        }
    }

    /// 64-bit fingerprint of the key: the first 8 bytes of a SHA-256 digest over the
    /// length-prefixed parts. The match tag is not part of the fingerprint, so shared and
    /// exclusive accesses to the same key collide in the certification index.
    pub fn fingerprint(&self) -> KeyFingerprint {
        let mut hasher = Sha256::new();
        for part in &self.parts {
            hasher.update((part.len() as u32).to_le_bytes());
            hasher.update(part);
        }
        let digest = hasher.finalize();
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&digest[0..8]);
        KeyFingerprint(u64::from_le_bytes(bytes))
    }
}

/// Compressed form of a [`WsKey`] kept in the certification index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, BorshDeserialize, BorshSerialize)]
pub struct KeyFingerprint(pub u64);

/// Flags describing how a write-set is to be treated by certification and apply.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WsFlags(u16);

impl WsFlags {
    /// The write-set ends a transaction that is to be committed.
    pub const COMMIT: WsFlags = WsFlags(1);
    /// The write-set ends a transaction that is to be rolled back on every member.
    pub const ROLLBACK: WsFlags = WsFlags(1 << 1);
    /// Total-order isolation: applied serially, with no concurrent apply.
    pub const ISOLATION: WsFlags = WsFlags(1 << 2);
    /// The write-set must not be applied in parallel with any other.
    pub const PA_UNSAFE: WsFlags = WsFlags(1 << 3);
    /// The write-set commutes with concurrent write-sets and skips certification.
    pub const COMMUTATIVE: WsFlags = WsFlags(1 << 4);
    /// The payload is in the database's native change-log format.
    pub const NATIVE: WsFlags = WsFlags(1 << 5);

    pub const fn none() -> WsFlags {
        WsFlags(0)
    }

    pub const fn bits(&self) -> u16 {
        self.0
    }

    pub const fn contains(&self, other: WsFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn union(&self, other: WsFlags) -> WsFlags {
        WsFlags(self.0 | other.0)
    }
}

/// The unit of replication: certification keys plus the opaque change-log of one
/// transaction.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct WriteSet {
    /// The member that originated this write-set.
    pub source: MemberId,
    /// The originator's local transaction id; opaque to every other member.
    pub trx_id: TrxId,
    /// Snapshot horizon: the highest global seqno the originator had applied when this
    /// write-set was built.
    pub last_seen: Seqno,
    pub keys: Vec<WsKey>,
    pub data: Vec<u8>,
    pub flags: WsFlags,
}

impl WriteSet {
    /// Serialized size of this write-set on the wire.
    pub fn size(&self) -> usize {
        borsh::object_length(self).expect("write-set measures its own length")
    }

    pub fn is_commutative(&self) -> bool {
        self.flags.contains(WsFlags::COMMUTATIVE)
    }

    pub fn is_isolation(&self) -> bool {
        self.flags.contains(WsFlags::ISOLATION)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_ignores_match_tag() {
        let parts = vec![b"db".to_vec(), b"t1".to_vec(), b"pk".to_vec()];
        assert_eq!(
            WsKey::exclusive(parts.clone()).fingerprint(),
            WsKey::shared(parts).fingerprint()
        );
    }

    #[test]
    fn fingerprint_is_part_boundary_sensitive() {
        // ["ab", "c"] and ["a", "bc"] concatenate identically; the length prefix must
        // keep them distinct.
        let a = WsKey::exclusive(vec![b"ab".to_vec(), b"c".to_vec()]);
        let b = WsKey::exclusive(vec![b"a".to_vec(), b"bc".to_vec()]);
        assert_ne!(a.fingerprint(), b.fingerprint());
    }

    #[test]
    fn flags_union_and_contains() {
        let f = WsFlags::COMMIT.union(WsFlags::PA_UNSAFE);
        assert!(f.contains(WsFlags::COMMIT));
        assert!(f.contains(WsFlags::PA_UNSAFE));
        assert!(!f.contains(WsFlags::ROLLBACK));
    }
}
