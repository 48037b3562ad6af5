/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Newtypes for the scalar quantities that flow through the pipeline: global and local
//! sequence numbers, member identifiers, transaction identifiers, and replication state
//! identifiers.

use std::{
    fmt::{self, Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub},
};

use base64::{engine::general_purpose::STANDARD_NO_PAD, Engine as _};
use borsh::{BorshDeserialize, BorshSerialize};
use rand::RngCore;

/// Global sequence number: the position of a replicated action in the cluster-wide total
/// order.
///
/// Assigned identically by every member at the sequencing layer. Signed so that the
/// [`NONE`](Seqno::NONE) sentinel sorts below every assigned seqno.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct Seqno(i64);

impl Seqno {
    /// Sentinel for "no seqno assigned yet".
    pub const NONE: Seqno = Seqno(-1);

    /// Open upper bound, used as the initial value of seqno locks.
    pub const MAX: Seqno = Seqno(i64::MAX);

    pub const fn new(int: i64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> i64 {
        self.0
    }

    pub const fn is_none(&self) -> bool {
        self.0 < 0
    }

    /// The seqno immediately after this one.
    pub fn next(&self) -> Seqno {
        Seqno(self.0 + 1)
    }
}

impl Display for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Debug for Seqno {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

impl Add<i64> for Seqno {
    type Output = Seqno;

    fn add(self, rhs: i64) -> Self::Output {
        Seqno(self.0 + rhs)
    }
}

impl AddAssign<i64> for Seqno {
    fn add_assign(&mut self, rhs: i64) {
        self.0 += rhs
    }
}

impl Sub<i64> for Seqno {
    type Output = Seqno;

    fn sub(self, rhs: i64) -> Self::Output {
        Seqno(self.0 - rhs)
    }
}

impl Sub<Seqno> for Seqno {
    type Output = i64;

    fn sub(self, rhs: Seqno) -> Self::Output {
        self.0 - rhs.0
    }
}

/// Per-member ordinal over every locally delivered action, including control actions that
/// carry no global seqno. Separate from [`Seqno`].
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, BorshDeserialize, BorshSerialize,
)]
pub struct LocalSeqno(u64);

impl LocalSeqno {
    pub const fn init() -> Self {
        Self(0)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }

    pub fn increment(&mut self) -> LocalSeqno {
        self.0 += 1;
        *self
    }
}

/// 128-bit member identifier, generated at process start and stable for the process
/// lifetime.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct MemberId([u8; 16]);

impl MemberId {
    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate a fresh random member identifier from the OS entropy source.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn bytes(&self) -> [u8; 16] {
        self.0
    }

    /// Short base64 tag used in log lines.
    pub fn tag(&self) -> String {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        encoded[0..7].to_string()
    }
}

impl Display for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Debug for MemberId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

/// Locally-assigned transaction identifier, supplied by the embedding database when it
/// hands a write-set to [`replicate`](crate::replicator::Replicator::replicate).
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct TrxId(u64);

impl TrxId {
    pub const fn new(int: u64) -> Self {
        Self(int)
    }

    pub const fn int(&self) -> u64 {
        self.0
    }
}

impl Display for TrxId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// Identity of a replication history. Members with equal `StateId`s hold prefixes of the
/// same totally-ordered write-set stream; a joiner whose `StateId` differs from the
/// group's needs a full state snapshot before it can apply.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct StateId([u8; 16]);

impl StateId {
    /// Sentinel for "no replication history yet": the undefined state of a freshly
    /// initialized member.
    pub const UNDEFINED: StateId = StateId([0u8; 16]);

    pub const fn new(bytes: [u8; 16]) -> Self {
        Self(bytes)
    }

    /// Generate the identity of a new replication history. Called once, by the first
    /// primary component of a bootstrapping cluster.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    pub const fn is_undefined(&self) -> bool {
        let mut i = 0;
        while i < 16 {
            if self.0[i] != 0 {
                return false;
            }
            i += 1;
        }
        true
    }

    pub fn tag(&self) -> String {
        let encoded = STANDARD_NO_PAD.encode(self.0);
        encoded[0..7].to_string()
    }
}

impl Display for StateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

impl Debug for StateId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(&self.tag())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seqno_sentinels_order_below_assigned() {
        assert!(Seqno::NONE < Seqno::new(0));
        assert!(Seqno::new(0) < Seqno::MAX);
        assert!(Seqno::NONE.is_none());
        assert!(!Seqno::new(0).is_none());
    }

    #[test]
    fn seqno_arithmetic() {
        let s = Seqno::new(41);
        assert_eq!(s.next(), Seqno::new(42));
        assert_eq!(s + 2, Seqno::new(43));
        assert_eq!(Seqno::new(43) - s, 2);
    }

    #[test]
    fn member_id_tag_is_seven_chars() {
        assert_eq!(MemberId::generate().tag().len(), 7);
    }

    #[test]
    fn undefined_state_id() {
        assert!(StateId::UNDEFINED.is_undefined());
        assert!(!StateId::generate().is_undefined());
    }
}
