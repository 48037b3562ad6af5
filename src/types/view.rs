/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Cluster views: immutable snapshots of group membership, emitted by the group
//! communication layer on every membership change.
//!
//! A view is a barrier in the delivery stream: no message ordered in view `v` is delivered
//! after view `v + 1` has been delivered. A member may commit write-sets only while the
//! current view is [primary](ViewKind::Primary).

use std::fmt::{self, Display, Formatter};

use borsh::{BorshDeserialize, BorshSerialize};

use super::basic::{MemberId, StateId};

/// Identity of a view: the member that represented the membership round which installed
/// it, plus a counter that increases with every installed view.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, BorshDeserialize, BorshSerialize,
)]
pub struct ViewId {
    pub representative: MemberId,
    pub seq: u32,
}

impl ViewId {
    pub const fn new(representative: MemberId, seq: u32) -> Self {
        Self {
            representative,
            seq,
        }
    }
}

impl Display for ViewId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.representative, self.seq)
    }
}

/// Whether a view may commit.
#[derive(Clone, Copy, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub enum ViewKind {
    /// The view holds a quorum of the previous primary component; members may commit.
    Primary,
    /// A minority partition. Membership is delivered, but no write-set may commit.
    NonPrimary,
    /// The view delivered when a member leaves the group; contains no members.
    Empty,
}

/// An immutable membership snapshot.
#[derive(Clone, Debug, PartialEq, Eq, BorshDeserialize, BorshSerialize)]
pub struct View {
    pub id: ViewId,
    pub kind: ViewKind,
    /// Members of this view, in ascending [`MemberId`] order.
    pub members: Vec<MemberId>,
    /// Position of the local member in `members`, or `usize::MAX` for an
    /// [`Empty`](ViewKind::Empty) view.
    pub my_index: usize,
    /// Identity of the replication history this view continues.
    pub state_id: StateId,
}

impl View {
    /// The view that exists before any connection attempt, and after a graceful leave.
    pub fn empty() -> View {
        View {
            id: ViewId::new(MemberId::new([0u8; 16]), 0),
            kind: ViewKind::Empty,
            members: Vec::new(),
            my_index: usize::MAX,
            state_id: StateId::UNDEFINED,
        }
    }

    pub fn is_primary(&self) -> bool {
        self.kind == ViewKind::Primary
    }

    pub fn is_empty(&self) -> bool {
        self.kind == ViewKind::Empty
    }

    pub fn contains(&self, member: &MemberId) -> bool {
        self.members.binary_search(member).is_ok()
    }

    /// The local member's id, if this view contains it.
    pub fn my_id(&self) -> Option<MemberId> {
        self.members.get(self.my_index).copied()
    }
}

impl Display for View {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "view {} {:?} [{}]",
            self.id,
            self.kind,
            self.members
                .iter()
                .map(|m| m.tag())
                .collect::<Vec<_>>()
                .join(" ")
        )
    }
}
