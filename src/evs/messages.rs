/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages of the EVS (extended virtual synchrony) protocol.
//!
//! ## Sequencing
//!
//! User messages carry a cluster-logical sequence number `seq`, assigned by the sender
//! with the Lamport rule (one past the highest sequence it has seen). Total order is
//! `(seq, source)`. Because every source's sequence numbers strictly increase and links
//! are FIFO, a member that has seen evidence of a peer's clock at `c` knows that peer
//! will never produce a message sequenced at or below `c`; the minimum of that knowledge
//! over all view members is the member's `aru` ("all received up to"). A message is
//! delivered *safe* once every view member has reported an `aru` at or above its
//! sequence.
//!
//! ## Membership
//!
//! [`Join`](EvsMessage::Join) messages propose a member set during a membership round,
//! carry the sender's clock and aru, and enumerate the sender's undelivered ("held
//! back") messages so that partners can recover messages they are missing before the
//! round completes. The elected representative (lowest member id in the agreed set)
//! broadcasts [`Install`](EvsMessage::Install), upon which members flush their held-back
//! messages and install the new view.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::MemberId;
use crate::types::view::ViewId;

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum EvsMessage {
    User(UserMessage),
    Gap(GapMessage),
    Join(JoinMessage),
    Install(InstallMessage),
    Leave(LeaveMessage),
    RetransmitRequest(RetransmitRequest),
    Retransmit(Retransmit),
}

/// An application payload multicast within a view.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct UserMessage {
    /// The member that sent this message; part of the `(seq, source)` total order.
    pub source: MemberId,
    /// The view this message was sequenced in. Messages from other views are not
    /// delivered directly; they surface, if at all, through membership-round recovery.
    pub view_id: ViewId,
    /// Cluster-logical sequence number.
    pub seq: u64,
    /// The sender's aru at send time, piggybacked so that idle receivers learn the
    /// safety horizon without extra traffic.
    pub aru: u64,
    /// Multiplexing tag for the layer above (the GCS action kind).
    pub user_type: u8,
    pub payload: Vec<u8>,
}

/// An acknowledgement: advances the sender's advertised clock and aru without carrying
/// a payload. Sent whenever either advances and no user message is about to piggyback
/// them.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct GapMessage {
    pub view_id: ViewId,
    /// The sender's clock: it will never sequence a message at or below this.
    pub clock: u64,
    /// The sender's aru.
    pub aru: u64,
}

/// Membership-round state exchange.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct JoinMessage {
    /// The sender's last installed view.
    pub view_id: ViewId,
    /// The member set the sender proposes for the next view, in ascending order.
    pub members: Vec<MemberId>,
    pub clock: u64,
    pub aru: u64,
    /// `(seq, source)` ids of the sender's held-back (received but undelivered)
    /// messages from its current view.
    pub have: Vec<(u64, MemberId)>,
}

/// Installs the view agreed by a membership round. Only the representative (lowest
/// member id of the agreed set) sends this.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct InstallMessage {
    pub new_view: ViewId,
    /// Members of the new view, in ascending order.
    pub members: Vec<MemberId>,
}

/// Graceful leave announcement; receivers start a membership round promptly instead of
/// waiting for transport-level eviction.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct LeaveMessage {
    pub view_id: ViewId,
}

/// Asks a membership-round partner to retransmit held-back messages this member is
/// missing.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct RetransmitRequest {
    pub ids: Vec<(u64, MemberId)>,
}

/// Retransmission of held-back messages during a membership round.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct Retransmit {
    pub messages: Vec<UserMessage>,
}
