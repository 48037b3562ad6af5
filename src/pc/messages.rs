/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Structured messages of the primary-component protocol.

use borsh::{BorshDeserialize, BorshSerialize};

use crate::types::basic::{MemberId, Seqno, StateId};
use crate::types::view::ViewId;

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum PcMessage {
    State(PcState),
    Install(PcInstall),
}

/// A record of a primary component a member once belonged to: enough to evaluate the
/// majority rule when the next view forms.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PrimRecord {
    pub view_id: ViewId,
    /// The members of that primary component and their voting weights at the time.
    pub members: Vec<(MemberId, u32)>,
    pub state_id: StateId,
}

/// Per-member state, exchanged on every installed EVS view.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct PcState {
    /// The EVS view this state exchange belongs to.
    pub view_id: ViewId,
    /// This member's voting weight (`pc.weight`).
    pub weight: u32,
    /// Set when the operator force-bootstraps a fresh cluster (`pc.bootstrap`).
    pub bootstrap: bool,
    /// An arbitrator: votes, but holds no state and must never donate.
    pub dataless: bool,
    /// The latest primary component this member has belonged to, if any.
    pub last_prim: Option<PrimRecord>,
    /// This member's replication history id.
    pub state_id: StateId,
    /// The highest global seqno this member has assigned, so that members entering the
    /// group align their counters at the configuration change.
    pub last_seqno: Seqno,
    /// Whether this member is synced (fully caught up and applying).
    pub synced: bool,
}

/// Broadcast by the representative of a bootstrapping primary component to distribute
/// the freshly generated replication history id.
#[derive(Clone, Debug, PartialEq, Eq, BorshSerialize, BorshDeserialize)]
pub struct PcInstall {
    pub view_id: ViewId,
    pub state_id: StateId,
}
