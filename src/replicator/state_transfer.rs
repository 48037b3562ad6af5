/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! State transfer: how a member whose state lags behind the cluster catches up.
//!
//! Two mechanisms, chosen by how far behind the joiner is:
//! - **SST** (snapshot state transfer): the donor ships a full state snapshot produced
//!   by the embedding database. Needed when the joiner's replication history id does
//!   not match the group's.
//! - **IST** (incremental state transfer): the donor streams the seqno range the
//!   joiner is missing out of its write-set cache. Possible whenever the donor's cache
//!   still holds the joiner's resume point.
//!
//! Both travel point-to-point over the member transport, outside the totally-ordered
//! channel. The [IST server](start_ist_server) is a dedicated thread serving cache
//! ranges to any requester; it refuses ranges that have fallen out of the cache, which
//! sends the joiner back to a full snapshot.

use std::collections::BTreeMap;
use std::sync::mpsc::{Receiver, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::cache::WriteSetCache;
use crate::network::{Network, WireMessage};
use crate::types::basic::{MemberId, Seqno, StateId};

/// How many write-sets one IST response carries.
const IST_BATCH: usize = 64;

/// A joiner asks a donor for the write-set range it is missing.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct IstRequest {
    /// The joiner's replication history id, so the donor can sanity-check the range
    /// belongs to the same history.
    pub state_id: StateId,
    /// First seqno the joiner needs.
    pub from_seqno: Seqno,
    /// Last seqno the joiner needs (the group position at its configuration change).
    pub to_seqno: Seqno,
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum IstResponse {
    /// A full state snapshot, produced by the donor's database.
    Snapshot {
        state_id: StateId,
        /// The seqno the snapshot is consistent at.
        seqno: Seqno,
        data: Vec<u8>,
    },
    /// A batch of cached write-sets, in ascending seqno order.
    WriteSets { entries: Vec<IstEntry>, last: bool },
    /// The requested range is no longer cached; the joiner must fall back to SST.
    Refused { first_available: Seqno },
}

#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub struct IstEntry {
    pub seqno: Seqno,
    /// The serialized write-set, exactly as it was replicated.
    pub payload: Vec<u8>,
}

/// Replication state of a group member, tracked from the totally-ordered action
/// stream so that every member sees the same table.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MemberState {
    pub joined: bool,
    pub synced: bool,
    pub dataless: bool,
}

/// Deterministic donor selection: every member evaluates this against the same member
/// table and agrees on the donor. The hinted donor wins if usable; otherwise the
/// lowest-id synced member that holds state. Arbitrators (dataless members) never
/// donate.
pub fn pick_donor(
    members: &BTreeMap<MemberId, MemberState>,
    hint: Option<MemberId>,
    joiner: MemberId,
) -> Option<MemberId> {
    let usable = |member: &MemberId| {
        members
            .get(member)
            .map(|state| state.synced && !state.dataless && *member != joiner)
            .unwrap_or(false)
    };
    if let Some(hinted) = hint {
        if usable(&hinted) {
            return Some(hinted);
        }
    }
    members.keys().find(|member| usable(member)).copied()
}

/// Start the IST server: serves cache ranges to joiners until shut down.
pub(crate) fn start_ist_server<N: Network>(
    cache: Arc<WriteSetCache>,
    mut network: N,
    requests: Receiver<(MemberId, IstRequest)>,
    shutdown_signal: Receiver<()>,
) -> JoinHandle<()> {
    thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => return,
        }

        match requests.try_recv() {
            Ok((joiner, request)) => {
                serve_range(&cache, &mut network, joiner, request);
            }
            Err(TryRecvError::Empty) => thread::yield_now(),
            Err(TryRecvError::Disconnected) => return,
        }
    })
}

fn serve_range<N: Network>(
    cache: &Arc<WriteSetCache>,
    network: &mut N,
    joiner: MemberId,
    request: IstRequest,
) {
    let first_available = cache.first_seqno().unwrap_or(Seqno::MAX);
    if request.from_seqno < first_available {
        log::warn!(
            "ist: {} asked for {}..{} but cache starts at {}; refusing",
            joiner,
            request.from_seqno,
            request.to_seqno,
            first_available
        );
        network.send(
            joiner,
            WireMessage::IstResponse(IstResponse::Refused { first_available }),
        );
        return;
    }

    log::info!(
        "ist: serving {}..{} to {}",
        request.from_seqno,
        request.to_seqno,
        joiner
    );
    let mut entries = Vec::with_capacity(IST_BATCH);
    let mut seqno = request.from_seqno;
    while seqno <= request.to_seqno {
        match cache.read(seqno) {
            Some(payload) => entries.push(IstEntry { seqno, payload }),
            None => {
                // A hole inside the requested range: certification-rejected write-sets
                // are cached too, so this means the range is gone. Give up cleanly.
                log::warn!("ist: seqno {} missing mid-range; refusing {}", seqno, joiner);
                network.send(
                    joiner,
                    WireMessage::IstResponse(IstResponse::Refused { first_available }),
                );
                return;
            }
        }
        let last = seqno == request.to_seqno;
        if entries.len() == IST_BATCH || last {
            network.send(
                joiner,
                WireMessage::IstResponse(IstResponse::WriteSets {
                    entries: std::mem::take(&mut entries),
                    last,
                }),
            );
        }
        seqno = seqno.next();
    }
}
