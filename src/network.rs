/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! [Trait definition](Network) for the pluggable member-to-member transport, as well as
//! the poller thread that distributes received messages to the threads that consume them.
//!
//! The production transport is [GMCast](crate::gmcast): a TCP/TLS mesh driven by the
//! [reactor](crate::reactor). Tests substitute a channel-based stub. Either way, peers
//! are addressed by [`MemberId`] and the transport reports peer liveness transitions
//! alongside received messages; the EVS protocol turns those transitions into membership
//! rounds.

use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread::{self, JoinHandle};

use borsh::{BorshDeserialize, BorshSerialize};

use crate::evs::messages::EvsMessage;
use crate::pc::messages::PcMessage;
use crate::replicator::state_transfer::{IstRequest, IstResponse};
use crate::types::basic::MemberId;

/// Everything that travels between members, wrapped for dispatch.
#[derive(Clone, Debug, BorshSerialize, BorshDeserialize)]
pub enum WireMessage {
    Evs(EvsMessage),
    Pc(PcMessage),
    IstRequest(IstRequest),
    IstResponse(IstResponse),
}

/// A received message or a liveness transition observed by the transport.
#[derive(Clone, Debug)]
pub enum NetworkEvent {
    Message(MemberId, WireMessage),
    /// A peer has completed the transport handshake and is reachable.
    PeerLive(MemberId),
    /// A peer has been evicted (connection loss or keepalive timeout).
    PeerDead(MemberId),
}

/// The transport seam. Implementations must be cheaply cloneable handles onto a shared
/// transport; sends never block.
pub trait Network: Clone + Send + 'static {
    /// Send a message to every currently reachable peer, excluding the local member.
    fn broadcast(&mut self, message: WireMessage);

    /// Send a message to the specified peer. Silently dropped if the peer is not
    /// reachable; reliability above single-link delivery is EVS's concern.
    fn send(&mut self, peer: MemberId, message: WireMessage);

    /// Receive the next event, if one is available now.
    fn recv(&mut self) -> Option<NetworkEvent>;

    /// Tear the transport down. Peers observe the closure as connection loss.
    fn close(&mut self) {}
}

/// Events routed to the group thread: EVS and PC traffic plus liveness transitions.
#[derive(Clone, Debug)]
pub enum GroupEvent {
    Evs(MemberId, EvsMessage),
    Pc(MemberId, PcMessage),
    PeerLive(MemberId),
    PeerDead(MemberId),
}

/// Spawn the poller thread, which polls the [`Network`] and distributes events to:
/// 1. group-protocol traffic, consumed by the group thread, and
/// 2. state-transfer requests, consumed by the IST server, and
/// 3. state-transfer responses, consumed by the joining replicator.
pub(crate) fn start_polling<N: Network>(
    mut network: N,
    shutdown_signal: Receiver<()>,
) -> (
    JoinHandle<()>,
    Receiver<GroupEvent>,
    Receiver<(MemberId, IstRequest)>,
    Receiver<(MemberId, IstResponse)>,
) {
    let (to_group, group_events) = mpsc::channel();
    let (to_ist_server, ist_requests) = mpsc::channel();
    let (to_ist_client, ist_responses) = mpsc::channel();

    let poller = thread::spawn(move || loop {
        match shutdown_signal.try_recv() {
            Ok(()) => return,
            Err(TryRecvError::Empty) => (),
            Err(TryRecvError::Disconnected) => {
                panic!("poller thread disconnected from main thread")
            }
        }

        match network.recv() {
            Some(NetworkEvent::Message(origin, message)) => match message {
                WireMessage::Evs(msg) => {
                    let _ = to_group.send(GroupEvent::Evs(origin, msg));
                }
                WireMessage::Pc(msg) => {
                    let _ = to_group.send(GroupEvent::Pc(origin, msg));
                }
                WireMessage::IstRequest(req) => {
                    let _ = to_ist_server.send((origin, req));
                }
                WireMessage::IstResponse(res) => {
                    let _ = to_ist_client.send((origin, res));
                }
            },
            Some(NetworkEvent::PeerLive(peer)) => {
                let _ = to_group.send(GroupEvent::PeerLive(peer));
            }
            Some(NetworkEvent::PeerDead(peer)) => {
                let _ = to_group.send(GroupEvent::PeerDead(peer));
            }
            None => thread::yield_now(),
        }
    });

    (poller, group_events, ist_requests, ist_responses)
}
