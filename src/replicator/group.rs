/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! The group thread: owns the EVS, PC, and GCS state machines and is the only place
//! where network traffic turns into ordered actions.
//!
//! Inputs: transport events from the poller, origination requests from the send FIFO,
//! and the leave command from `close()`. Output: [`GcsAction`]s pushed (blocking, which
//! is the backpressure against slow appliers) onto the delivered-action FIFO consumed
//! by the certifier thread.

use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::Configuration;
use crate::evs::{EvsOutput, EvsProto};
use crate::gcs::fifo::ActionFifo;
use crate::gcs::{GcsAction, GcsCore, GcsShared, NodeState};
use crate::network::{GroupEvent, Network, WireMessage};
use crate::pc::{PcOutput, PcProto};
use crate::types::basic::MemberId;

use super::{GroupCommand, Outgoing};

/// How long one loop iteration waits for a network event before servicing timers and
/// the send FIFO again.
const TICK: Duration = Duration::from_millis(2);

pub(crate) fn start_group_thread<N: Network>(
    me: MemberId,
    config: Configuration,
    mut network: N,
    shared: Arc<GcsShared>,
    recv: ActionFifo<GcsAction>,
    outgoing: ActionFifo<Outgoing>,
    group_events: Receiver<GroupEvent>,
    commands: Receiver<GroupCommand>,
) -> JoinHandle<()> {
    thread::spawn(move || {
        let mut evs = EvsProto::new(me, config.evs.clone());
        let mut pc = PcProto::new(me, config.pc.clone());
        let mut gcs = GcsCore::new(me, Arc::clone(&shared));
        let mut leaving = false;

        loop {
            match commands.try_recv() {
                Ok(GroupCommand::Leave) if !leaving => {
                    leaving = true;
                    let outputs = evs.leave();
                    if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared)
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(GroupCommand::Leave) => (),
                Err(TryRecvError::Empty) => (),
                Err(TryRecvError::Disconnected) => return,
            }

            // Drain origination requests into EVS.
            while let Some(out) = outgoing.try_pop() {
                match evs.send_user(out.user_type, out.payload) {
                    Ok(outputs) => {
                        if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared)
                            .is_err()
                        {
                            return;
                        }
                    }
                    Err(_) => break,
                }
            }

            match group_events.recv_timeout(TICK) {
                Ok(GroupEvent::Evs(from, message)) => {
                    let outputs = evs.handle_message(from, message);
                    if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared)
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(GroupEvent::Pc(from, message)) => {
                    let outputs = pc.handle_message(from, message);
                    if execute_pc(outputs, &mut gcs, &mut network, &recv).is_err() {
                        return;
                    }
                }
                Ok(GroupEvent::PeerLive(peer)) => {
                    let outputs = evs.handle_peer_live(peer);
                    if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared)
                        .is_err()
                    {
                        return;
                    }
                }
                Ok(GroupEvent::PeerDead(peer)) => {
                    let outputs = evs.handle_peer_dead(peer);
                    if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared)
                        .is_err()
                    {
                        return;
                    }
                }
                Err(RecvTimeoutError::Timeout) => (),
                Err(RecvTimeoutError::Disconnected) => return,
            }

            let outputs = evs.handle_timer();
            if execute_evs(outputs, &mut pc, &mut gcs, &mut network, &recv, &shared).is_err() {
                return;
            }

            if leaving {
                // The leave has been broadcast and the final empty view delivered;
                // nothing more will arrive through EVS.
                return;
            }
        }
    })
}

/// Executing outputs failed only when the delivered-action FIFO has closed, which
/// means the node is shutting down.
struct Stop;

fn execute_evs<N: Network>(
    outputs: Vec<EvsOutput>,
    pc: &mut PcProto,
    gcs: &mut GcsCore,
    network: &mut N,
    recv: &ActionFifo<GcsAction>,
    shared: &Arc<GcsShared>,
) -> Result<(), Stop> {
    for output in outputs {
        match output {
            EvsOutput::Broadcast(message) => network.broadcast(WireMessage::Evs(message)),
            EvsOutput::Send(peer, message) => network.send(peer, WireMessage::Evs(message)),
            EvsOutput::Deliver(delivery) => {
                for action in gcs.handle_delivery(delivery) {
                    if recv.push(action).is_err() {
                        return Err(Stop);
                    }
                }
            }
            EvsOutput::DeliverView(view) => {
                gcs.begin_view_change();
                let synced = shared.node_state() == NodeState::Synced;
                let pc_outputs = pc.handle_evs_view(view, gcs.last_seqno(), synced);
                execute_pc(pc_outputs, gcs, network, recv)?;
            }
        }
    }
    Ok(())
}

fn execute_pc<N: Network>(
    outputs: Vec<PcOutput>,
    gcs: &mut GcsCore,
    network: &mut N,
    recv: &ActionFifo<GcsAction>,
) -> Result<(), Stop> {
    for output in outputs {
        match output {
            PcOutput::Broadcast(message) => network.broadcast(WireMessage::Pc(message)),
            PcOutput::DeliverView(decided) => {
                for action in gcs.handle_decided_view(decided) {
                    if recv.push(action).is_err() {
                        return Err(Stop);
                    }
                }
            }
        }
    }
    Ok(())
}
