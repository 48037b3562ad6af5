/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! PC: the primary-component protocol, layered over [EVS](crate::evs) views.
//!
//! On every installed EVS view, members exchange [`PcState`](messages::PcState)
//! messages. Once states from all view members are in, each member evaluates the same
//! deterministic rule:
//!
//! - If any member belonged to a primary component before, take the *latest* such
//!   component; the new view is primary iff its members hold a strict weight majority
//!   of it.
//! - If no primary component ever existed, the view is primary iff some member carries
//!   the operator bootstrap flag. The representative then generates the replication
//!   history id and distributes it with [`PcInstall`](messages::PcInstall).
//!
//! The outcome is handed up as a typed [`View`]: `Primary`, `NonPrimary`, or (on leave)
//! `Empty`. Members of a non-primary view keep delivering membership but must not
//! commit.

pub mod messages;

use std::collections::HashMap;

use crate::evs::EvsView;
use crate::types::basic::{MemberId, Seqno, StateId};
use crate::types::view::{View, ViewKind};

use self::messages::{PcInstall, PcMessage, PcState, PrimRecord};

/// Per-member PC configuration.
#[derive(Clone, Debug)]
pub struct PcConfig {
    /// Voting weight of this member in the majority computation.
    pub weight: u32,
    /// Operator override: allow this member to bootstrap a fresh primary component.
    pub bootstrap: bool,
    /// This member holds no database state (an arbitrator).
    pub dataless: bool,
}

impl Default for PcConfig {
    fn default() -> Self {
        PcConfig {
            weight: 1,
            bootstrap: false,
            dataless: false,
        }
    }
}

#[derive(Debug)]
pub enum PcOutput {
    Broadcast(PcMessage),
    /// The decided view, to be turned into a configuration-change action by GCS.
    DeliverView(DecidedView),
}

/// A decided view plus the group-level facts the sequencing layer needs alongside it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DecidedView {
    pub view: View,
    /// The highest global seqno assigned by any view member: members entering the
    /// group align their counters to this at the configuration change.
    pub group_seqno: Seqno,
    /// Replication state of each view member, gathered from the state exchange.
    pub members: Vec<PcMemberInfo>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PcMemberInfo {
    pub member: MemberId,
    pub synced: bool,
    pub dataless: bool,
}

pub struct PcProto {
    me: MemberId,
    config: PcConfig,
    /// The latest primary component this member belonged to.
    last_prim: Option<PrimRecord>,
    /// This member's replication history id; undefined until it bootstraps or joins a
    /// primary component.
    state_id: StateId,
    /// The EVS view whose state exchange is in progress or was last completed.
    evs_view: Option<EvsView>,
    states: HashMap<MemberId, PcState>,
    /// Whether the current round's view has been handed up already.
    round_delivered: bool,
}

impl PcProto {
    pub fn new(me: MemberId, config: PcConfig) -> PcProto {
        PcProto {
            me,
            config,
            last_prim: None,
            state_id: StateId::UNDEFINED,
            evs_view: None,
            states: HashMap::new(),
            round_delivered: false,
        }
    }

    pub fn state_id(&self) -> StateId {
        self.state_id
    }

    /// Begin a state exchange for a freshly installed EVS view. `last_seqno` and
    /// `synced` describe the local sequencing layer at this moment.
    pub fn handle_evs_view(
        &mut self,
        view: EvsView,
        last_seqno: Seqno,
        synced: bool,
    ) -> Vec<PcOutput> {
        let mut outputs = Vec::new();

        if view.members.is_empty() {
            // The final view of a leaving member.
            self.evs_view = Some(view.clone());
            self.round_delivered = true;
            outputs.push(PcOutput::DeliverView(DecidedView {
                view: View {
                    id: view.id,
                    kind: ViewKind::Empty,
                    members: Vec::new(),
                    my_index: usize::MAX,
                    state_id: self.state_id,
                },
                group_seqno: last_seqno,
                members: Vec::new(),
            }));
            return outputs;
        }

        self.states.clear();
        self.round_delivered = false;
        let my_state = PcState {
            view_id: view.id,
            weight: self.config.weight,
            bootstrap: self.config.bootstrap,
            dataless: self.config.dataless,
            last_prim: self.last_prim.clone(),
            state_id: self.state_id,
            last_seqno,
            synced,
        };
        self.states.insert(self.me, my_state.clone());
        self.evs_view = Some(view);
        outputs.push(PcOutput::Broadcast(PcMessage::State(my_state)));
        self.check_complete(&mut outputs);
        outputs
    }

    pub fn handle_message(&mut self, from: MemberId, message: PcMessage) -> Vec<PcOutput> {
        let mut outputs = Vec::new();
        match message {
            PcMessage::State(state) => {
                let current = match &self.evs_view {
                    Some(view) => view.id,
                    None => return outputs,
                };
                if state.view_id != current {
                    return outputs;
                }
                self.states.insert(from, state);
                self.check_complete(&mut outputs);
            }
            PcMessage::Install(install) => self.handle_install(from, install, &mut outputs),
        }
        outputs
    }

    fn check_complete(&mut self, outputs: &mut Vec<PcOutput>) {
        if self.round_delivered {
            return;
        }
        let view = match &self.evs_view {
            Some(view) => view.clone(),
            None => return,
        };
        if !view
            .members
            .iter()
            .all(|member| self.states.contains_key(member))
        {
            return;
        }

        // The latest primary component any round member has belonged to.
        let latest_prim: Option<PrimRecord> = view
            .members
            .iter()
            .filter_map(|member| self.states.get(member))
            .filter_map(|state| state.last_prim.clone())
            .max_by_key(|prim| (prim.view_id.seq, prim.view_id.representative));

        match latest_prim {
            Some(prim) => {
                let total: u64 = prim.members.iter().map(|(_, weight)| *weight as u64).sum();
                let present: u64 = prim
                    .members
                    .iter()
                    .filter(|(member, _)| view.members.binary_search(member).is_ok())
                    .map(|(_, weight)| *weight as u64)
                    .sum();
                if present * 2 > total {
                    self.deliver(view, ViewKind::Primary, prim.state_id, outputs);
                } else {
                    log::info!(
                        "pc: view {} holds {}/{} of primary {}: staying non-primary",
                        view.id,
                        present,
                        total,
                        prim.view_id
                    );
                    self.deliver(view, ViewKind::NonPrimary, self.state_id, outputs);
                }
            }
            None => {
                let bootstrap = view
                    .members
                    .iter()
                    .filter_map(|member| self.states.get(member))
                    .any(|state| state.bootstrap);
                if !bootstrap {
                    self.deliver(view, ViewKind::NonPrimary, self.state_id, outputs);
                    return;
                }
                // A fresh history: the representative mints its id; everyone else
                // waits for the install message.
                if view.members.first() == Some(&self.me) {
                    let state_id = StateId::generate();
                    log::info!("pc: bootstrapping history {} in view {}", state_id, view.id);
                    outputs.push(PcOutput::Broadcast(PcMessage::Install(PcInstall {
                        view_id: view.id,
                        state_id,
                    })));
                    self.deliver(view, ViewKind::Primary, state_id, outputs);
                }
            }
        }
    }

    fn handle_install(&mut self, from: MemberId, install: PcInstall, outputs: &mut Vec<PcOutput>) {
        if self.round_delivered {
            return;
        }
        let view = match &self.evs_view {
            Some(view) => view.clone(),
            None => return,
        };
        if install.view_id != view.id || view.members.first() != Some(&from) {
            return;
        }
        self.deliver(view, ViewKind::Primary, install.state_id, outputs);
    }

    fn deliver(
        &mut self,
        view: EvsView,
        kind: ViewKind,
        state_id: StateId,
        outputs: &mut Vec<PcOutput>,
    ) {
        self.round_delivered = true;
        let my_index = view
            .members
            .binary_search(&self.me)
            .expect("local member is part of every view it installs");

        if kind == ViewKind::Primary {
            self.state_id = state_id;
            let weights = view
                .members
                .iter()
                .map(|member| {
                    let weight = self
                        .states
                        .get(member)
                        .map(|state| state.weight)
                        .unwrap_or(1);
                    (*member, weight)
                })
                .collect();
            self.last_prim = Some(PrimRecord {
                view_id: view.id,
                members: weights,
                state_id,
            });
        }

        let group_seqno = view
            .members
            .iter()
            .filter_map(|member| self.states.get(member))
            .map(|state| state.last_seqno)
            .max()
            .unwrap_or(Seqno::NONE);
        let member_infos = view
            .members
            .iter()
            .map(|member| {
                let state = self.states.get(member);
                PcMemberInfo {
                    member: *member,
                    synced: state.map(|state| state.synced).unwrap_or(false),
                    dataless: state.map(|state| state.dataless).unwrap_or(false),
                }
            })
            .collect();

        log::info!("pc: delivering {:?} view {}", kind, view.id);
        outputs.push(PcOutput::DeliverView(DecidedView {
            view: View {
                id: view.id,
                kind,
                members: view.members,
                my_index,
                state_id,
            },
            group_seqno,
            members: member_infos,
        }));
    }
}
