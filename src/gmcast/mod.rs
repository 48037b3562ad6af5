/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! GMCast: the point-to-point TCP/TLS mesh between cluster members.
//!
//! Every member maintains a link to every other member it knows of. Peer discovery
//! starts from a seed list and continues by gossip: on handshake, and periodically, a
//! member sends its address book to its peers and dials any address it has not linked
//! yet. Liveness is tracked per link with keepalive frames; a peer that goes silent for
//! longer than the peer timeout is evicted and reported dead, which is the signal the
//! EVS layer turns into a membership round.
//!
//! The whole mesh runs on one I/O thread driving the [reactor](crate::reactor). The
//! [`Gmcast`] handle implements [`Network`]: sends are queued to the I/O thread and
//! received events are drained from a shared inbox.

pub mod messages;

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use indexmap::IndexMap;

use crate::config::GmcastConfig;
use crate::network::{Network, NetworkEvent, WireMessage};
use crate::reactor::socket::read_exactly;
use crate::reactor::{
    identity_engine_factory, Completion, EngineFactory, Reactor, ReactorInterrupter, Token,
};
use crate::types::basic::MemberId;

use self::messages::{
    encode_frame, FrameHeader, FrameType, Handshake, PeerAddress, Topology, FRAME_HEADER_LEN,
};

enum Command {
    Broadcast(WireMessage),
    Send(MemberId, WireMessage),
    Shutdown,
}

/// A cloneable handle onto the mesh. Implements [`Network`].
pub struct Gmcast {
    commands: Sender<Command>,
    interrupter: ReactorInterrupter,
    inbox: Arc<Mutex<Receiver<NetworkEvent>>>,
    io_thread: Arc<Mutex<Option<JoinHandle<()>>>>,
    local_addr: std::net::SocketAddr,
}

impl Clone for Gmcast {
    fn clone(&self) -> Self {
        Gmcast {
            commands: self.commands.clone(),
            interrupter: self.interrupter.clone(),
            inbox: Arc::clone(&self.inbox),
            io_thread: Arc::clone(&self.io_thread),
            local_addr: self.local_addr,
        }
    }
}

impl Gmcast {
    /// Bind the listener, spawn the I/O thread, and start dialing the seed list.
    pub fn open(me: MemberId, config: GmcastConfig) -> io::Result<Gmcast> {
        let (commands, command_receiver) = mpsc::channel();
        let (events_tx, events_rx) = mpsc::channel();

        // The reactor is created on the I/O thread; hand the interrupter back through a
        // channel so the constructor can return it.
        let (interrupter_tx, interrupter_rx) = mpsc::channel();
        let (bind_result_tx, bind_result_rx) = mpsc::channel();

        let io_thread = thread::spawn(move || {
            let mut reactor = Reactor::new();
            let _ = interrupter_tx.send(reactor.interrupter());

            let listener = match reactor.listen(config.listen_addr.clone(), engine_factory()) {
                Ok(listener) => {
                    let _ = bind_result_tx.send(
                        reactor
                            .local_addr(listener)
                            .map_err(|code| io::Error::new(io::ErrorKind::Other, code.to_string())),
                    );
                    listener
                }
                Err(code) => {
                    let _ = bind_result_tx.send(Err(io::Error::new(
                        io::ErrorKind::AddrInUse,
                        format!("cannot bind {}: {}", config.listen_addr, code),
                    )));
                    return;
                }
            };

            // Gossip must advertise the real bound address (the configured one may
            // have port 0).
            let mut config = config;
            if let Ok(bound) = reactor.local_addr(listener) {
                if config.listen_addr.ends_with(":0") {
                    config.listen_addr = bound.to_string();
                }
            }

            let mesh = Rc::new(RefCell::new(Mesh {
                me,
                config,
                links: HashMap::new(),
                by_member: HashMap::new(),
                address_book: IndexMap::new(),
                dialing: HashSet::new(),
                events_tx,
            }));

            arm_accept(&mut reactor, &mesh, listener);
            dial_seeds(&mut reactor, &mesh);
            arm_housekeeping(&mut reactor, Rc::clone(&mesh));
            arm_gossip(&mut reactor, Rc::clone(&mesh));

            io_loop(&mut reactor, &mesh, command_receiver);
        });

        let interrupter = interrupter_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "gmcast i/o thread died at start"))?;
        let local_addr = bind_result_rx
            .recv()
            .map_err(|_| io::Error::new(io::ErrorKind::Other, "gmcast i/o thread died at start"))??;

        Ok(Gmcast {
            commands,
            interrupter,
            inbox: Arc::new(Mutex::new(events_rx)),
            io_thread: Arc::new(Mutex::new(Some(io_thread))),
            local_addr,
        })
    }

    /// The address the mesh listener is actually bound to.
    pub fn local_addr(&self) -> std::net::SocketAddr {
        self.local_addr
    }

    /// Stop the I/O thread and close every link.
    pub fn close(&self) {
        let _ = self.commands.send(Command::Shutdown);
        self.interrupter.interrupt();
        if let Some(handle) = self
            .io_thread
            .lock()
            .expect("gmcast join handle lock poisoned")
            .take()
        {
            let _ = handle.join();
        }
    }
}

impl Network for Gmcast {
    fn broadcast(&mut self, message: WireMessage) {
        let _ = self.commands.send(Command::Broadcast(message));
        self.interrupter.interrupt();
    }

    fn send(&mut self, peer: MemberId, message: WireMessage) {
        let _ = self.commands.send(Command::Send(peer, message));
        self.interrupter.interrupt();
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        match self.inbox.lock().expect("gmcast inbox lock poisoned").try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            // The i/o thread is gone; the node is closing.
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn close(&mut self) {
        Gmcast::close(self);
    }
}

fn engine_factory() -> EngineFactory {
    // TLS slots in here: a factory constructing the TLS stream engine from the
    // socket.ssl_* configuration keys instead of the identity engine.
    identity_engine_factory()
}

struct Link {
    /// Set once the peer's handshake frame has been seen.
    peer: Option<MemberId>,
    /// The peer's listen address, for gossip. Known immediately on dialed links.
    listen_addr: Option<String>,
    outq: VecDeque<Vec<u8>>,
    writing: bool,
    established: bool,
    last_recv: Instant,
    frame_seq: u64,
}

impl Link {
    fn new(listen_addr: Option<String>) -> Link {
        Link {
            peer: None,
            listen_addr,
            outq: VecDeque::new(),
            writing: false,
            established: false,
            last_recv: Instant::now(),
            frame_seq: 0,
        }
    }
}

struct Mesh {
    me: MemberId,
    config: GmcastConfig,
    links: HashMap<Token, Link>,
    by_member: HashMap<MemberId, Token>,
    address_book: IndexMap<MemberId, String>,
    /// Addresses with a connection attempt in progress.
    dialing: HashSet<String>,
    events_tx: Sender<NetworkEvent>,
}

impl Mesh {
    fn queue_frame(&mut self, token: Token, frame_type: FrameType, payload: &[u8]) {
        let me = self.me;
        if let Some(link) = self.links.get_mut(&token) {
            link.frame_seq += 1;
            let frame = encode_frame(frame_type, me, link.frame_seq, payload);
            link.outq.push_back(frame);
        }
    }

    fn linked_addr(&self, addr: &str) -> bool {
        self.dialing.contains(addr)
            || self
                .links
                .values()
                .any(|link| link.listen_addr.as_deref() == Some(addr))
    }
}

fn io_loop(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, commands: Receiver<Command>) {
    loop {
        loop {
            match commands.try_recv() {
                Ok(Command::Broadcast(message)) => {
                    if let Ok(payload) = borsh::to_vec(&message) {
                        let tokens: Vec<Token> = {
                            let mesh_ref = mesh.borrow();
                            mesh_ref
                                .links
                                .iter()
                                .filter(|(_, link)| link.established)
                                .map(|(token, _)| *token)
                                .collect()
                        };
                        for token in tokens {
                            mesh.borrow_mut()
                                .queue_frame(token, FrameType::User, &payload);
                            pump_writes(reactor, mesh, token);
                        }
                    }
                }
                Ok(Command::Send(peer, message)) => {
                    if let Ok(payload) = borsh::to_vec(&message) {
                        let token = mesh.borrow().by_member.get(&peer).copied();
                        if let Some(token) = token {
                            mesh.borrow_mut()
                                .queue_frame(token, FrameType::User, &payload);
                            pump_writes(reactor, mesh, token);
                        }
                    }
                }
                Ok(Command::Shutdown) | Err(TryRecvError::Disconnected) => {
                    let tokens: Vec<Token> = mesh.borrow().links.keys().copied().collect();
                    for token in tokens {
                        reactor.close(token);
                    }
                    return;
                }
                Err(TryRecvError::Empty) => break,
            }
        }

        reactor.run_one(Duration::from_millis(10));
    }
}

fn arm_accept(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, listener: Token) {
    let mesh_for_handler = Rc::clone(mesh);
    let result = reactor.async_accept(
        listener,
        Box::new(move |reactor, completion| {
            if let Completion::Accept(Ok((token, peer_addr))) = completion {
                log::debug!("gmcast: accepted connection from {}", peer_addr);
                mesh_for_handler
                    .borrow_mut()
                    .links
                    .insert(token, Link::new(None));
                arm_read_header(reactor, &mesh_for_handler, token);
            }
            arm_accept(reactor, &mesh_for_handler, listener);
        }),
    );
    if result.is_err() {
        log::error!("gmcast: acceptor unusable");
    }
}

fn dial_seeds(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>) {
    let seeds: Vec<String> = mesh.borrow().config.seeds.clone();
    let own = mesh.borrow().config.listen_addr.clone();
    for seed in seeds {
        if seed != own {
            dial(reactor, mesh, seed);
        }
    }
}

fn dial(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, addr: String) {
    {
        let mut mesh_mut = mesh.borrow_mut();
        if mesh_mut.linked_addr(&addr) {
            return;
        }
        mesh_mut.dialing.insert(addr.clone());
    }

    let token_cell = Rc::new(Cell::new(0usize));
    let token_for_handler = Rc::clone(&token_cell);
    let mesh_for_handler = Rc::clone(mesh);
    let addr_for_handler = addr.clone();
    let token = reactor.async_connect(
        addr.clone(),
        (engine_factory())(),
        Box::new(move |reactor, completion| {
            let token = token_for_handler.get();
            mesh_for_handler.borrow_mut().dialing.remove(&addr_for_handler);
            match completion {
                Completion::Connect(Ok(())) => {
                    let handshake = {
                        let mut mesh_mut = mesh_for_handler.borrow_mut();
                        mesh_mut
                            .links
                            .insert(token, Link::new(Some(addr_for_handler.clone())));
                        Handshake {
                            group: mesh_mut.config.group.clone(),
                            listen_addr: mesh_mut.config.listen_addr.clone(),
                        }
                    };
                    let payload = borsh::to_vec(&handshake).expect("handshake serializes");
                    mesh_for_handler
                        .borrow_mut()
                        .queue_frame(token, FrameType::Handshake, &payload);
                    pump_writes(reactor, &mesh_for_handler, token);
                    arm_read_header(reactor, &mesh_for_handler, token);
                }
                _ => {
                    log::debug!("gmcast: dial {} failed", addr_for_handler);
                }
            }
        }),
    );
    token_cell.set(token);
}

fn arm_read_header(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, token: Token) {
    let mesh_for_handler = Rc::clone(mesh);
    let result = reactor.async_read(
        token,
        read_exactly(FRAME_HEADER_LEN),
        Box::new(move |reactor, completion| match completion {
            Completion::Read(Ok(bytes)) => match FrameHeader::decode(&bytes) {
                Ok(header) if header.payload_len == 0 => {
                    handle_frame(reactor, &mesh_for_handler, token, header, Vec::new());
                    arm_read_header(reactor, &mesh_for_handler, token);
                }
                Ok(header) => arm_read_payload(reactor, &mesh_for_handler, token, header),
                Err(err) => {
                    log::warn!("gmcast: bad frame header: {:?}", err);
                    drop_link(reactor, &mesh_for_handler, token);
                }
            },
            _ => drop_link(reactor, &mesh_for_handler, token),
        }),
    );
    if result.is_err() {
        drop_link(reactor, mesh, token);
    }
}

fn arm_read_payload(
    reactor: &mut Reactor,
    mesh: &Rc<RefCell<Mesh>>,
    token: Token,
    header: FrameHeader,
) {
    let mesh_for_handler = Rc::clone(mesh);
    let result = reactor.async_read(
        token,
        read_exactly(header.payload_len as usize),
        Box::new(move |reactor, completion| match completion {
            Completion::Read(Ok(payload)) => {
                handle_frame(reactor, &mesh_for_handler, token, header, payload);
                arm_read_header(reactor, &mesh_for_handler, token);
            }
            _ => drop_link(reactor, &mesh_for_handler, token),
        }),
    );
    if result.is_err() {
        drop_link(reactor, mesh, token);
    }
}

fn handle_frame(
    reactor: &mut Reactor,
    mesh: &Rc<RefCell<Mesh>>,
    token: Token,
    header: FrameHeader,
    payload: Vec<u8>,
) {
    {
        let mut mesh_mut = mesh.borrow_mut();
        if let Some(link) = mesh_mut.links.get_mut(&token) {
            link.last_recv = Instant::now();
        } else {
            return;
        }
    }

    match header.frame_type {
        FrameType::Handshake => {
            let handshake: Handshake = match borsh::from_slice(&payload) {
                Ok(handshake) => handshake,
                Err(_) => return drop_link(reactor, mesh, token),
            };
            let accept = {
                let mesh_ref = mesh.borrow();
                handshake.group == mesh_ref.config.group && header.source != mesh_ref.me
            };
            if !accept {
                log::warn!(
                    "gmcast: refusing link from {}: wrong group or self-connection",
                    header.source
                );
                return drop_link(reactor, mesh, token);
            }
            let reply = {
                let mut mesh_mut = mesh.borrow_mut();
                establish(&mut mesh_mut, token, header.source, handshake.listen_addr);
                Handshake {
                    group: mesh_mut.config.group.clone(),
                    listen_addr: mesh_mut.config.listen_addr.clone(),
                }
            };
            let reply_payload = borsh::to_vec(&reply).expect("handshake serializes");
            mesh.borrow_mut()
                .queue_frame(token, FrameType::HandshakeOk, &reply_payload);
            pump_writes(reactor, mesh, token);
            send_topology(reactor, mesh, token);
        }
        FrameType::HandshakeOk => {
            let handshake: Handshake = match borsh::from_slice(&payload) {
                Ok(handshake) => handshake,
                Err(_) => return drop_link(reactor, mesh, token),
            };
            {
                let mut mesh_mut = mesh.borrow_mut();
                establish(&mut mesh_mut, token, header.source, handshake.listen_addr);
            }
            send_topology(reactor, mesh, token);
        }
        FrameType::Keepalive => (),
        FrameType::Topology => {
            let topology: Topology = match borsh::from_slice(&payload) {
                Ok(topology) => topology,
                Err(_) => return,
            };
            let to_dial: Vec<String> = {
                let mut mesh_mut = mesh.borrow_mut();
                let me = mesh_mut.me;
                let mut to_dial = Vec::new();
                for entry in topology.peers {
                    if entry.member == me {
                        continue;
                    }
                    mesh_mut
                        .address_book
                        .insert(entry.member, entry.addr.clone());
                    if !mesh_mut.by_member.contains_key(&entry.member)
                        && !mesh_mut.linked_addr(&entry.addr)
                    {
                        to_dial.push(entry.addr);
                    }
                }
                to_dial
            };
            for addr in to_dial {
                dial(reactor, mesh, addr);
            }
        }
        FrameType::User => {
            let message: WireMessage = match borsh::from_slice(&payload) {
                Ok(message) => message,
                Err(err) => {
                    log::warn!("gmcast: undecodable user payload from {}: {}", header.source, err);
                    return;
                }
            };
            let mesh_ref = mesh.borrow();
            let _ = mesh_ref
                .events_tx
                .send(NetworkEvent::Message(header.source, message));
        }
    }
}

/// Mark a link established and record the peer in the member and address tables.
fn establish(mesh: &mut Mesh, token: Token, peer: MemberId, listen_addr: String) {
    let newly_live = {
        let link = match mesh.links.get_mut(&token) {
            Some(link) => link,
            None => return,
        };
        link.peer = Some(peer);
        link.listen_addr = Some(listen_addr.clone());
        let newly = !link.established;
        link.established = true;
        newly
    };
    mesh.address_book.insert(peer, listen_addr);
    mesh.by_member.insert(peer, token);
    if newly_live {
        log::info!("gmcast: peer {} live", peer);
        let _ = mesh.events_tx.send(NetworkEvent::PeerLive(peer));
    }
}

fn send_topology(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, token: Token) {
    let payload = {
        let mesh_ref = mesh.borrow();
        let mut peers: Vec<PeerAddress> = mesh_ref
            .address_book
            .iter()
            .map(|(member, addr)| PeerAddress {
                member: *member,
                addr: addr.clone(),
            })
            .collect();
        peers.push(PeerAddress {
            member: mesh_ref.me,
            addr: mesh_ref.config.listen_addr.clone(),
        });
        borsh::to_vec(&Topology { peers }).expect("topology serializes")
    };
    mesh.borrow_mut()
        .queue_frame(token, FrameType::Topology, &payload);
    pump_writes(reactor, mesh, token);
}

fn pump_writes(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, token: Token) {
    let frame = {
        let mut mesh_mut = mesh.borrow_mut();
        let link = match mesh_mut.links.get_mut(&token) {
            Some(link) => link,
            None => return,
        };
        if link.writing {
            return;
        }
        match link.outq.pop_front() {
            Some(frame) => {
                link.writing = true;
                frame
            }
            None => return,
        }
    };

    let mesh_for_handler = Rc::clone(mesh);
    let result = reactor.async_write(
        token,
        frame,
        Box::new(move |reactor, completion| {
            {
                let mut mesh_mut = mesh_for_handler.borrow_mut();
                if let Some(link) = mesh_mut.links.get_mut(&token) {
                    link.writing = false;
                }
            }
            match completion {
                Completion::Write(Ok(_)) => pump_writes(reactor, &mesh_for_handler, token),
                _ => drop_link(reactor, &mesh_for_handler, token),
            }
        }),
    );
    if result.is_err() {
        drop_link(reactor, mesh, token);
    }
}

fn drop_link(reactor: &mut Reactor, mesh: &Rc<RefCell<Mesh>>, token: Token) {
    let dead_peer = {
        let mut mesh_mut = mesh.borrow_mut();
        let link = match mesh_mut.links.remove(&token) {
            Some(link) => link,
            None => return,
        };
        match link.peer {
            Some(peer)
                if link.established && mesh_mut.by_member.get(&peer) == Some(&token) =>
            {
                mesh_mut.by_member.remove(&peer);
                Some(peer)
            }
            _ => None,
        }
    };
    reactor.close(token);
    if let Some(peer) = dead_peer {
        log::info!("gmcast: peer {} dead", peer);
        let _ = mesh.borrow().events_tx.send(NetworkEvent::PeerDead(peer));
    }
}

/// Keepalive, eviction, and reconnection. Re-arms itself.
fn arm_housekeeping(reactor: &mut Reactor, mesh: Rc<RefCell<Mesh>>) {
    let period = mesh.borrow().config.keepalive_period;
    reactor.steady_timer(
        period,
        Box::new(move |reactor, _| {
            let (stale, live): (Vec<Token>, Vec<Token>) = {
                let mesh_ref = mesh.borrow();
                let timeout = mesh_ref.config.peer_timeout;
                let now = Instant::now();
                let stale = mesh_ref
                    .links
                    .iter()
                    .filter(|(_, link)| now.duration_since(link.last_recv) > timeout)
                    .map(|(token, _)| *token)
                    .collect();
                let live = mesh_ref
                    .links
                    .iter()
                    .filter(|(_, link)| link.established)
                    .map(|(token, _)| *token)
                    .collect();
                (stale, live)
            };
            for token in stale {
                log::debug!("gmcast: evicting silent link");
                drop_link(reactor, &mesh, token);
            }
            for token in live {
                mesh.borrow_mut().queue_frame(token, FrameType::Keepalive, &[]);
                pump_writes(reactor, &mesh, token);
            }

            // Reconnect members we know addresses for but have no link to. This is what
            // heals a partition once the transport recovers.
            let to_dial: Vec<String> = {
                let mesh_ref = mesh.borrow();
                mesh_ref
                    .address_book
                    .iter()
                    .filter(|(member, addr)| {
                        !mesh_ref.by_member.contains_key(*member) && !mesh_ref.linked_addr(addr)
                    })
                    .map(|(_, addr)| addr.clone())
                    .collect()
            };
            for addr in to_dial {
                dial(reactor, &mesh, addr);
            }

            arm_housekeeping(reactor, Rc::clone(&mesh));
        }),
    );
}

/// Periodic gossip of the address book to every established link. Re-arms itself.
fn arm_gossip(reactor: &mut Reactor, mesh: Rc<RefCell<Mesh>>) {
    let period = mesh.borrow().config.gossip_period;
    reactor.steady_timer(
        period,
        Box::new(move |reactor, _| {
            let tokens: Vec<Token> = {
                let mesh_ref = mesh.borrow();
                mesh_ref
                    .links
                    .iter()
                    .filter(|(_, link)| link.established)
                    .map(|(token, _)| *token)
                    .collect()
            };
            for token in tokens {
                send_topology(reactor, &mesh, token);
            }
            arm_gossip(reactor, Rc::clone(&mesh));
        }),
    );
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::evs::messages::{EvsMessage, GapMessage};
    use crate::types::view::ViewId;

    fn test_config(seeds: Vec<String>) -> GmcastConfig {
        GmcastConfig {
            group: "gmcast-test".to_string(),
            listen_addr: "127.0.0.1:0".to_string(),
            seeds,
            keepalive_period: Duration::from_millis(100),
            peer_timeout: Duration::from_secs(5),
            gossip_period: Duration::from_millis(200),
        }
    }

    fn wait_for(
        gmcast: &mut Gmcast,
        timeout: Duration,
        accept: impl Fn(&NetworkEvent) -> bool,
    ) -> Option<NetworkEvent> {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if let Some(event) = gmcast.recv() {
                if accept(&event) {
                    return Some(event);
                }
                continue;
            }
            thread::sleep(Duration::from_millis(5));
        }
        None
    }

    #[test]
    fn two_member_mesh_connects_and_exchanges_user_payloads() {
        let member_a = MemberId::generate();
        let member_b = MemberId::generate();

        let mut mesh_a = Gmcast::open(member_a, test_config(Vec::new())).unwrap();
        let seed = mesh_a.local_addr().to_string();
        let mut mesh_b = Gmcast::open(member_b, test_config(vec![seed])).unwrap();

        assert!(
            wait_for(&mut mesh_a, Duration::from_secs(10), |event| matches!(
                event,
                NetworkEvent::PeerLive(peer) if *peer == member_b
            ))
            .is_some(),
            "a sees b live"
        );
        assert!(
            wait_for(&mut mesh_b, Duration::from_secs(10), |event| matches!(
                event,
                NetworkEvent::PeerLive(peer) if *peer == member_a
            ))
            .is_some(),
            "b sees a live"
        );

        let probe = EvsMessage::Gap(GapMessage {
            view_id: ViewId::new(member_b, 1),
            clock: 7,
            aru: 3,
        });
        mesh_b.broadcast(WireMessage::Evs(probe));

        let received = wait_for(&mut mesh_a, Duration::from_secs(10), |event| {
            matches!(event, NetworkEvent::Message(from, _) if *from == member_b)
        });
        match received {
            Some(NetworkEvent::Message(_, WireMessage::Evs(EvsMessage::Gap(gap)))) => {
                assert_eq!(gap.clock, 7);
                assert_eq!(gap.aru, 3);
            }
            other => panic!("expected the gap message, got {:?}", other),
        }

        mesh_a.close();
        mesh_b.close();
    }

    #[test]
    fn wrong_group_name_is_refused() {
        let member_a = MemberId::generate();
        let member_b = MemberId::generate();

        let mut mesh_a = Gmcast::open(member_a, test_config(Vec::new())).unwrap();
        let seed = mesh_a.local_addr().to_string();
        let mut other_group = test_config(vec![seed]);
        other_group.group = "some-other-cluster".to_string();
        let mut mesh_b = Gmcast::open(member_b, other_group).unwrap();

        // The handshake is refused: no liveness within a generous window.
        assert!(
            wait_for(&mut mesh_a, Duration::from_millis(1500), |event| matches!(
                event,
                NetworkEvent::PeerLive(_)
            ))
            .is_none(),
            "mismatched groups never become live"
        );

        mesh_a.close();
        mesh_b.close();
    }
}
