//! A "mock" (totally local) network for passing replication messages between nodes in
//! one process, with controllable connectivity so tests can split and heal the
//! cluster.

use std::collections::{HashMap, HashSet};
use std::sync::mpsc::{self, Receiver, Sender, TryRecvError};
use std::sync::{Arc, Mutex};

use tandem::network::{Network, NetworkEvent, WireMessage};
use tandem::MemberId;

struct HubInner {
    inboxes: HashMap<MemberId, Sender<NetworkEvent>>,
    /// Ordered pairs currently able to exchange messages.
    connected: HashSet<(MemberId, MemberId)>,
}

/// The shared medium all [`NetworkStub`]s of one test cluster send through.
#[derive(Clone)]
pub(crate) struct Hub {
    inner: Arc<Mutex<HubInner>>,
}

impl Hub {
    pub(crate) fn new() -> Hub {
        Hub {
            inner: Arc::new(Mutex::new(HubInner {
                inboxes: HashMap::new(),
                connected: HashSet::new(),
            })),
        }
    }

    /// Register a member and return its stub. Call [`connect_full`](Self::connect_full)
    /// once all members are registered.
    pub(crate) fn register(&self, member: MemberId) -> NetworkStub {
        let (sender, receiver) = mpsc::channel();
        self.inner
            .lock()
            .unwrap()
            .inboxes
            .insert(member, sender);
        NetworkStub {
            me: member,
            hub: self.clone(),
            inbox: Arc::new(Mutex::new(receiver)),
        }
    }

    /// Make every registered pair mutually reachable and announce liveness.
    pub(crate) fn connect_full(&self) {
        let mut inner = self.inner.lock().unwrap();
        let members: Vec<MemberId> = inner.inboxes.keys().copied().collect();
        for a in &members {
            for b in &members {
                if a != b {
                    inner.connected.insert((*a, *b));
                }
            }
        }
        for a in &members {
            for b in &members {
                if a != b {
                    if let Some(inbox) = inner.inboxes.get(a) {
                        let _ = inbox.send(NetworkEvent::PeerLive(*b));
                    }
                }
            }
        }
    }

    /// Sever connectivity between the two groups and report the peers dead to each
    /// other.
    pub(crate) fn partition(&self, left: &[MemberId], right: &[MemberId]) {
        let mut inner = self.inner.lock().unwrap();
        for a in left {
            for b in right {
                inner.connected.remove(&(*a, *b));
                inner.connected.remove(&(*b, *a));
            }
        }
        for a in left {
            for b in right {
                if let Some(inbox) = inner.inboxes.get(a) {
                    let _ = inbox.send(NetworkEvent::PeerDead(*b));
                }
                if let Some(inbox) = inner.inboxes.get(b) {
                    let _ = inbox.send(NetworkEvent::PeerDead(*a));
                }
            }
        }
    }

    /// Restore connectivity between the two groups and announce the peers live again.
    pub(crate) fn heal(&self, left: &[MemberId], right: &[MemberId]) {
        let mut inner = self.inner.lock().unwrap();
        for a in left {
            for b in right {
                inner.connected.insert((*a, *b));
                inner.connected.insert((*b, *a));
            }
        }
        for a in left {
            for b in right {
                if let Some(inbox) = inner.inboxes.get(a) {
                    let _ = inbox.send(NetworkEvent::PeerLive(*b));
                }
                if let Some(inbox) = inner.inboxes.get(b) {
                    let _ = inbox.send(NetworkEvent::PeerLive(*a));
                }
            }
        }
    }

    fn deliver(&self, from: MemberId, to: MemberId, message: WireMessage) {
        let inner = self.inner.lock().unwrap();
        if !inner.connected.contains(&(from, to)) {
            return;
        }
        if let Some(inbox) = inner.inboxes.get(&to) {
            let _ = inbox.send(NetworkEvent::Message(from, message));
        }
    }

    fn targets_of(&self, from: MemberId) -> Vec<MemberId> {
        let inner = self.inner.lock().unwrap();
        inner
            .inboxes
            .keys()
            .filter(|to| **to != from && inner.connected.contains(&(from, **to)))
            .copied()
            .collect()
    }

    fn remove(&self, member: MemberId) {
        let mut inner = self.inner.lock().unwrap();
        inner.inboxes.remove(&member);
        let members: Vec<MemberId> = inner.inboxes.keys().copied().collect();
        inner
            .connected
            .retain(|(a, b)| *a != member && *b != member);
        for other in members {
            if let Some(inbox) = inner.inboxes.get(&other) {
                let _ = inbox.send(NetworkEvent::PeerDead(member));
            }
        }
    }
}

/// One member's handle onto the [`Hub`].
#[derive(Clone)]
pub(crate) struct NetworkStub {
    me: MemberId,
    hub: Hub,
    inbox: Arc<Mutex<Receiver<NetworkEvent>>>,
}

impl Network for NetworkStub {
    fn broadcast(&mut self, message: WireMessage) {
        for target in self.hub.targets_of(self.me) {
            self.hub.deliver(self.me, target, message.clone());
        }
    }

    fn send(&mut self, peer: MemberId, message: WireMessage) {
        self.hub.deliver(self.me, peer, message);
    }

    fn recv(&mut self) -> Option<NetworkEvent> {
        match self.inbox.lock().unwrap().try_recv() {
            Ok(event) => Some(event),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => None,
        }
    }

    fn close(&mut self) {
        self.hub.remove(self.me);
    }
}
