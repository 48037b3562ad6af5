/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! A single-threaded cooperative I/O reactor: non-blocking sockets, acceptors, and steady
//! timers, driven by repeated calls to [`Reactor::run_one`].
//!
//! The reactor makes progress by attempting every pending operation against its
//! non-blocking sources and dispatching at most one completion handler per `run_one`
//! call. When nothing is ready it parks on a condition variable until the next timer
//! deadline, a short poll tick, or an [`interrupt`](ReactorInterrupter::interrupt) from
//! another thread. Handlers receive `&mut Reactor` so they can issue follow-up
//! operations; sources are addressed by [`Token`].
//!
//! Each connected socket carries a [stream engine](stream_engine::StreamEngine) that
//! layers a handshake/encode/decode state machine over the raw file descriptor. The
//! default engine is the identity; TLS is a non-default engine slotting into the same
//! contract.

pub mod socket;

pub mod stream_engine;

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use self::socket::{AcceptorState, DatagramState, SocketState};
use self::stream_engine::IoErrorCode;

/// Identifies a registered source (socket, acceptor, or timer) within its reactor.
pub type Token = usize;

/// A completion handler. Receives the reactor so it can issue follow-up operations.
pub type Handler = Box<dyn FnOnce(&mut Reactor, Completion)>;

/// Granularity of the idle wait when operations are pending but nothing is ready yet.
const POLL_TICK: Duration = Duration::from_millis(1);

enum Source {
    Socket(SocketState),
    Acceptor(AcceptorState),
    Datagram(DatagramState),
}

struct Timer {
    deadline: Instant,
    handler: Handler,
}

/// Shared wake-up state, used by [`ReactorInterrupter`] to break a parked `run_one`.
struct WakeState {
    interrupted: Mutex<bool>,
    cond: Condvar,
}

/// A `Send + Clone` handle that wakes the reactor thread out of an idle wait.
#[derive(Clone)]
pub struct ReactorInterrupter {
    wake: Arc<WakeState>,
}

impl ReactorInterrupter {
    pub fn interrupt(&self) {
        let mut interrupted = self
            .wake
            .interrupted
            .lock()
            .expect("reactor wake lock poisoned");
        *interrupted = true;
        self.wake.cond.notify_all();
    }
}

pub struct Reactor {
    sources: HashMap<Token, Source>,
    timers: HashMap<Token, Timer>,
    next_token: Token,
    wake: Arc<WakeState>,
}

impl Reactor {
    pub fn new() -> Reactor {
        Reactor {
            sources: HashMap::new(),
            timers: HashMap::new(),
            next_token: 1,
            wake: Arc::new(WakeState {
                interrupted: Mutex::new(false),
                cond: Condvar::new(),
            }),
        }
    }

    pub fn interrupter(&self) -> ReactorInterrupter {
        ReactorInterrupter {
            wake: Arc::clone(&self.wake),
        }
    }

    pub(crate) fn allocate_token(&mut self) -> Token {
        let token = self.next_token;
        self.next_token += 1;
        token
    }

    pub(crate) fn insert_socket(&mut self, token: Token, state: SocketState) {
        self.sources.insert(token, Source::Socket(state));
    }

    pub(crate) fn insert_acceptor(&mut self, token: Token, state: AcceptorState) {
        self.sources.insert(token, Source::Acceptor(state));
    }

    pub(crate) fn socket_mut(&mut self, token: Token) -> Option<&mut SocketState> {
        match self.sources.get_mut(&token) {
            Some(Source::Socket(state)) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn acceptor_mut(&mut self, token: Token) -> Option<&mut AcceptorState> {
        match self.sources.get_mut(&token) {
            Some(Source::Acceptor(state)) => Some(state),
            _ => None,
        }
    }

    pub(crate) fn insert_datagram(&mut self, token: Token, state: DatagramState) {
        self.sources.insert(token, Source::Datagram(state));
    }

    pub(crate) fn datagram_mut(&mut self, token: Token) -> Option<&mut DatagramState> {
        match self.sources.get_mut(&token) {
            Some(Source::Datagram(state)) => Some(state),
            _ => None,
        }
    }

    /// Remove a source. For a socket this shuts the stream down, which surfaces as an
    /// eof at the peer's next completion.
    pub fn close(&mut self, token: Token) {
        if let Some(Source::Socket(state)) = self.sources.remove(&token) {
            state.shutdown();
        }
    }

    /// Arm a steady timer. The handler fires once, `period` from now.
    pub fn steady_timer(&mut self, period: Duration, handler: Handler) -> Token {
        let token = self.allocate_token();
        self.timers.insert(
            token,
            Timer {
                deadline: Instant::now() + period,
                handler,
            },
        );
        token
    }

    /// Disarm a timer before it fires.
    pub fn cancel_timer(&mut self, token: Token) {
        self.timers.remove(&token);
    }

    /// Run the reactor until a single completion handler has been dispatched, the
    /// timeout elapses, or [`ReactorInterrupter::interrupt`] is called. Returns whether
    /// a handler was dispatched.
    pub fn run_one(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;

        loop {
            if let Some((handler, completion)) = self.poll_sources() {
                handler(self, completion);
                return true;
            }

            if let Some((handler, _token)) = self.pop_due_timer() {
                handler(self, Completion::Timer);
                return true;
            }

            let now = Instant::now();
            if now >= deadline {
                return false;
            }

            // Nothing ready: park until the earliest of the caller deadline, the next
            // timer deadline, or one poll tick (pending socket ops are re-tried then).
            let mut wait = deadline - now;
            if let Some(next_timer) = self.next_timer_deadline() {
                wait = wait.min(next_timer.saturating_duration_since(now));
            }
            if self.has_pending_io() {
                wait = wait.min(POLL_TICK);
            }

            let interrupted = {
                let guard = self
                    .wake
                    .interrupted
                    .lock()
                    .expect("reactor wake lock poisoned");
                let (mut guard, _timeout) = self
                    .wake
                    .cond
                    .wait_timeout(guard, wait)
                    .expect("reactor wake lock poisoned");
                std::mem::replace(&mut *guard, false)
            };
            if interrupted {
                return false;
            }
        }
    }

    fn poll_sources(&mut self) -> Option<(Handler, Completion)> {
        enum Polled {
            Socket(Handler, Completion),
            Accepted(
                Handler,
                Result<(SocketState, std::net::SocketAddr), IoErrorCode>,
            ),
        }

        let tokens: Vec<Token> = self.sources.keys().copied().collect();
        for token in tokens {
            let polled = match self.sources.get_mut(&token) {
                Some(Source::Socket(state)) => {
                    state.poll().map(|(handler, c)| Polled::Socket(handler, c))
                }
                Some(Source::Acceptor(state)) => state
                    .poll()
                    .map(|(handler, outcome)| Polled::Accepted(handler, outcome)),
                Some(Source::Datagram(state)) => {
                    state.poll().map(|(handler, c)| Polled::Socket(handler, c))
                }
                None => None,
            };
            match polled {
                Some(Polled::Socket(handler, completion)) => return Some((handler, completion)),
                Some(Polled::Accepted(handler, Ok((state, peer)))) => {
                    let new_token = self.allocate_token();
                    self.insert_socket(new_token, state);
                    return Some((handler, Completion::Accept(Ok((new_token, peer)))));
                }
                Some(Polled::Accepted(handler, Err(code))) => {
                    return Some((handler, Completion::Accept(Err(code))));
                }
                None => (),
            }
        }
        None
    }

    fn pop_due_timer(&mut self) -> Option<(Handler, Token)> {
        let now = Instant::now();
        let due = self
            .timers
            .iter()
            .filter(|(_, timer)| timer.deadline <= now)
            .min_by_key(|(_, timer)| timer.deadline)
            .map(|(token, _)| *token)?;
        let timer = self.timers.remove(&due)?;
        Some((timer.handler, due))
    }

    fn next_timer_deadline(&self) -> Option<Instant> {
        self.timers.values().map(|timer| timer.deadline).min()
    }

    fn has_pending_io(&self) -> bool {
        self.sources.values().any(|source| match source {
            Source::Socket(state) => state.has_pending_op(),
            Source::Acceptor(state) => state.has_pending_op(),
            Source::Datagram(state) => state.has_pending_op(),
        })
    }
}

impl Default for Reactor {
    fn default() -> Self {
        Self::new()
    }
}

pub use socket::{read_exactly, Acceptor, Completion, ReadCondition, Socket};
pub use stream_engine::{
    identity_engine_factory, EngineFactory, EngineStatus, IdentityEngine, IoErrorCode as ErrorCode,
    IoErrorKind, RawStream, StreamEngine,
};

/// Convenience alias for results carrying the reactor's error-code type.
pub type IoResult<T> = Result<T, IoErrorCode>;

#[cfg(test)]
mod tests {
    use std::cell::{Cell, RefCell};
    use std::io::Read;
    use std::rc::Rc;
    use std::time::Duration;

    use super::socket::read_exactly;
    use super::stream_engine::{
        EngineStatus, IdentityEngine, IoErrorCode, RawStream, StreamEngine,
    };
    use super::{Completion, Reactor, Token};

    fn run_until(reactor: &mut Reactor, done: &dyn Fn() -> bool) {
        for _ in 0..10_000 {
            if done() {
                return;
            }
            reactor.run_one(Duration::from_millis(10));
        }
        panic!("reactor did not reach the expected state");
    }

    /// Connect a client socket to a freshly accepted server socket within one reactor.
    fn connected_pair(reactor: &mut Reactor) -> (Token, Token) {
        let listener = reactor
            .listen("127.0.0.1:0", super::identity_engine_factory())
            .unwrap();
        let addr = reactor.local_addr(listener).unwrap();

        let accepted: Rc<Cell<Option<Token>>> = Rc::new(Cell::new(None));
        let accepted_in_handler = Rc::clone(&accepted);
        reactor
            .async_accept(
                listener,
                Box::new(move |_, completion| {
                    if let Completion::Accept(Ok((token, _peer))) = completion {
                        accepted_in_handler.set(Some(token));
                    }
                }),
            )
            .unwrap();

        let connected: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let connected_in_handler = Rc::clone(&connected);
        let client = reactor.async_connect(
            addr,
            Box::new(IdentityEngine::new()),
            Box::new(move |_, completion| {
                if let Completion::Connect(Ok(())) = completion {
                    connected_in_handler.set(true);
                }
            }),
        );

        run_until(reactor, &|| connected.get() && accepted.get().is_some());
        (client, accepted.get().unwrap())
    }

    #[test]
    fn second_write_in_flight_is_busy() {
        let mut reactor = Reactor::new();
        let (client, server) = connected_pair(&mut reactor);

        let written: Rc<Cell<Option<usize>>> = Rc::new(Cell::new(None));
        let written_in_handler = Rc::clone(&written);
        let payload = vec![7u8; 64 * 1024];
        reactor
            .async_write(
                client,
                payload.clone(),
                Box::new(move |_, completion| {
                    if let Completion::Write(Ok(n)) = completion {
                        written_in_handler.set(Some(n));
                    }
                }),
            )
            .unwrap();

        // A second write while one is outstanding: busy, and the in-flight buffer is
        // not corrupted.
        let err = reactor
            .async_write(client, vec![0u8; 8], Box::new(|_, _| ()))
            .unwrap_err();
        assert!(err.is_busy());

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in_handler = Rc::clone(&received);
        reactor
            .async_read(
                server,
                read_exactly(payload.len()),
                Box::new(move |_, completion| {
                    if let Completion::Read(Ok(bytes)) = completion {
                        *received_in_handler.borrow_mut() = bytes;
                    }
                }),
            )
            .unwrap();

        run_until(&mut reactor, &|| written.get() == Some(payload.len()));
        run_until(&mut reactor, &|| !received.borrow().is_empty());
        assert_eq!(*received.borrow(), payload);
    }

    #[test]
    fn read_completion_condition_collects_across_writes() {
        let mut reactor = Reactor::new();
        let (client, server) = connected_pair(&mut reactor);

        let received: Rc<RefCell<Vec<u8>>> = Rc::new(RefCell::new(Vec::new()));
        let received_in_handler = Rc::clone(&received);
        reactor
            .async_read(
                server,
                read_exactly(10),
                Box::new(move |_, completion| {
                    if let Completion::Read(Ok(bytes)) = completion {
                        *received_in_handler.borrow_mut() = bytes;
                    }
                }),
            )
            .unwrap();

        let first_done: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let first_done_in_handler = Rc::clone(&first_done);
        reactor
            .async_write(
                client,
                b"01234".to_vec(),
                Box::new(move |_, _| first_done_in_handler.set(true)),
            )
            .unwrap();
        run_until(&mut reactor, &|| first_done.get());
        reactor
            .async_write(client, b"56789".to_vec(), Box::new(|_, _| ()))
            .unwrap();

        run_until(&mut reactor, &|| received.borrow().len() == 10);
        assert_eq!(&*received.borrow(), b"0123456789");
    }

    #[test]
    fn close_surfaces_as_eof_at_peer() {
        let mut reactor = Reactor::new();
        let (client, server) = connected_pair(&mut reactor);

        let outcome: Rc<Cell<Option<bool>>> = Rc::new(Cell::new(None));
        let outcome_in_handler = Rc::clone(&outcome);
        reactor
            .async_read(
                server,
                read_exactly(1),
                Box::new(move |_, completion| {
                    if let Completion::Read(Err(code)) = completion {
                        outcome_in_handler.set(Some(code.is_eof()));
                    }
                }),
            )
            .unwrap();

        reactor.close(client);
        run_until(&mut reactor, &|| outcome.get().is_some());
        assert_eq!(outcome.get(), Some(true));
    }

    /// A client engine whose handshake first asks for more input, then completes once
    /// the peer has written a byte. (`Arc` because stream engines must be `Send`.)
    struct WantReadHandshakeEngine {
        inner: IdentityEngine,
        handshake_calls: std::sync::Arc<std::sync::atomic::AtomicU32>,
        done: bool,
    }

    impl StreamEngine for WantReadHandshakeEngine {
        fn client_handshake(&mut self, io: &mut dyn RawStream) -> EngineStatus {
            self.handshake_calls
                .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            if self.done {
                return EngineStatus::Success;
            }
            let mut byte = [0u8; 1];
            match io.read(&mut byte) {
                Ok(1) => {
                    self.done = true;
                    EngineStatus::Success
                }
                Ok(_) => EngineStatus::Eof,
                Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                    EngineStatus::WantRead
                }
                Err(_) => EngineStatus::Error,
            }
        }

        fn server_handshake(&mut self, _io: &mut dyn RawStream) -> EngineStatus {
            EngineStatus::Success
        }

        fn read(&mut self, io: &mut dyn RawStream, buf: &mut [u8]) -> (EngineStatus, usize) {
            self.inner.read(io, buf)
        }

        fn write(&mut self, io: &mut dyn RawStream, buf: &[u8]) -> (EngineStatus, usize) {
            self.inner.write(io, buf)
        }

        fn last_error(&self) -> IoErrorCode {
            self.inner.last_error()
        }
    }

    #[test]
    fn handshake_want_read_completes_after_peer_writes() {
        let mut reactor = Reactor::new();
        let listener = reactor
            .listen("127.0.0.1:0", super::identity_engine_factory())
            .unwrap();
        let addr = reactor.local_addr(listener).unwrap();

        let accepted: Rc<Cell<Option<Token>>> = Rc::new(Cell::new(None));
        let accepted_in_handler = Rc::clone(&accepted);
        reactor
            .async_accept(
                listener,
                Box::new(move |reactor, completion| {
                    if let Completion::Accept(Ok((token, _))) = completion {
                        // The server side of the handshake: write the byte the client
                        // engine is waiting for.
                        accepted_in_handler.set(Some(token));
                        reactor
                            .async_write(token, vec![0xA5], Box::new(|_, _| ()))
                            .unwrap();
                    }
                }),
            )
            .unwrap();

        let handshake_calls = std::sync::Arc::new(std::sync::atomic::AtomicU32::new(0));
        let connect_fired: Rc<Cell<u32>> = Rc::new(Cell::new(0));
        let connect_err: Rc<Cell<bool>> = Rc::new(Cell::new(false));
        let engine = WantReadHandshakeEngine {
            inner: IdentityEngine::new(),
            handshake_calls: std::sync::Arc::clone(&handshake_calls),
            done: false,
        };
        let connect_fired_in_handler = Rc::clone(&connect_fired);
        let connect_err_in_handler = Rc::clone(&connect_err);
        reactor.async_connect(
            addr,
            Box::new(engine),
            Box::new(move |_, completion| {
                connect_fired_in_handler.set(connect_fired_in_handler.get() + 1);
                if let Completion::Connect(Err(_)) = completion {
                    connect_err_in_handler.set(true);
                }
            }),
        );

        run_until(&mut reactor, &|| connect_fired.get() > 0);
        // The handshake was re-invoked after WantRead, and the connect handler fired
        // exactly once, without error.
        assert!(handshake_calls.load(std::sync::atomic::Ordering::SeqCst) >= 2);
        assert_eq!(connect_fired.get(), 1);
        assert!(!connect_err.get());
    }

    #[test]
    fn steady_timer_fires_and_cancel_suppresses() {
        let mut reactor = Reactor::new();
        let fired: Rc<Cell<u32>> = Rc::new(Cell::new(0));

        let fired_in_handler = Rc::clone(&fired);
        reactor.steady_timer(
            Duration::from_millis(5),
            Box::new(move |_, _| fired_in_handler.set(fired_in_handler.get() + 1)),
        );
        let fired_in_cancelled = Rc::clone(&fired);
        let cancelled = reactor.steady_timer(
            Duration::from_millis(5),
            Box::new(move |_, _| fired_in_cancelled.set(fired_in_cancelled.get() + 100)),
        );
        reactor.cancel_timer(cancelled);

        run_until(&mut reactor, &|| fired.get() > 0);
        std::thread::sleep(Duration::from_millis(10));
        reactor.run_one(Duration::from_millis(1));
        assert_eq!(fired.get(), 1);
    }

    #[test]
    fn interrupt_wakes_idle_run_one() {
        let mut reactor = Reactor::new();
        let interrupter = reactor.interrupter();
        let waker = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            interrupter.interrupt();
        });
        let started = std::time::Instant::now();
        let dispatched = reactor.run_one(Duration::from_secs(30));
        assert!(!dispatched);
        assert!(started.elapsed() < Duration::from_secs(5));
        waker.join().unwrap();
    }

    // Keep the unused import warning away on platforms where Read is only used by the
    // scripted engine.
    #[allow(dead_code)]
    fn _uses_read(r: &mut dyn Read) {
        let _ = r;
    }
}
