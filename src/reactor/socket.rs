/*
    Copyright © 2023, ParallelChain Lab
    Licensed under the Apache License, Version 2.0: http://www.apache.org/licenses/LICENSE-2.0
*/

//! Sockets and acceptors registered with the [`Reactor`].
//!
//! Connection establishment is offloaded to a short-lived connector thread (a
//! non-blocking `connect(2)` is not reachable through the standard library); everything
//! after the TCP handshake — stream-engine handshake, reads, writes, close — is driven
//! cooperatively by the reactor thread itself.
//!
//! Operation rules:
//! - One read and one write may be in flight per socket. Starting a second write while
//!   one is outstanding fails immediately with a [busy](IoErrorCode::busy) error and
//!   does not disturb the in-flight buffer.
//! - `async_read` takes a completion condition: a function from the bytes collected so
//!   far to the number of further bytes wanted. The handler fires when it returns 0.
//! - Closing a socket shuts the stream down; the peer observes an eof at its next
//!   completion.

use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, ToSocketAddrs};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use super::stream_engine::{EngineFactory, EngineStatus, IoErrorCode, StreamEngine};
use super::{Handler, Reactor, Token};

/// What a completion handler is invoked with.
pub enum Completion {
    /// Outcome of `async_connect`: fires once the transport and stream-engine handshakes
    /// have both completed.
    Connect(Result<(), IoErrorCode>),
    /// Outcome of `async_read`: the collected bytes.
    Read(Result<Vec<u8>, IoErrorCode>),
    /// Outcome of `async_write`: the number of bytes written.
    Write(Result<usize, IoErrorCode>),
    /// Outcome of `async_accept`: the token of the accepted, registered socket and the
    /// peer address.
    Accept(Result<(Token, SocketAddr), IoErrorCode>),
    /// Outcome of `async_recv_from` on a datagram socket.
    Datagram(Result<(Vec<u8>, SocketAddr), IoErrorCode>),
    /// A steady timer fired.
    Timer,
}

/// Completion condition for `async_read`: given the bytes collected so far, returns how
/// many further bytes are wanted. The read completes when it returns 0.
pub type ReadCondition = Box<dyn FnMut(&[u8]) -> usize + Send>;

/// A completion condition that collects exactly `n` bytes.
pub fn read_exactly(n: usize) -> ReadCondition {
    Box::new(move |collected: &[u8]| n.saturating_sub(collected.len()))
}

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

type ConnectSlot = Arc<Mutex<Option<io::Result<TcpStream>>>>;

enum Conn {
    /// Waiting for the connector thread to deposit its result.
    Pending(ConnectSlot),
    Established(TcpStream),
    Closed,
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connecting,
    ClientHandshake,
    ServerHandshake,
    Ready,
    Failed,
}

struct ReadOp {
    collected: Vec<u8>,
    condition: ReadCondition,
    handler: Handler,
}

struct WriteOp {
    data: Vec<u8>,
    written: usize,
    handler: Handler,
}

pub(crate) struct SocketState {
    conn: Conn,
    engine: Box<dyn StreamEngine>,
    phase: Phase,
    failed_code: Option<IoErrorCode>,
    connect_handler: Option<Handler>,
    read_op: Option<ReadOp>,
    write_op: Option<WriteOp>,
}

impl SocketState {
    fn connecting(slot: ConnectSlot, engine: Box<dyn StreamEngine>, handler: Handler) -> Self {
        SocketState {
            conn: Conn::Pending(slot),
            engine,
            phase: Phase::Connecting,
            failed_code: None,
            connect_handler: Some(handler),
            read_op: None,
            write_op: None,
        }
    }

    pub(crate) fn accepted(stream: TcpStream, engine: Box<dyn StreamEngine>) -> Self {
        SocketState {
            conn: Conn::Established(stream),
            engine,
            phase: Phase::ServerHandshake,
            failed_code: None,
            connect_handler: None,
            read_op: None,
            write_op: None,
        }
    }

    pub(crate) fn has_pending_op(&self) -> bool {
        self.phase != Phase::Failed
            && (self.connect_handler.is_some() || self.read_op.is_some() || self.write_op.is_some())
    }

    pub(crate) fn shutdown(&self) {
        if let Conn::Established(stream) = &self.conn {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
    }

    /// Attempt progress; return at most one ripe completion.
    pub(crate) fn poll(&mut self) -> Option<(Handler, Completion)> {
        match self.phase {
            Phase::Connecting => self.poll_connecting(),
            Phase::ClientHandshake | Phase::ServerHandshake => self.poll_handshake(),
            Phase::Ready => self.poll_ready(),
            Phase::Failed => self.fail_next_op(),
        }
    }

    fn poll_connecting(&mut self) -> Option<(Handler, Completion)> {
        let result = match &self.conn {
            Conn::Pending(slot) => slot.lock().expect("connect slot poisoned").take()?,
            _ => return None,
        };
        match result {
            Ok(stream) => {
                if let Err(err) = stream.set_nonblocking(true) {
                    return self.fail_connect(IoErrorCode::from_io(&err));
                }
                self.conn = Conn::Established(stream);
                self.phase = Phase::ClientHandshake;
                // Run the first handshake step immediately.
                self.poll_handshake()
            }
            Err(err) => self.fail_connect(IoErrorCode::from_io(&err)),
        }
    }

    fn fail_connect(&mut self, code: IoErrorCode) -> Option<(Handler, Completion)> {
        self.phase = Phase::Failed;
        self.connect_handler
            .take()
            .map(|handler| (handler, Completion::Connect(Err(code))))
    }

    fn poll_handshake(&mut self) -> Option<(Handler, Completion)> {
        let client = self.phase == Phase::ClientHandshake;
        let stream = match &mut self.conn {
            Conn::Established(stream) => stream,
            _ => return None,
        };
        let status = if client {
            self.engine.client_handshake(stream)
        } else {
            self.engine.server_handshake(stream)
        };
        match status {
            EngineStatus::Success => {
                self.phase = Phase::Ready;
                match self.connect_handler.take() {
                    Some(handler) => Some((handler, Completion::Connect(Ok(())))),
                    // Server side: no connect handler; queued reads/writes may now
                    // progress on the next poll.
                    None => self.poll_ready(),
                }
            }
            EngineStatus::WantRead | EngineStatus::WantWrite => None,
            EngineStatus::Eof => self.fail_all(IoErrorCode::eof()),
            EngineStatus::Error => self.fail_all(self.engine.last_error()),
        }
    }

    fn poll_ready(&mut self) -> Option<(Handler, Completion)> {
        if let Some(completion) = self.poll_read() {
            return Some(completion);
        }
        self.poll_write()
    }

    fn poll_read(&mut self) -> Option<(Handler, Completion)> {
        let op = self.read_op.as_mut()?;
        loop {
            let wanted = (op.condition)(&op.collected);
            if wanted == 0 {
                let op = self.read_op.take().expect("read op present");
                return Some((op.handler, Completion::Read(Ok(op.collected))));
            }
            let stream = match &mut self.conn {
                Conn::Established(stream) => stream,
                _ => return self.fail_all(IoErrorCode::not_connected()),
            };
            let mut chunk = vec![0u8; wanted];
            let (status, n) = self.engine.read(stream, &mut chunk);
            match status {
                EngineStatus::Success if n > 0 => {
                    op.collected.extend_from_slice(&chunk[..n]);
                }
                EngineStatus::Success | EngineStatus::WantRead | EngineStatus::WantWrite => {
                    return None
                }
                EngineStatus::Eof => {
                    let op = self.read_op.take().expect("read op present");
                    self.phase = Phase::Failed;
                    return Some((op.handler, Completion::Read(Err(IoErrorCode::eof()))));
                }
                EngineStatus::Error => {
                    let code = self.engine.last_error();
                    let op = self.read_op.take().expect("read op present");
                    self.phase = Phase::Failed;
                    return Some((op.handler, Completion::Read(Err(code))));
                }
            }
        }
    }

    fn poll_write(&mut self) -> Option<(Handler, Completion)> {
        let op = self.write_op.as_mut()?;
        loop {
            if op.written == op.data.len() {
                let op = self.write_op.take().expect("write op present");
                return Some((op.handler, Completion::Write(Ok(op.written))));
            }
            let stream = match &mut self.conn {
                Conn::Established(stream) => stream,
                _ => return self.fail_all(IoErrorCode::not_connected()),
            };
            let (status, n) = self.engine.write(stream, &op.data[op.written..]);
            match status {
                EngineStatus::Success if n > 0 => op.written += n,
                EngineStatus::Success | EngineStatus::WantRead | EngineStatus::WantWrite => {
                    return None
                }
                EngineStatus::Eof => {
                    let op = self.write_op.take().expect("write op present");
                    self.phase = Phase::Failed;
                    return Some((op.handler, Completion::Write(Err(IoErrorCode::eof()))));
                }
                EngineStatus::Error => {
                    let code = self.engine.last_error();
                    let op = self.write_op.take().expect("write op present");
                    self.phase = Phase::Failed;
                    return Some((op.handler, Completion::Write(Err(code))));
                }
            }
        }
    }

    /// Fail every outstanding operation, one completion per poll.
    fn fail_all(&mut self, code: IoErrorCode) -> Option<(Handler, Completion)> {
        self.phase = Phase::Failed;
        self.failed_code = Some(code);
        self.fail_next_op()
    }

    fn fail_next_op(&mut self) -> Option<(Handler, Completion)> {
        let code = self.failed_code.unwrap_or_else(IoErrorCode::not_connected);
        if let Some(handler) = self.connect_handler.take() {
            return Some((handler, Completion::Connect(Err(code))));
        }
        if let Some(op) = self.read_op.take() {
            return Some((op.handler, Completion::Read(Err(code))));
        }
        if let Some(op) = self.write_op.take() {
            return Some((op.handler, Completion::Write(Err(code))));
        }
        None
    }
}

pub(crate) struct DatagramState {
    socket: std::net::UdpSocket,
    recv_handler: Option<Handler>,
}

impl DatagramState {
    pub(crate) fn has_pending_op(&self) -> bool {
        self.recv_handler.is_some()
    }

    pub(crate) fn poll(&mut self) -> Option<(Handler, Completion)> {
        self.recv_handler.as_ref()?;
        let mut buffer = vec![0u8; 64 * 1024];
        match self.socket.recv_from(&mut buffer) {
            Ok((n, peer)) => {
                buffer.truncate(n);
                let handler = self.recv_handler.take().expect("recv handler present");
                Some((handler, Completion::Datagram(Ok((buffer, peer)))))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                let handler = self.recv_handler.take().expect("recv handler present");
                Some((handler, Completion::Datagram(Err(IoErrorCode::from_io(&err)))))
            }
        }
    }
}

pub(crate) struct AcceptorState {
    listener: TcpListener,
    engine_factory: EngineFactory,
    accept_handler: Option<Handler>,
}

impl AcceptorState {
    pub(crate) fn has_pending_op(&self) -> bool {
        self.accept_handler.is_some()
    }

    /// Attempt one accept. On success hands back the new socket's state for
    /// registration.
    pub(crate) fn poll(
        &mut self,
    ) -> Option<(Handler, Result<(SocketState, SocketAddr), IoErrorCode>)> {
        self.accept_handler.as_ref()?;
        match self.listener.accept() {
            Ok((stream, peer)) => {
                let handler = self.accept_handler.take().expect("accept handler present");
                if let Err(err) = stream.set_nonblocking(true) {
                    return Some((handler, Err(IoErrorCode::from_io(&err))));
                }
                let state = SocketState::accepted(stream, (self.engine_factory)());
                Some((handler, Ok((state, peer))))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => None,
            Err(err) => {
                let handler = self.accept_handler.take().expect("accept handler present");
                Some((handler, Err(IoErrorCode::from_io(&err))))
            }
        }
    }
}

impl Reactor {
    /// Start a connection to `addr`, with `engine` layered over the socket. The handler
    /// fires once both the transport connection and the engine's client handshake have
    /// completed, or with the error that prevented them.
    pub fn async_connect(
        &mut self,
        addr: impl ToSocketAddrs + Send + 'static,
        engine: Box<dyn StreamEngine>,
        handler: Handler,
    ) -> Token {
        let token = self.allocate_token();
        let slot: ConnectSlot = Arc::new(Mutex::new(None));
        let state = SocketState::connecting(Arc::clone(&slot), engine, handler);
        self.insert_socket(token, state);

        let interrupter = self.interrupter();
        thread::spawn(move || {
            let result = connect_first(addr);
            *slot.lock().expect("connect slot poisoned") = Some(result);
            interrupter.interrupt();
        });
        token
    }

    /// Read from `token` until `condition` is satisfied, then fire `handler` with the
    /// collected bytes.
    pub fn async_read(
        &mut self,
        token: Token,
        condition: ReadCondition,
        handler: Handler,
    ) -> Result<(), IoErrorCode> {
        let socket = self.socket_mut(token).ok_or_else(IoErrorCode::not_connected)?;
        if socket.read_op.is_some() {
            return Err(IoErrorCode::busy());
        }
        socket.read_op = Some(ReadOp {
            collected: Vec::new(),
            condition,
            handler,
        });
        Ok(())
    }

    /// Write all of `data` to `token`, then fire `handler`. A second write while one is
    /// in flight fails with a busy error; the in-flight buffer is untouched.
    pub fn async_write(
        &mut self,
        token: Token,
        data: Vec<u8>,
        handler: Handler,
    ) -> Result<(), IoErrorCode> {
        let socket = self.socket_mut(token).ok_or_else(IoErrorCode::not_connected)?;
        if socket.write_op.is_some() {
            return Err(IoErrorCode::busy());
        }
        socket.write_op = Some(WriteOp {
            data,
            written: 0,
            handler,
        });
        Ok(())
    }

    /// Bind a listener. Accepted sockets get an engine from `engine_factory` and run the
    /// server handshake before any read or write on them completes.
    pub fn listen(
        &mut self,
        addr: impl ToSocketAddrs,
        engine_factory: EngineFactory,
    ) -> Result<Token, IoErrorCode> {
        let listener = TcpListener::bind(addr).map_err(|err| IoErrorCode::from_io(&err))?;
        listener
            .set_nonblocking(true)
            .map_err(|err| IoErrorCode::from_io(&err))?;
        let token = self.allocate_token();
        self.insert_acceptor(
            token,
            AcceptorState {
                listener,
                engine_factory,
                accept_handler: None,
            },
        );
        Ok(token)
    }

    /// The local address a listener is bound to.
    pub fn local_addr(&mut self, token: Token) -> Result<SocketAddr, IoErrorCode> {
        let acceptor = self
            .acceptor_mut(token)
            .ok_or_else(IoErrorCode::not_connected)?;
        acceptor
            .listener
            .local_addr()
            .map_err(|err| IoErrorCode::from_io(&err))
    }

    /// Accept one connection on a listener; the handler fires with the token of the
    /// newly registered socket.
    pub fn async_accept(&mut self, token: Token, handler: Handler) -> Result<(), IoErrorCode> {
        let acceptor = self
            .acceptor_mut(token)
            .ok_or_else(IoErrorCode::not_connected)?;
        if acceptor.accept_handler.is_some() {
            return Err(IoErrorCode::busy());
        }
        acceptor.accept_handler = Some(handler);
        Ok(())
    }

    /// Bind a datagram socket.
    pub fn udp_bind(&mut self, addr: impl ToSocketAddrs) -> Result<Token, IoErrorCode> {
        let socket = std::net::UdpSocket::bind(addr).map_err(|err| IoErrorCode::from_io(&err))?;
        socket
            .set_nonblocking(true)
            .map_err(|err| IoErrorCode::from_io(&err))?;
        let token = self.allocate_token();
        self.insert_datagram(
            token,
            DatagramState {
                socket,
                recv_handler: None,
            },
        );
        Ok(token)
    }

    /// Receive one datagram; the handler fires with its bytes and the sender address.
    pub fn async_recv_from(&mut self, token: Token, handler: Handler) -> Result<(), IoErrorCode> {
        let datagram = self
            .datagram_mut(token)
            .ok_or_else(IoErrorCode::not_connected)?;
        if datagram.recv_handler.is_some() {
            return Err(IoErrorCode::busy());
        }
        datagram.recv_handler = Some(handler);
        Ok(())
    }

    /// Send one datagram. Datagram sends never queue; a full socket buffer drops the
    /// datagram, which is within the unreliable contract.
    pub fn send_to(
        &mut self,
        token: Token,
        data: &[u8],
        addr: SocketAddr,
    ) -> Result<(), IoErrorCode> {
        let datagram = self
            .datagram_mut(token)
            .ok_or_else(IoErrorCode::not_connected)?;
        match datagram.socket.send_to(data, addr) {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(IoErrorCode::from_io(&err)),
        }
    }
}

fn connect_first(addr: impl ToSocketAddrs) -> io::Result<TcpStream> {
    let mut last_err = None;
    let addrs = addr.to_socket_addrs()?;
    for candidate in addrs {
        match TcpStream::connect_timeout(&candidate, CONNECT_TIMEOUT) {
            Ok(stream) => return Ok(stream),
            Err(err) => last_err = Some(err),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, "address resolved to nothing")
    }))
}

/// Thin handle naming a connected socket within a reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Socket(pub Token);

/// Thin handle naming a listener within a reactor.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Acceptor(pub Token);
