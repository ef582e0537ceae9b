//! Connection state machine.
//!
//! A connection is `Idle` while its socket and buffers sit in the handler,
//! `Processing` while a work item owns them, and `Flushing` when a reply
//! could not be written in one go and the event loop is draining it on
//! write readiness. Ownership of the socket and buffers moves into the work
//! item and comes back with its completion, so only one thread ever touches
//! them and a connection never has two work items at once.

use crate::error::CloseReason;
use crate::runtime::buffer::ConnBuffers;
use crate::runtime::protocol::{ProcessResult, Protocol};
use mio::net::TcpStream;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Registered for reads, nothing in flight.
    Idle,
    /// A work item owns the socket and buffers.
    Processing,
    /// Waiting for write readiness to finish sending a reply.
    Flushing,
}

/// Socket plus buffers: everything a work item needs.
#[derive(Debug)]
pub struct Session {
    pub stream: TcpStream,
    pub buffers: ConnBuffers,
}

/// How a work item finished.
#[derive(Debug)]
pub enum Outcome {
    /// Readiness was spurious, nothing to read.
    Idle,
    /// Reply fully written.
    /// `more` is set when the read filled the whole buffer.
    Done { more: bool },
    /// Part of the reply is still in the write buffer.
    Flush,
    /// Connection must be closed.
    Closed(CloseReason),
}

/// What the event loop should do next with a connection.
#[derive(Debug)]
pub enum Next {
    /// Nothing changes.
    Keep,
    /// Wait for read readiness.
    Read,
    /// Wait for write readiness.
    Write,
    /// Wait for reads and start another work item right away.
    Resubmit,
    /// Close the connection.
    Close(CloseReason),
}

/// One read/transform/write cycle for a connection.
#[derive(Debug)]
pub struct WorkItem {
    pub conn_id: usize,
    pub protocol: Protocol,
    pub session: Session,
}

/// A finished work item, handed back to the event loop.
#[derive(Debug)]
pub struct Completion {
    pub conn_id: usize,
    pub session: Session,
    pub outcome: Outcome,
}

impl WorkItem {
    /// Run the cycle. Safe to call on any thread.
    pub fn run(mut self) -> Completion {
        let outcome = self.process();
        Completion {
            conn_id: self.conn_id,
            session: self.session,
            outcome,
        }
    }

    fn process(&mut self) -> Outcome {
        let Session { stream, buffers } = &mut self.session;

        let n = loop {
            match stream.read(buffers.read_space()) {
                Ok(0) => return Outcome::Closed(CloseReason::PeerClosed),
                Ok(n) => break n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Outcome::Idle,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Outcome::Closed(e.into()),
            }
        };
        buffers.advance_read(n);
        let more = buffers.is_read_full();

        let (message, output) = buffers.message_and_output();
        match self.protocol.process(message, output) {
            ProcessResult::Quit => return Outcome::Closed(CloseReason::EndOfSession),
            ProcessResult::Response { response_len } => {
                trace!(conn_id = self.conn_id, received = n, response_len, "Processed message");
            }
        }
        buffers.clear_read();

        match write_pending(stream, buffers) {
            Ok(true) => Outcome::Done { more },
            Ok(false) => Outcome::Flush,
            Err(reason) => Outcome::Closed(reason),
        }
    }
}

/// Write as much of the pending reply as the socket accepts.
///
/// Returns `Ok(true)` once everything is written, `Ok(false)` if the socket
/// would block first.
fn write_pending(stream: &mut TcpStream, buffers: &mut ConnBuffers) -> Result<bool, CloseReason> {
    while !buffers.is_flushed() {
        match stream.write(buffers.pending_write()) {
            Ok(0) => return Err(CloseReason::WriteZero),
            Ok(n) => buffers.advance_write(n),
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(true)
}

/// Handler for one accepted connection.
#[derive(Debug)]
pub struct ConnectionHandler {
    /// `None` while a work item owns the session.
    session: Option<Session>,
    state: ConnState,
    /// Read readiness arrived while busy.
    deferred: bool,
    /// Close as soon as the in-flight work item completes.
    cancelled: bool,
    peer: SocketAddr,
}

impl ConnectionHandler {
    pub fn new(stream: TcpStream, peer: SocketAddr, buffer_size: usize) -> Self {
        Self {
            session: Some(Session {
                stream,
                buffers: ConnBuffers::new(buffer_size),
            }),
            state: ConnState::Idle,
            deferred: false,
            cancelled: false,
            peer,
        }
    }

    pub fn state(&self) -> ConnState {
        self.state
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// The socket, unless a work item currently owns it.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        self.session.as_mut().map(|s| &mut s.stream)
    }

    /// React to read readiness.
    ///
    /// Returns a work item when idle. Otherwise the readiness is remembered
    /// and replayed once the connection is idle again.
    pub fn on_readable(&mut self, conn_id: usize, protocol: Protocol) -> Option<WorkItem> {
        if self.state != ConnState::Idle || self.cancelled {
            self.deferred = true;
            return None;
        }

        let session = self.session.take()?;
        self.state = ConnState::Processing;
        self.deferred = false;
        Some(WorkItem {
            conn_id,
            protocol,
            session,
        })
    }

    /// React to write readiness. Only meaningful while flushing.
    pub fn on_writable(&mut self) -> Next {
        if self.state != ConnState::Flushing {
            return Next::Keep;
        }
        let Some(session) = self.session.as_mut() else {
            return Next::Keep;
        };

        match write_pending(&mut session.stream, &mut session.buffers) {
            Ok(true) => {
                session.buffers.clear();
                self.state = ConnState::Idle;
                if std::mem::take(&mut self.deferred) {
                    Next::Resubmit
                } else {
                    Next::Read
                }
            }
            Ok(false) => Next::Keep,
            Err(reason) => Next::Close(reason),
        }
    }

    /// Take back the session from a finished work item.
    pub fn complete(&mut self, session: Session, outcome: Outcome) -> Next {
        debug_assert_eq!(self.state, ConnState::Processing);
        self.session = Some(session);
        self.state = ConnState::Idle;

        match outcome {
            Outcome::Closed(reason) => Next::Close(reason),
            _ if self.cancelled => Next::Close(CloseReason::Shutdown),
            Outcome::Flush => {
                self.state = ConnState::Flushing;
                Next::Write
            }
            Outcome::Idle => {
                if std::mem::take(&mut self.deferred) {
                    Next::Resubmit
                } else {
                    Next::Read
                }
            }
            Outcome::Done { more } => {
                if std::mem::take(&mut self.deferred) || more {
                    Next::Resubmit
                } else {
                    Next::Read
                }
            }
        }
    }

    /// Request the connection be closed.
    ///
    /// Returns the session when it can be released now. While a work item is
    /// in flight, the connection is marked instead and closes when the item
    /// completes.
    pub fn cancel(&mut self) -> Option<Session> {
        if self.state == ConnState::Processing {
            self.cancelled = true;
            return None;
        }
        self.session.take()
    }
}
