//! Listener side of the event loop.

use mio::net::{TcpListener, TcpStream};
use std::io;
use std::net::SocketAddr;

/// Accepts pending connections from a non-blocking listener.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
}

impl Acceptor {
    pub fn new(listener: TcpListener) -> Self {
        Self { listener }
    }

    pub fn listener_mut(&mut self) -> &mut TcpListener {
        &mut self.listener
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accept at most one connection.
    ///
    /// `Ok(None)` means nothing is pending, which is not an error. Accepted
    /// sockets are already non-blocking.
    pub fn accept_one(&self) -> io::Result<Option<(TcpStream, SocketAddr)>> {
        loop {
            match self.listener.accept() {
                Ok(accepted) => return Ok(Some(accepted)),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
    }
}
