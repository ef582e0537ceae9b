//! Registration table owned by the event loop.
//!
//! Each entry binds a token (its slab key) to the interest registered with
//! the poller and the handler that events for that token are dispatched to.
//! Only the event loop thread reads or mutates the table.

use crate::runtime::acceptor::Acceptor;
use crate::runtime::connection::ConnectionHandler;
use mio::Interest;
use slab::Slab;

/// Upper bound on slots allocated up front; the slab grows past it on demand.
const INITIAL_CAPACITY: usize = 4096;

/// Handler invoked for events on a registration.
#[derive(Debug)]
pub enum Handler {
    Acceptor(Acceptor),
    Connection(ConnectionHandler),
}

/// A registered event source.
#[derive(Debug)]
pub struct Registration {
    pub interest: Interest,
    pub handler: Handler,
}

impl Registration {
    pub fn acceptor(acceptor: Acceptor) -> Self {
        Self {
            interest: Interest::READABLE,
            handler: Handler::Acceptor(acceptor),
        }
    }

    pub fn connection(handler: ConnectionHandler) -> Self {
        Self {
            interest: Interest::READABLE,
            handler: Handler::Connection(handler),
        }
    }
}

/// Registrations keyed by token with O(1) insert, lookup and remove.
pub struct RegistrationTable {
    entries: Slab<Registration>,
    connections: usize,
    max_connections: usize,
}

impl RegistrationTable {
    pub fn new(max_connections: usize) -> Self {
        // +1 for the listener
        let capacity = max_connections.saturating_add(1).min(INITIAL_CAPACITY);
        Self {
            entries: Slab::with_capacity(capacity),
            connections: 0,
            max_connections,
        }
    }

    /// Key the next insert will receive.
    pub fn next_key(&self) -> usize {
        self.entries.vacant_key()
    }

    pub fn insert(&mut self, registration: Registration) -> usize {
        if matches!(registration.handler, Handler::Connection(_)) {
            self.connections += 1;
        }
        self.entries.insert(registration)
    }

    pub fn get_mut(&mut self, key: usize) -> Option<&mut Registration> {
        self.entries.get_mut(key)
    }

    /// Mutable access to a connection handler.
    pub fn connection_mut(&mut self, key: usize) -> Option<&mut ConnectionHandler> {
        match self.entries.get_mut(key) {
            Some(Registration {
                handler: Handler::Connection(conn),
                ..
            }) => Some(conn),
            _ => None,
        }
    }

    pub fn remove(&mut self, key: usize) -> Option<Registration> {
        let registration = self.entries.try_remove(key)?;
        if matches!(registration.handler, Handler::Connection(_)) {
            self.connections -= 1;
        }
        Some(registration)
    }

    /// Keys of every live connection.
    pub fn connection_keys(&self) -> Vec<usize> {
        self.entries
            .iter()
            .filter(|(_, r)| matches!(r.handler, Handler::Connection(_)))
            .map(|(key, _)| key)
            .collect()
    }

    /// Number of live connections (the listener is not counted).
    pub fn connection_count(&self) -> usize {
        self.connections
    }

    pub fn at_capacity(&self) -> bool {
        self.connections >= self.max_connections
    }
}
