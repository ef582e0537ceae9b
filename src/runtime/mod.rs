//! Reactor runtime.
//!
//! A single event loop owns the poller and every registration; connection
//! work runs inline or on a fixed worker pool:
//! - `Acceptor`: accepts pending connections from the listener
//! - `ConnectionHandler`: per-connection state machine and work items
//! - `RegistrationTable`: token to handler mapping owned by the loop
//! - `WorkerPool`: threads that run offloaded work items

mod acceptor;
mod buffer;
mod connection;
pub mod protocol;
mod registry;
mod worker_pool;

mod mio;

pub(crate) use protocol::Protocol;

use crate::config::Config;
use crate::error::ServerError;

/// Run the server until it is shut down.
pub fn run(config: Config) -> Result<(), ServerError> {
    self::mio::run(&config)
}
