//! Error types for the reverb server.
//!
//! Startup failures are fatal and surface as `ServerError`. Everything that
//! goes wrong on a single connection is a `CloseReason`: it is logged and the
//! connection is closed, nothing else is affected.

use crate::config::ConfigError;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Fatal errors while setting up or running the event loop.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("failed to create poller: {0}")]
    Poller(#[source] io::Error),

    #[error("worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors raised by the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("failed to spawn worker {id}: {source}")]
    Spawn {
        id: usize,
        #[source]
        source: io::Error,
    },

    #[error("worker pool is shut down")]
    Closed,
}

/// Why a connection was closed.
#[derive(Debug, Error)]
pub enum CloseReason {
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("end-of-session sentinel received")]
    EndOfSession,

    #[error("write returned zero bytes")]
    WriteZero,

    #[error("work item rejected: {0}")]
    Rejected(#[from] PoolError),

    #[error("server shutting down")]
    Shutdown,

    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
