//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).

mod event_loop;

pub use event_loop::EventLoop;

use crate::config::Config;
use crate::error::ServerError;

/// Run the server using the mio backend.
pub fn run(config: &Config) -> Result<(), ServerError> {
    EventLoop::bind(config)?.run()
}
