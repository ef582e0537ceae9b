//! reverb: a reactor-based message transformation server
//!
//! Every message a client sends is transformed and written back on the same
//! connection:
//! - Transmogrify: toggle the case of ASCII letters
//! - Reverse: reverse each word
//!
//! Features:
//! - Single event loop over mio (epoll/kqueue)
//! - Connection work offloaded to a fixed worker pool, or run inline
//! - `EOM` closes the session without a reply
//! - Configuration via CLI arguments or TOML file

mod config;
mod error;
mod protocols;
mod runtime;

use config::Config;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration; a missing port exits here with a usage error
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        protocol = ?config.protocol,
        dispatch = ?config.dispatch,
        workers = config.workers,
        buffer_size = config.buffer_size,
        "Starting reverb server"
    );

    runtime::run(config)?;
    Ok(())
}
