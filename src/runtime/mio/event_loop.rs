//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready, then the
//! registered handler for each token runs. One thread owns the poller and
//! the registration table. Connection work is either run inline or handed
//! to the worker pool; workers send the finished work back over a channel
//! and wake the poller so the loop picks it up.
//!
//! ## Waiting discipline
//!
//! By default the loop blocks until an event arrives. With `busy_poll` it
//! polls with a zero timeout instead, trading a core for wake-up latency.
//!
//! ## Framing
//!
//! There is none. Whatever a single read returns, up to the buffer size, is
//! treated as one message.

use crate::config::{Config, DispatchMode};
use crate::error::{CloseReason, PoolError, ServerError};
use crate::runtime::acceptor::Acceptor;
use crate::runtime::connection::{Completion, ConnectionHandler, Next, WorkItem};
use crate::runtime::registry::{Handler, Registration, RegistrationTable};
use crate::runtime::worker_pool::WorkerPool;
use crate::runtime::Protocol;
use crossbeam_channel::{Receiver, Sender};
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Token, Waker};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

const WAKER_TOKEN: Token = Token(usize::MAX);

/// How long to wait before retrying a listener whose accept failed.
const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(10);

/// Readiness of one token, copied out of `Events` before dispatch.
#[derive(Debug, Clone, Copy)]
struct Readiness {
    token: Token,
    readable: bool,
    writable: bool,
}

/// Handle for stopping a running event loop from another thread.
#[cfg_attr(not(test), allow(dead_code))]
#[derive(Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

#[cfg_attr(not(test), allow(dead_code))]
impl ServerHandle {
    /// Ask the loop to stop. `run()` returns once it has closed every
    /// connection and joined the workers.
    pub fn shutdown(&self) -> io::Result<()> {
        self.shutdown.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// The reactor: poller, registrations and the work dispatch policy.
pub struct EventLoop {
    poll: Poll,
    events: Events,
    registrations: RegistrationTable,
    waker: Arc<Waker>,
    dispatch: DispatchMode,
    pool: Option<WorkerPool>,
    completion_tx: Sender<Completion>,
    completion_rx: Receiver<Completion>,
    protocol: Protocol,
    buffer_size: usize,
    poll_timeout: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    local_addr: SocketAddr,
    /// Scratch space for the current batch of events.
    ready: Vec<Readiness>,
    /// Connections that should be read again without waiting for an event.
    pending_reads: Vec<usize>,
    /// Listeners whose last accept failed with connections possibly still
    /// queued. No new edge arrives for those, so they are retried each cycle.
    pending_accepts: Vec<usize>,
}

impl EventLoop {
    /// Bind the listener, create the poller and start the workers.
    pub fn bind(config: &Config) -> Result<Self, ServerError> {
        let addr = config.listen_addr()?;

        let poll = Poll::new().map_err(ServerError::Poller)?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN).map_err(ServerError::Poller)?;

        let listener = create_listener(addr).map_err(|source| ServerError::Bind { addr, source })?;
        let mut acceptor = Acceptor::new(TcpListener::from_std(listener));
        let local_addr = acceptor.local_addr()?;

        let mut registrations = RegistrationTable::new(config.max_connections);
        let key = registrations.next_key();
        poll.registry()
            .register(acceptor.listener_mut(), Token(key), Interest::READABLE)?;
        registrations.insert(Registration::acceptor(acceptor));

        let pool = match config.dispatch {
            DispatchMode::Pooled => Some(WorkerPool::new(config.workers)?),
            DispatchMode::Inline => None,
        };
        let (completion_tx, completion_rx) = crossbeam_channel::unbounded();

        Ok(Self {
            poll,
            events: Events::with_capacity(config.events_capacity),
            registrations,
            waker: Arc::new(waker),
            dispatch: config.dispatch,
            pool,
            completion_tx,
            completion_rx,
            protocol: config.protocol.into(),
            buffer_size: config.buffer_size,
            poll_timeout: config.busy_poll.then_some(Duration::ZERO),
            shutdown: Arc::new(AtomicBool::new(false)),
            local_addr,
            ready: Vec::with_capacity(config.events_capacity),
            pending_reads: Vec::new(),
            pending_accepts: Vec::new(),
        })
    }

    /// Address the listener is bound to.
    #[cfg_attr(not(test), allow(dead_code))]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    #[cfg_attr(not(test), allow(dead_code))]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Run until shut down through a `ServerHandle`.
    pub fn run(mut self) -> Result<(), ServerError> {
        info!(
            addr = %self.local_addr,
            protocol = ?self.protocol,
            dispatch = ?self.dispatch,
            workers = self.pool.as_ref().map_or(0, WorkerPool::size),
            busy_poll = self.poll_timeout.is_some(),
            "Event loop started"
        );

        while !self.shutdown.load(Ordering::Acquire) {
            let timeout = self.next_timeout();
            if let Err(e) = self.poll.poll(&mut self.events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e.into());
            }

            if !self.events.is_empty() {
                self.ready.clear();
                for event in self.events.iter() {
                    if event.token() == WAKER_TOKEN {
                        continue;
                    }
                    self.ready.push(Readiness {
                        token: event.token(),
                        readable: event.is_readable() || event.is_read_closed() || event.is_error(),
                        writable: event.is_writable() || event.is_write_closed() || event.is_error(),
                    });
                }

                let ready = std::mem::take(&mut self.ready);
                for readiness in &ready {
                    self.dispatch_event(*readiness);
                }
                self.ready = ready;
            }

            self.drain_completions();

            for conn_id in std::mem::take(&mut self.pending_reads) {
                self.on_readable(conn_id);
            }
            self.retry_accepts();
        }

        self.shutdown_connections();
        Ok(())
    }

    fn next_timeout(&self) -> Option<Duration> {
        if !self.pending_reads.is_empty() {
            return Some(Duration::ZERO);
        }
        if !self.pending_accepts.is_empty() {
            // Back off so a persistent error like EMFILE does not spin.
            return Some(
                self.poll_timeout
                    .map_or(ACCEPT_RETRY_DELAY, |t| t.min(ACCEPT_RETRY_DELAY)),
            );
        }
        self.poll_timeout
    }

    fn retry_accepts(&mut self) {
        for key in std::mem::take(&mut self.pending_accepts) {
            self.accept_connections(key);
        }
    }

    fn dispatch_event(&mut self, readiness: Readiness) {
        let key = readiness.token.0;
        let (is_acceptor, interest) = match self.registrations.get_mut(key) {
            Some(registration) => (
                matches!(registration.handler, Handler::Acceptor(_)),
                registration.interest,
            ),
            None => {
                trace!(token = key, "Event for cancelled registration");
                return;
            }
        };

        if is_acceptor {
            self.accept_connections(key);
            return;
        }

        if readiness.writable && interest.is_writable() {
            self.on_writable(key);
        }
        if readiness.readable && interest.is_readable() {
            self.on_readable(key);
        }
    }

    /// Invoke the acceptor until nothing is pending.
    ///
    /// Readiness is edge-triggered, so a single accept per event could leave
    /// connections waiting in the backlog.
    fn accept_connections(&mut self, key: usize) {
        loop {
            let accepted = match self.registrations.get_mut(key) {
                Some(Registration {
                    handler: Handler::Acceptor(acceptor),
                    ..
                }) => acceptor.accept_one(),
                _ => return,
            };

            match accepted {
                Ok(Some((stream, peer))) => self.register_connection(stream, peer),
                Ok(None) => break,
                Err(e) => {
                    error!(error = %e, "Accept error, retrying next cycle");
                    if !self.pending_accepts.contains(&key) {
                        self.pending_accepts.push(key);
                    }
                    break;
                }
            }
        }
    }

    fn register_connection(&mut self, stream: TcpStream, peer: SocketAddr) {
        if self.registrations.at_capacity() {
            warn!(peer = %peer, "Connection limit reached");
            return;
        }

        let mut handler = ConnectionHandler::new(stream, peer, self.buffer_size);
        let conn_id = self.registrations.next_key();
        if let Some(stream) = handler.stream_mut() {
            if let Err(e) = self
                .poll
                .registry()
                .register(stream, Token(conn_id), Interest::READABLE)
            {
                warn!(peer = %peer, error = %e, "Failed to register connection");
                return;
            }
        }
        self.registrations.insert(Registration::connection(handler));

        debug!(
            conn_id,
            peer = %peer,
            connections = self.registrations.connection_count(),
            "Accepted connection"
        );
    }

    fn on_readable(&mut self, conn_id: usize) {
        let protocol = self.protocol;
        let Some(conn) = self.registrations.connection_mut(conn_id) else {
            return;
        };

        match conn.on_readable(conn_id, protocol) {
            Some(item) => self.execute(item),
            None => trace!(conn_id, state = ?conn.state(), "Readiness deferred"),
        }
    }

    fn on_writable(&mut self, conn_id: usize) {
        let Some(conn) = self.registrations.connection_mut(conn_id) else {
            return;
        };
        let next = conn.on_writable();
        self.apply_next(conn_id, next);
    }

    /// Run a work item inline or hand it to the pool.
    fn execute(&mut self, item: WorkItem) {
        match self.dispatch {
            DispatchMode::Inline => {
                let completion = item.run();
                self.apply_completion(completion);
            }
            DispatchMode::Pooled => {
                let conn_id = item.conn_id;
                let tx = self.completion_tx.clone();
                let waker = Arc::clone(&self.waker);

                let job = move || {
                    let completion = item.run();
                    if tx.send(completion).is_ok() {
                        if let Err(e) = waker.wake() {
                            warn!(conn_id, error = %e, "Failed to wake event loop");
                        }
                    }
                };

                let submitted = self
                    .pool
                    .as_ref()
                    .map_or(Err(PoolError::Closed), |pool| pool.submit(conn_id, job));

                if let Err(e) = submitted {
                    // The session went down with the rejected job.
                    self.registrations.remove(conn_id);
                    let reason = CloseReason::from(e);
                    warn!(conn_id, reason = %reason, "Connection dropped");
                }
            }
        }
    }

    fn drain_completions(&mut self) {
        while let Ok(completion) = self.completion_rx.try_recv() {
            self.apply_completion(completion);
        }
    }

    fn apply_completion(&mut self, completion: Completion) {
        let conn_id = completion.conn_id;
        let Some(conn) = self.registrations.connection_mut(conn_id) else {
            error!(conn_id, "Completion for unknown connection");
            return;
        };
        let next = conn.complete(completion.session, completion.outcome);
        self.apply_next(conn_id, next);
    }

    fn apply_next(&mut self, conn_id: usize, next: Next) {
        match next {
            Next::Keep => {}
            Next::Read => self.set_interest(conn_id, Interest::READABLE),
            Next::Write => self.set_interest(conn_id, Interest::WRITABLE),
            Next::Resubmit => {
                self.set_interest(conn_id, Interest::READABLE);
                self.pending_reads.push(conn_id);
            }
            Next::Close(reason) => self.close_connection(conn_id, reason),
        }
    }

    /// Re-arm the connection with `interest`.
    fn set_interest(&mut self, conn_id: usize, interest: Interest) {
        let registry = self.poll.registry();
        let Some(registration) = self.registrations.get_mut(conn_id) else {
            return;
        };
        let Handler::Connection(conn) = &mut registration.handler else {
            return;
        };
        let Some(stream) = conn.stream_mut() else {
            return;
        };

        match registry.reregister(stream, Token(conn_id), interest) {
            Ok(()) => registration.interest = interest,
            Err(e) => self.close_connection(conn_id, e.into()),
        }
    }

    /// Cancel the registration and release the socket.
    ///
    /// A connection with a work item in flight is only marked; it closes when
    /// the item completes.
    fn close_connection(&mut self, conn_id: usize, reason: CloseReason) {
        let Some(conn) = self.registrations.connection_mut(conn_id) else {
            return;
        };
        let peer = conn.peer();

        let Some(mut session) = conn.cancel() else {
            debug!(conn_id, reason = %reason, "Close deferred until work item completes");
            return;
        };

        if let Err(e) = self.poll.registry().deregister(&mut session.stream) {
            trace!(conn_id, error = %e, "Deregister failed");
        }
        self.registrations.remove(conn_id);

        debug!(
            conn_id,
            peer = %peer,
            reason = %reason,
            connections = self.registrations.connection_count(),
            "Connection closed"
        );
    }

    fn shutdown_connections(&mut self) {
        info!(
            connections = self.registrations.connection_count(),
            "Event loop shutting down"
        );

        for conn_id in self.registrations.connection_keys() {
            self.close_connection(conn_id, CloseReason::Shutdown);
        }

        // In-flight work finishes, then its completions close the rest.
        if let Some(mut pool) = self.pool.take() {
            pool.shutdown();
        }
        self.drain_completions();
    }
}

/// Create a non-blocking TCP listener.
fn create_listener(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(1024)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProtocolType;
    use std::io::{Read, Write};
    use std::net::TcpStream as StdStream;
    use std::thread::{self, JoinHandle};

    struct TestServer {
        addr: SocketAddr,
        handle: ServerHandle,
        thread: Option<JoinHandle<Result<(), ServerError>>>,
    }

    impl TestServer {
        fn start(protocol: ProtocolType, dispatch: DispatchMode) -> Self {
            Self::start_with(Config {
                protocol,
                dispatch,
                workers: 4,
                ..Config::default()
            })
        }

        fn start_with(config: Config) -> Self {
            let event_loop = EventLoop::bind(&config).unwrap();
            let addr = event_loop.local_addr();
            let handle = event_loop.handle();
            let thread = thread::spawn(move || event_loop.run());
            Self {
                addr,
                handle,
                thread: Some(thread),
            }
        }

        fn connect(&self) -> StdStream {
            let stream = StdStream::connect(self.addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            stream
        }

        fn stop(mut self) -> Result<(), ServerError> {
            self.handle.shutdown().unwrap();
            self.thread.take().unwrap().join().unwrap()
        }
    }

    impl Drop for TestServer {
        fn drop(&mut self) {
            if let Some(thread) = self.thread.take() {
                let _ = self.handle.shutdown();
                let _ = thread.join();
            }
        }
    }

    fn exchange(stream: &mut StdStream, message: &[u8], expected_len: usize) -> Vec<u8> {
        stream.write_all(message).unwrap();
        let mut reply = vec![0u8; expected_len];
        stream.read_exact(&mut reply).unwrap();
        reply
    }

    #[test]
    fn test_pooled_word_reversal() {
        let server = TestServer::start(ProtocolType::Reverse, DispatchMode::Pooled);
        let mut client = server.connect();

        assert_eq!(exchange(&mut client, b"Hi This is Sumit", 16), b"iH sihT si timuS");
        assert_eq!(
            exchange(&mut client, b"Just trying out some luck", 25),
            b"tsuJ gniyrt tuo emos kcul"
        );

        drop(client);
        server.stop().unwrap();
    }

    #[test]
    fn test_inline_transmogrify() {
        let server = TestServer::start(ProtocolType::Transmogrify, DispatchMode::Inline);
        let mut client = server.connect();

        assert_eq!(exchange(&mut client, b"Hello, World 5", 14), b"hELLO, wORLD 5");
        assert_eq!(exchange(&mut client, b"A", 1), b"a");

        server.stop().unwrap();
    }

    #[test]
    fn test_sentinel_closes_without_reply() {
        for dispatch in [DispatchMode::Pooled, DispatchMode::Inline] {
            let server = TestServer::start(ProtocolType::Transmogrify, dispatch);
            let mut client = server.connect();

            client.write_all(b"  EOM \r\n").unwrap();
            let mut buf = [0u8; 16];
            let n = client.read(&mut buf).unwrap();
            assert_eq!(n, 0, "server must close without replying");

            server.stop().unwrap();
        }
    }

    #[test]
    fn test_busy_poll() {
        let server = TestServer::start_with(Config {
            protocol: ProtocolType::Reverse,
            busy_poll: true,
            workers: 2,
            ..Config::default()
        });
        let mut client = server.connect();

        assert_eq!(exchange(&mut client, b"abc def", 7), b"cba fed");

        server.stop().unwrap();
    }

    #[test]
    fn test_clients_are_isolated() {
        let server = TestServer::start(ProtocolType::Reverse, DispatchMode::Pooled);

        let clients: Vec<_> = (0..8)
            .map(|id| {
                let mut stream = server.connect();
                thread::spawn(move || {
                    for round in 0..20 {
                        let message = format!("client{id} round{round}");
                        let expected: Vec<String> = message
                            .split(' ')
                            .map(|word| word.chars().rev().collect())
                            .collect();
                        let expected = expected.join(" ");
                        let reply = exchange(&mut stream, message.as_bytes(), expected.len());
                        assert_eq!(String::from_utf8(reply).unwrap(), expected);
                    }
                })
            })
            .collect();

        for client in clients {
            client.join().unwrap();
        }
        server.stop().unwrap();
    }

    #[test]
    fn test_connection_limit() {
        let server = TestServer::start_with(Config {
            max_connections: 1,
            ..Config::default()
        });

        let mut first = server.connect();
        assert_eq!(exchange(&mut first, b"ab", 2), b"ba");

        let mut second = server.connect();
        let _ = second.write_all(b"cd");
        let mut buf = [0u8; 4];
        // Rejected connections are closed straight away.
        let rejected = matches!(second.read(&mut buf), Ok(0) | Err(_));
        assert!(rejected);

        server.stop().unwrap();
    }

    #[test]
    fn test_shutdown_with_open_connections() {
        let server = TestServer::start(ProtocolType::Reverse, DispatchMode::Pooled);
        let mut client = server.connect();
        assert_eq!(exchange(&mut client, b"xy", 2), b"yx");

        server.stop().unwrap();

        let mut buf = [0u8; 4];
        assert!(matches!(client.read(&mut buf), Ok(0) | Err(_)));
    }

    #[test]
    fn test_large_replies_flush_under_backpressure() {
        const TOTAL: usize = 16 * 1024 * 1024;

        for dispatch in [DispatchMode::Pooled, DispatchMode::Inline] {
            let server = TestServer::start_with(Config {
                protocol: ProtocolType::Transmogrify,
                dispatch,
                workers: 2,
                buffer_size: 4096,
                ..Config::default()
            });
            let mut client = server.connect();
            let mut writer = client.try_clone().unwrap();

            let input: Vec<u8> = (0..TOTAL).map(|i| b'a' + (i % 26) as u8).collect();
            let expected: Vec<u8> = input.iter().map(u8::to_ascii_uppercase).collect();

            let sender = thread::spawn(move || writer.write_all(&input).unwrap());
            // Nobody reads yet, so the server's replies back up until its
            // writes return WouldBlock and the connection has to flush later.
            thread::sleep(Duration::from_millis(700));

            let mut reply = vec![0u8; TOTAL];
            client.read_exact(&mut reply).unwrap();
            sender.join().unwrap();
            assert!(reply == expected, "reply corrupted with {dispatch:?}");

            server.stop().unwrap();
        }
    }

    #[test]
    fn test_reset_connections_do_not_affect_others() {
        for dispatch in [DispatchMode::Pooled, DispatchMode::Inline] {
            let server = TestServer::start(ProtocolType::Reverse, dispatch);
            let mut survivor = server.connect();
            assert_eq!(exchange(&mut survivor, b"ab cd", 5), b"ba dc");

            for _ in 0..20 {
                let mut client = server.connect();
                client.write_all(b"hello world").unwrap();
                // Zero linger turns the close into a RST.
                let socket = socket2::Socket::from(client);
                socket.set_linger(Some(Duration::ZERO)).unwrap();
                drop(socket);
            }

            assert_eq!(exchange(&mut survivor, b"xy z", 4), b"yx z");
            let mut late = server.connect();
            assert_eq!(exchange(&mut late, b"ab cd", 5), b"ba dc");

            server.stop().unwrap();
        }
    }

    #[test]
    fn test_failed_accept_is_retried() {
        let config = Config {
            dispatch: DispatchMode::Inline,
            ..Config::default()
        };
        let mut event_loop = EventLoop::bind(&config).unwrap();
        let _client = StdStream::connect(event_loop.local_addr()).unwrap();
        thread::sleep(Duration::from_millis(50));

        // The listener is key 0. Queue it as if its accept had just failed
        // with the client still in the backlog.
        event_loop.pending_accepts.push(0);
        assert_eq!(event_loop.next_timeout(), Some(ACCEPT_RETRY_DELAY));

        event_loop.retry_accepts();
        assert_eq!(event_loop.registrations.connection_count(), 1);
        assert!(event_loop.pending_accepts.is_empty());
        assert_eq!(event_loop.next_timeout(), None);
    }

    #[test]
    fn test_bind_failure() {
        let server = TestServer::start(ProtocolType::Reverse, DispatchMode::Inline);
        let config = Config {
            host: server.addr.ip().to_string(),
            port: server.addr.port(),
            ..Config::default()
        };

        // SO_REUSEADDR does not allow two listeners on one port.
        assert!(matches!(
            EventLoop::bind(&config),
            Err(ServerError::Bind { .. })
        ));
    }
}
