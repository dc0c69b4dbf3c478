//! mio event loop implementation.
//!
//! Readiness-based model: poll tells us when sockets are ready,
//! then the reactor performs non-blocking read/write syscalls.
//! Uses epoll on Linux, kqueue on macOS.
//!
//! A single thread owns the poll, the listener and every connection. The
//! only blocking call is `Poll::poll`; a `Waker` interrupts it for
//! broadcasts and shutdown requests.

use crate::config::Config;
use crate::runtime::reactor::{Driver, Reactor, ReactorSettings, Readiness};
use bytes::Bytes;
use mio::net::{TcpListener, TcpStream};
use mio::{Events, Interest, Poll, Registry, Token, Waker};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

const LISTENER_TOKEN: Token = Token(usize::MAX);
const WAKER_TOKEN: Token = Token(usize::MAX - 1);

/// Listen backlog handed to the kernel.
const BACKLOG: i32 = 1024;

/// `Driver` backed by a mio registry.
pub struct MioDriver {
    registry: Registry,
    waker: Arc<Waker>,
}

impl Driver for MioDriver {
    type Stream = TcpStream;

    fn register(&mut self, stream: &mut TcpStream, token: usize, interest: Interest) -> io::Result<()> {
        self.registry.register(stream, Token(token), interest)
    }

    fn reregister(
        &mut self,
        stream: &mut TcpStream,
        token: usize,
        interest: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(stream, Token(token), interest)
    }

    fn deregister(&mut self, stream: &mut TcpStream) -> io::Result<()> {
        self.registry.deregister(stream)
    }

    fn wake(&self) -> io::Result<()> {
        self.waker.wake()
    }
}

/// Requests that a running `Server` stop. Cheap to clone and `Send`.
#[derive(Clone)]
pub struct ShutdownHandle {
    requested: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl ShutdownHandle {
    /// Ask the loop to close every connection and return from `run`.
    pub fn shutdown(&self) -> io::Result<()> {
        self.requested.store(true, Ordering::Release);
        self.waker.wake()
    }
}

/// Chat server bound to a listening socket.
pub struct Server {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    reactor: Reactor<MioDriver>,
    batch_size: usize,
    shutdown: Arc<AtomicBool>,
    waker: Arc<Waker>,
}

impl Server {
    /// Bind the listening socket and prepare the poll.
    ///
    /// Bind failures are returned to the caller; nothing retries them.
    pub fn bind(config: &Config) -> io::Result<Self> {
        let addr = resolve(&config.host, config.port)?;

        let poll = Poll::new()?;
        let mut listener = TcpListener::from_std(create_listener(addr)?);
        let local_addr = listener.local_addr()?;
        poll.registry()
            .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;

        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let driver = MioDriver {
            registry: poll.registry().try_clone()?,
            waker: Arc::clone(&waker),
        };

        let settings = ReactorSettings {
            max_connections: config.max_connections,
            read_buffer_size: config.read_buffer_size,
            welcome: welcome_line(&config.welcome),
            max_line_length: config.max_line_length,
            max_reads_per_event: config.reads_per_event,
        };

        info!(
            addr = %local_addr,
            max_connections = config.max_connections,
            max_line_length = ?config.max_line_length,
            "Listening"
        );

        Ok(Self {
            poll,
            listener,
            local_addr,
            reactor: Reactor::new(driver, settings),
            batch_size: config.batch_size.max(1),
            shutdown: Arc::new(AtomicBool::new(false)),
            waker,
        })
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Handle for stopping `run` from another thread.
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            requested: Arc::clone(&self.shutdown),
            waker: Arc::clone(&self.waker),
        }
    }

    /// Serve until shutdown is requested.
    ///
    /// Per-connection faults are absorbed by the reactor. Only poll and
    /// listener failures come back as errors.
    pub fn run(&mut self) -> io::Result<()> {
        let mut events = Events::with_capacity(self.batch_size);
        info!(addr = %self.local_addr, "Server started, waiting for connections");

        loop {
            // Connections that yielded mid-read get no new edge; don't sleep on them
            let timeout = self
                .reactor
                .has_pending_reads()
                .then_some(Duration::ZERO);

            if let Err(e) = self.poll.poll(&mut events, timeout) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTENER_TOKEN => accept_connections(&self.listener, &mut self.reactor)?,
                    WAKER_TOKEN => {}
                    Token(conn_id) => {
                        let readiness = Readiness {
                            readable: event.is_readable() || event.is_read_closed(),
                            writable: event.is_writable(),
                            error: event.is_error(),
                        };
                        self.reactor.dispatch(conn_id, readiness);
                    }
                }
            }

            self.reactor.resume_reads();

            if self.shutdown.load(Ordering::Acquire) {
                break;
            }
        }

        self.reactor.shutdown();
        if let Err(e) = self.poll.registry().deregister(&mut self.listener) {
            debug!(error = %e, "Failed to deregister listener");
        }
        info!(addr = %self.local_addr, "Server stopped");
        Ok(())
    }
}

/// Accept until the listener would block.
///
/// A refused or aborted client only affects itself; any other accept error
/// means the listening socket is broken and is returned.
fn accept_connections(listener: &TcpListener, reactor: &mut Reactor<MioDriver>) -> io::Result<()> {
    loop {
        match listener.accept() {
            Ok((stream, peer_addr)) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!(peer = %peer_addr, error = %e, "Failed to set TCP_NODELAY");
                }
                reactor.accept(stream, peer_addr);
            }
            Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(()),
            Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(ref e) if e.kind() == io::ErrorKind::ConnectionAborted => {
                debug!(error = %e, "Client aborted before accept");
            }
            Err(e) => {
                error!(error = %e, "Accept error");
                return Err(e);
            }
        }
    }
}

/// Welcome text as sent on the wire, newline-terminated. Empty disables it.
fn welcome_line(welcome: &str) -> Bytes {
    if welcome.is_empty() || welcome.ends_with('\n') {
        Bytes::copy_from_slice(welcome.as_bytes())
    } else {
        Bytes::from(format!("{welcome}\n"))
    }
}

fn resolve(host: &str, port: u16) -> io::Result<SocketAddr> {
    (host, port).to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("no address for {host}:{port}"),
        )
    })
}

/// Create a non-blocking TCP listener with SO_REUSEADDR.
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
    socket.listen(BACKLOG)?;

    Ok(socket.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader, Read, Write};
    use std::net::TcpStream as StdTcpStream;
    use std::thread::{self, JoinHandle};

    struct Running {
        addr: SocketAddr,
        handle: ShutdownHandle,
        thread: JoinHandle<io::Result<()>>,
    }

    impl Running {
        fn stop(self) {
            self.handle.shutdown().unwrap();
            self.thread.join().unwrap().unwrap();
        }
    }

    fn start(config: Config) -> Running {
        let mut server = Server::bind(&config).unwrap();
        let addr = server.local_addr();
        let handle = server.shutdown_handle();
        let thread = thread::spawn(move || server.run());
        Running {
            addr,
            handle,
            thread,
        }
    }

    fn test_config() -> Config {
        Config {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..Config::default()
        }
    }

    struct Client {
        writer: StdTcpStream,
        reader: BufReader<StdTcpStream>,
    }

    impl Client {
        /// Connect and consume the welcome line.
        fn connect(addr: SocketAddr) -> Self {
            let stream = StdTcpStream::connect(addr).unwrap();
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .unwrap();
            let mut client = Client {
                reader: BufReader::new(stream.try_clone().unwrap()),
                writer: stream,
            };
            assert_eq!(client.line(), "Welcome to grow-a-chat!\n");
            client
        }

        fn addr(&self) -> SocketAddr {
            self.writer.local_addr().unwrap()
        }

        fn send(&mut self, data: &[u8]) {
            self.writer.write_all(data).unwrap();
            self.writer.flush().unwrap();
        }

        fn line(&mut self) -> String {
            let mut line = String::new();
            self.reader.read_line(&mut line).unwrap();
            line
        }
    }

    #[test]
    fn test_broadcast_between_clients() {
        let server = start(test_config());

        let mut b = Client::connect(server.addr);
        let mut a = Client::connect(server.addr);

        a.send(b"hello\n");
        assert_eq!(b.line(), format!("[{}] hello\n", a.addr()));

        // A never sees its own line: the next thing it reads is B's reply
        b.send(b"hi back\n");
        assert_eq!(a.line(), format!("[{}] hi back\n", b.addr()));

        server.stop();
    }

    #[test]
    fn test_line_split_across_writes() {
        let server = start(test_config());

        let mut a = Client::connect(server.addr);
        let mut b = Client::connect(server.addr);

        a.send(b"a");
        thread::sleep(Duration::from_millis(50));
        a.send(b"b\n");
        a.send(b"\n  \nx\ny\n");

        let from = a.addr();
        assert_eq!(b.line(), format!("[{from}] ab\n"));
        assert_eq!(b.line(), format!("[{from}] x\n"));
        assert_eq!(b.line(), format!("[{from}] y\n"));

        server.stop();
    }

    #[test]
    fn test_dropped_peer_does_not_disturb_others() {
        let server = start(test_config());

        let mut a = Client::connect(server.addr);
        let mut b = Client::connect(server.addr);
        let c = Client::connect(server.addr);
        drop(c);

        for i in 0..50 {
            a.send(format!("message {i}\n").as_bytes());
        }
        let from = a.addr();
        for i in 0..50 {
            assert_eq!(b.line(), format!("[{from}] message {i}\n"));
        }

        server.stop();
    }

    #[test]
    fn test_small_read_budget_delivers_everything() {
        let config = Config {
            read_buffer_size: 4,
            reads_per_event: 1,
            ..test_config()
        };
        let server = start(config);

        let mut a = Client::connect(server.addr);
        let mut b = Client::connect(server.addr);

        let burst: String = (0..20).map(|i| format!("line {i}\n")).collect();
        a.send(burst.as_bytes());
        b.send(b"from b\n");

        let from = a.addr();
        for i in 0..20 {
            assert_eq!(b.line(), format!("[{from}] line {i}\n"));
        }
        assert_eq!(a.line(), format!("[{}] from b\n", b.addr()));

        server.stop();
    }

    #[test]
    fn test_good_line_ahead_of_bad_bytes_is_relayed() {
        let server = start(test_config());

        let mut a = Client::connect(server.addr);
        let mut b = Client::connect(server.addr);

        a.send(b"ok\n\xff\n");
        assert_eq!(b.line(), format!("[{}] ok\n", a.addr()));

        let mut rest = Vec::new();
        let n = a.reader.read_to_end(&mut rest).unwrap_or(0);
        assert_eq!(n, 0);

        server.stop();
    }

    #[test]
    fn test_custom_welcome() {
        let config = Config {
            welcome: "custom greeting".to_string(),
            ..test_config()
        };
        let server = start(config);

        let stream = StdTcpStream::connect(server.addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        let mut reader = BufReader::new(stream);
        let mut line = String::new();
        reader.read_line(&mut line).unwrap();
        assert_eq!(line, "custom greeting\n");

        server.stop();
    }

    #[test]
    fn test_shutdown_closes_clients() {
        let server = start(test_config());
        let mut a = Client::connect(server.addr);

        server.stop();

        let mut rest = Vec::new();
        let n = a.reader.read_to_end(&mut rest).unwrap_or(0);
        assert_eq!(n, 0);
    }

    #[test]
    fn test_bind_conflict_is_error() {
        let first = Server::bind(&test_config()).unwrap();
        let config = Config {
            port: first.local_addr().port(),
            ..test_config()
        };
        assert!(Server::bind(&config).is_err());
    }

    #[test]
    fn test_welcome_line() {
        assert_eq!(&welcome_line("hi")[..], b"hi\n");
        assert_eq!(&welcome_line("hi\n")[..], b"hi\n");
        assert!(welcome_line("").is_empty());
    }
}
