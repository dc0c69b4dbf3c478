//! Backend-independent reactor core.
//!
//! The `Reactor` owns the connection registry and reacts to readiness
//! notifications: accepted streams, readable and writable sockets, and
//! socket errors. It never blocks; the readiness wait itself lives in the
//! backend (see `runtime::mio`), which feeds events in through
//! [`Reactor::accept`] and [`Reactor::dispatch`].
//!
//! Interest changes are applied through the [`Driver`] trait so the core can
//! run against a scripted transport in tests.

use crate::runtime::broadcast::broadcast;
use crate::runtime::buffer::{ConnectionBuffer, WriteStatus};
use crate::runtime::connection::{Connection, ConnectionRegistry};
use crate::runtime::framer;
use bytes::Bytes;
use mio::Interest;
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, trace, warn};

/// Readiness backend driven by the reactor.
pub trait Driver {
    /// Non-blocking transport handed over on accept.
    type Stream: Read + Write;

    /// Start delivering `interest` events for `stream` under `token`.
    fn register(&mut self, stream: &mut Self::Stream, token: usize, interest: Interest)
        -> io::Result<()>;

    /// Replace the interest set of an already registered stream.
    fn reregister(
        &mut self,
        stream: &mut Self::Stream,
        token: usize,
        interest: Interest,
    ) -> io::Result<()>;

    /// Stop delivering events for `stream`.
    fn deregister(&mut self, stream: &mut Self::Stream) -> io::Result<()>;

    /// Interrupt a blocked readiness wait.
    fn wake(&self) -> io::Result<()>;
}

/// What a backend observed for one token.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Readiness {
    pub readable: bool,
    pub writable: bool,
    pub error: bool,
}

impl Readiness {
    pub const READABLE: Readiness = Readiness {
        readable: true,
        writable: false,
        error: false,
    };

    #[cfg(test)]
    pub const WRITABLE: Readiness = Readiness {
        readable: false,
        writable: true,
        error: false,
    };

    #[cfg(test)]
    pub const ERROR: Readiness = Readiness {
        readable: false,
        writable: false,
        error: true,
    };
}

/// Tunables the reactor needs from the configuration.
#[derive(Debug, Clone)]
pub struct ReactorSettings {
    /// Upper bound on live connections.
    pub max_connections: usize,
    /// Scratch buffer size per `read` call.
    pub read_buffer_size: usize,
    /// Bytes queued on every freshly accepted connection.
    pub welcome: Bytes,
    /// Cap on a single line, if any.
    pub max_line_length: Option<usize>,
    /// Reads taken from one connection before yielding to the others.
    pub max_reads_per_event: usize,
}

impl Default for ReactorSettings {
    fn default() -> Self {
        Self {
            max_connections: 10_000,
            read_buffer_size: 4096,
            welcome: Bytes::from_static(b"Welcome to grow-a-chat!\n"),
            max_line_length: None,
            max_reads_per_event: 16,
        }
    }
}

/// Result of handling readable data on a connection.
enum ReadOutcome {
    /// Drained the socket; connection stays open.
    Open,
    /// Read budget spent with data possibly still waiting.
    Yielded,
    /// Peer closed its side.
    Eof,
}

/// Single-threaded connection multiplexer.
pub struct Reactor<D: Driver> {
    driver: D,
    registry: ConnectionRegistry<D::Stream>,
    settings: ReactorSettings,
    read_buf: Vec<u8>,
    /// Connections that yielded before reaching `WouldBlock`.
    still_readable: Vec<usize>,
}

impl<D: Driver> Reactor<D> {
    /// Create a reactor with an empty registry.
    pub fn new(driver: D, settings: ReactorSettings) -> Self {
        Self {
            driver,
            registry: ConnectionRegistry::new(settings.max_connections),
            read_buf: vec![0u8; settings.read_buffer_size.max(1)],
            still_readable: Vec::new(),
            settings,
        }
    }

    /// Live connections.
    #[cfg(test)]
    pub fn registry(&self) -> &ConnectionRegistry<D::Stream> {
        &self.registry
    }

    /// The readiness backend.
    #[cfg(test)]
    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Take ownership of an accepted, already non-blocking stream.
    ///
    /// Registers it readable + writable and queues the welcome line. Returns
    /// `None` when the connection was refused: registry full or the backend
    /// would not register it. A refused stream is dropped, which closes it.
    pub fn accept(&mut self, stream: D::Stream, peer: SocketAddr) -> Option<usize> {
        let buffer = ConnectionBuffer::with_max_line_length(self.settings.max_line_length);
        let Some(conn_id) = self.registry.register(Connection::new(stream, peer, buffer)) else {
            warn!(
                peer = %peer,
                max_connections = self.registry.capacity(),
                "Connection limit reached"
            );
            return None;
        };

        let welcome = self.settings.welcome.clone();
        let conn = &mut self.registry[conn_id];
        conn.buffer.enqueue(welcome);
        let interest = if conn.buffer.is_drained() {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        };

        if let Err(e) = self.driver.register(&mut conn.stream, conn_id, interest) {
            warn!(peer = %peer, error = %e, "Failed to register connection");
            self.registry.unregister(conn_id);
            return None;
        }
        conn.set_armed(interest.is_writable());
        self.registry
            .mark_write_interest(conn_id, interest.is_writable());

        debug!(
            conn_id,
            peer = %peer,
            connections = self.registry.len(),
            "Accepted connection"
        );
        Some(conn_id)
    }

    /// Route one readiness notification for a client connection.
    ///
    /// Faults close that connection only; nothing here stops the loop.
    pub fn dispatch(&mut self, conn_id: usize, readiness: Readiness) {
        if !self.registry.contains(conn_id) {
            return;
        }

        if readiness.error {
            debug!(conn_id, "Socket error reported");
            self.close(conn_id);
            return;
        }

        if readiness.readable {
            match self.handle_readable(conn_id) {
                Ok(ReadOutcome::Open) => {}
                Ok(ReadOutcome::Yielded) => {
                    if !self.still_readable.contains(&conn_id) {
                        self.still_readable.push(conn_id);
                    }
                }
                Ok(ReadOutcome::Eof) => {
                    debug!(conn_id, "Client closed connection");
                    self.close(conn_id);
                }
                Err(e) => {
                    debug!(conn_id, error = %e, "Connection error");
                    self.close(conn_id);
                }
            }
        }

        // Re-check connection exists (may have been removed)
        if readiness.writable && self.registry.contains(conn_id) {
            if let Err(e) = self.handle_writable(conn_id) {
                debug!(conn_id, error = %e, "Connection error");
                self.close(conn_id);
            }
        }

        self.sync_interest();
    }

    /// Tear down a connection: deregister and drop its transport.
    ///
    /// Closing a key that is already gone does nothing.
    pub fn close(&mut self, conn_id: usize) {
        if let Some(mut conn) = self.registry.unregister(conn_id) {
            if let Err(e) = self.driver.deregister(&mut conn.stream) {
                debug!(conn_id, error = %e, "Failed to deregister connection");
            }
            debug!(
                conn_id,
                peer = %conn.peer,
                dropped_bytes = conn.buffer.pending_bytes(),
                "Connection closed"
            );
        }
    }

    /// Close every connection.
    pub fn shutdown(&mut self) {
        let connections = self.registry.drain();
        let count = connections.len();
        for mut conn in connections {
            if let Err(e) = self.driver.deregister(&mut conn.stream) {
                debug!(peer = %conn.peer, error = %e, "Failed to deregister connection");
            }
        }
        self.still_readable.clear();
        debug!(count, "Closed all connections");
    }

    /// True when some connection yielded with input possibly left unread.
    pub fn has_pending_reads(&self) -> bool {
        !self.still_readable.is_empty()
    }

    /// Give every connection that yielded another read turn.
    ///
    /// Readiness is edge-triggered, so no new event arrives for bytes left
    /// behind by a yield; the backend calls this once per loop iteration.
    pub fn resume_reads(&mut self) {
        for conn_id in std::mem::take(&mut self.still_readable) {
            self.dispatch(conn_id, Readiness::READABLE);
        }
    }

    fn handle_readable(&mut self, conn_id: usize) -> io::Result<ReadOutcome> {
        let mut recipients = 0;
        let mut reads = 0;

        let result = loop {
            if reads == self.settings.max_reads_per_event.max(1) {
                break Ok(ReadOutcome::Yielded);
            }

            let conn = &mut self.registry[conn_id];
            let n = match conn.stream.read(&mut self.read_buf) {
                Ok(0) => break Ok(ReadOutcome::Eof),
                Ok(n) => n,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break Ok(ReadOutcome::Open),
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => break Err(e),
            };
            reads += 1;

            conn.buffer.append(&self.read_buf[..n]);
            let peer = conn.peer;
            let framed = framer::frame(&mut conn.buffer, conn_id, peer);

            for message in &framed.messages {
                trace!(conn_id, peer = %peer, text = %message.text, "Received message");
                recipients += broadcast(&mut self.registry, message);
            }

            // Lines ahead of the fault have gone out; the sender is dropped
            if let Some(e) = framed.error {
                break Err(e.into());
            }
        };

        if recipients > 0 {
            if let Err(e) = self.driver.wake() {
                warn!(error = %e, "Failed to wake event loop");
            }
        }

        result
    }

    fn handle_writable(&mut self, conn_id: usize) -> io::Result<()> {
        let conn = &mut self.registry[conn_id];
        match conn.buffer.write_to(&mut conn.stream)? {
            WriteStatus::Drained => {
                self.registry.mark_write_interest(conn_id, false);
            }
            WriteStatus::Pending => {
                trace!(
                    conn_id,
                    pending = conn.buffer.pending_bytes(),
                    "Partial write"
                );
            }
        }
        Ok(())
    }

    /// Push changed write interest down to the backend.
    fn sync_interest(&mut self) {
        for conn_id in self.registry.take_interest_changes() {
            let conn = &mut self.registry[conn_id];
            let writable = conn.write_interest();
            let interest = if writable {
                Interest::READABLE | Interest::WRITABLE
            } else {
                Interest::READABLE
            };

            match self.driver.reregister(&mut conn.stream, conn_id, interest) {
                Ok(()) => conn.set_armed(writable),
                Err(e) => {
                    debug!(conn_id, error = %e, "Failed to update interest");
                    self.close(conn_id);
                }
            }
        }
    }
}
