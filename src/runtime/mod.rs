//! Single-threaded chat runtime.
//!
//! Built from small pieces, leaves first:
//! - `ConnectionBuffer`: per-connection accumulator and outgoing queue
//! - `framer`: newline framing into `Message`s
//! - `broadcast`: fan-out to every other connection
//! - `ConnectionRegistry`: live connections keyed by readiness token
//! - `Reactor`: routes readiness events to the pieces above
//!
//! The mio backend owns the poll and feeds the reactor. `ShutdownHandle`
//! stops it from another thread (the binary wires it to Ctrl-C).

mod broadcast;
mod buffer;
mod connection;
mod framer;
mod mio;
mod reactor;

pub use self::mio::{Server, ShutdownHandle};
