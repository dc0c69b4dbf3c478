//! mio-based event loop implementation.
//!
//! Readiness-based I/O using mio (epoll on Linux, kqueue on macOS).
//! Runs the `Reactor` core on the calling thread.

mod event_loop;

pub use event_loop::{Server, ShutdownHandle};
