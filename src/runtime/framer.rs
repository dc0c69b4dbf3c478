//! Line framing: turns accumulated bytes into chat messages.

use crate::runtime::buffer::{ConnectionBuffer, FrameError};
use bytes::Bytes;
use std::net::SocketAddr;

/// Line terminator on the wire.
pub const SEPARATOR: u8 = b'\n';

/// One chat line and where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Registry token of the sending connection.
    pub origin: usize,
    /// Remote address of the sender, used in the broadcast prefix.
    pub origin_addr: SocketAddr,
    /// Line text without terminator or surrounding whitespace.
    pub text: String,
}

impl Message {
    /// Wire form sent to recipients: `[<addr>] <text>\n`.
    pub fn encode(&self) -> Bytes {
        Bytes::from(format!("[{}] {}\n", self.origin_addr, self.text))
    }
}

/// Messages framed in one pass, plus the fault that stopped it, if any.
#[derive(Debug, Default)]
pub struct Framed {
    pub messages: Vec<Message>,
    pub error: Option<FrameError>,
}

/// Extract every complete message currently held in `buffer`.
///
/// Messages come back in the order their terminators arrived; a trailing
/// partial line stays buffered until a later read completes it. Messages
/// framed before a bad line are returned even when `error` is set.
pub fn frame(buffer: &mut ConnectionBuffer, origin: usize, origin_addr: SocketAddr) -> Framed {
    let segments = buffer.take_ready(SEPARATOR);
    Framed {
        messages: segments
            .lines
            .into_iter()
            .map(|text| Message {
                origin,
                origin_addr,
                text,
            })
            .collect(),
        error: segments.error,
    }
}
