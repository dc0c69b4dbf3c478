//! Fan-out of framed messages to every other connection.

use crate::runtime::connection::ConnectionRegistry;
use crate::runtime::framer::Message;
use tracing::trace;

/// Queue `message` on every live connection except its origin.
///
/// The wire form is encoded once and shared between recipients. Each
/// recipient is marked write-interested. Keys that vanish from the registry
/// while the snapshot is walked are skipped.
///
/// Returns the number of recipients.
pub fn broadcast<S>(registry: &mut ConnectionRegistry<S>, message: &Message) -> usize {
    let encoded = message.encode();
    let mut recipients = 0;

    for id in registry.all() {
        if id == message.origin {
            continue;
        }
        let Some(conn) = registry.get_mut(id) else {
            continue;
        };
        conn.buffer.enqueue(encoded.clone());
        registry.mark_write_interest(id, true);
        recipients += 1;
    }

    trace!(
        origin = message.origin,
        peer = %message.origin_addr,
        recipients,
        "Broadcast message"
    );

    recipients
}
