use axum::extract::ws::Message;

use super::{ConnectionId, ConnectionSender, SessionRegistry};

/// Format a chat line the way clients receive it: `"{name}: {content}"`.
pub fn format_line(name: &str, content: &str) -> String {
    format!("{}: {}", name, content)
}

/// Queue a text line on one connection.
/// Returns false if the connection's writer has already gone away.
pub fn send_line(sender: &ConnectionSender, line: &str) -> bool {
    sender.send(Message::Text(line.into())).is_ok()
}

/// Send a text line to every registered connection except `origin`.
///
/// Connections whose writer has stopped are skipped; nothing is queued or
/// retried for them. Returns the number of connections the line was queued on.
pub fn broadcast_except(registry: &SessionRegistry, origin: ConnectionId, line: &str) -> usize {
    let msg = Message::Text(line.into());
    let mut delivered = 0;

    for peer in registry.all_except(origin) {
        if !peer.is_open() {
            tracing::trace!(
                connection_id = %peer.id,
                name = ?peer.name,
                "Skipping closed connection"
            );
            continue;
        }
        if peer.sender.send(msg.clone()).is_ok() {
            delivered += 1;
        }
    }

    delivered
}
