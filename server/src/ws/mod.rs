pub mod actor;
pub mod broadcast;
pub mod handler;
pub mod protocol;
pub mod registry;

use tokio::sync::mpsc;

pub use registry::{ConnectionId, Peer, RegistryError, SessionRegistry};

/// Type alias for the sender half of a WebSocket connection's outbound queue.
/// Anything holding a clone can push frames to that client; the connection's
/// writer task drains the queue into the socket.
pub type ConnectionSender = mpsc::UnboundedSender<axum::extract::ws::Message>;
