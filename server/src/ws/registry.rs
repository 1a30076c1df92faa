//! Session registry: which connections are live and what name each one
//! joined with.
//!
//! Backed by a DashMap keyed by connection id. A session is inserted with no
//! name when the socket opens, gets its name exactly once on join, and is
//! removed when the socket closes.

use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use super::ConnectionSender;

/// Identity of one WebSocket connection for its whole lifetime.
pub type ConnectionId = Uuid;

#[derive(Debug, Clone)]
struct Session {
    sender: ConnectionSender,
    name: Option<String>,
}

/// Snapshot of another session, as handed out by [`SessionRegistry::all_except`].
#[derive(Debug, Clone)]
pub struct Peer {
    pub id: ConnectionId,
    pub sender: ConnectionSender,
    pub name: Option<String>,
}

impl Peer {
    /// False once the connection's writer task has stopped draining its queue.
    pub fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("connection {0} is not registered")]
    NotFound(ConnectionId),
    #[error("connection {id} already joined as {name:?}")]
    AlreadyNamed { id: ConnectionId, name: String },
}

#[derive(Debug, Clone, Default)]
pub struct SessionRegistry {
    sessions: Arc<DashMap<ConnectionId, Session>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a newly opened connection. It starts without a name.
    pub fn register(&self, id: ConnectionId, sender: ConnectionSender) {
        self.sessions.insert(id, Session { sender, name: None });
        tracing::debug!(
            connection_id = %id,
            sessions = self.sessions.len(),
            "Session registered"
        );
    }

    /// Attach a display name to a session.
    ///
    /// Names are not validated. A session can be named once; later calls
    /// return `AlreadyNamed` and leave the original name in place.
    pub fn set_name(&self, id: ConnectionId, name: &str) -> Result<(), RegistryError> {
        let mut session = self
            .sessions
            .get_mut(&id)
            .ok_or(RegistryError::NotFound(id))?;
        if let Some(existing) = &session.name {
            return Err(RegistryError::AlreadyNamed {
                id,
                name: existing.clone(),
            });
        }
        session.name = Some(name.to_string());
        Ok(())
    }

    pub fn name_of(&self, id: ConnectionId) -> Option<String> {
        self.sessions.get(&id).and_then(|s| s.name.clone())
    }

    /// Remove a session. Removing an absent id is a no-op; returns whether
    /// anything was removed.
    pub fn unregister(&self, id: ConnectionId) -> bool {
        let removed = self.sessions.remove(&id).is_some();
        if removed {
            tracing::debug!(
                connection_id = %id,
                sessions = self.sessions.len(),
                "Session unregistered"
            );
        }
        removed
    }

    /// Every other registered session, named or not, copied out at call time.
    ///
    /// The returned iterator owns its snapshot, so sessions opening or closing
    /// while the caller iterates do not affect it.
    pub fn all_except(&self, id: ConnectionId) -> impl Iterator<Item = Peer> {
        let snapshot: Vec<Peer> = self
            .sessions
            .iter()
            .filter(|entry| *entry.key() != id)
            .map(|entry| Peer {
                id: *entry.key(),
                sender: entry.value().sender.clone(),
                name: entry.value().name.clone(),
            })
            .collect();
        snapshot.into_iter()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
