//! Sessions and their connection handles.
//!
//! A session is one live connection: an id assigned by the server, a
//! nickname chosen by the client and the handle used to write to it.

use courier_protocol::{Message, MAIN_ROOM_ID, SERVER_ID};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::debug;
use uuid::Uuid;

/// Atomic counter for handle ids.
static HANDLE_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Server-assigned identity of a session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh, globally unique session id.
    ///
    /// UUIDv7 ids sort by creation time.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7().simple().to_string())
    }

    /// Get the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check if a destination string is one of the routing aliases.
    #[must_use]
    pub fn is_reserved(id: &str) -> bool {
        id == MAIN_ROOM_ID || id == SERVER_ID
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for SessionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for SessionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl std::borrow::Borrow<str> for SessionId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

/// Process-unique identifier of a connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocate the next handle id.
    #[must_use]
    pub fn next() -> Self {
        Self(HANDLE_COUNTER.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Work item for a session's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    /// Write a message to the client.
    Deliver(Message),
    /// Close the connection.
    Close,
}

/// Errors writing to a single connection.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    /// The outbound queue is full; the message was dropped.
    #[error("outbound queue full")]
    QueueFull,

    /// The writer side of the connection is gone.
    #[error("connection closed")]
    Closed,
}

/// Write side of a connection.
///
/// Wraps the bounded queue drained by the connection's writer task. Sends
/// never block: a recipient that cannot keep up loses messages instead of
/// stalling its peers.
#[derive(Debug)]
pub struct ConnectionHandle {
    id: HandleId,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Create a handle over an outbound queue.
    #[must_use]
    pub fn new(tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            id: HandleId::next(),
            tx,
        }
    }

    /// Create a handle together with the receiving end of its queue.
    #[must_use]
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self::new(tx), rx)
    }

    /// Get the handle id.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.id
    }

    /// Queue a message for the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue is full or the writer is gone.
    pub fn send(&self, message: Message) -> Result<(), DeliveryError> {
        self.tx
            .try_send(Outbound::Deliver(message))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => DeliveryError::QueueFull,
                mpsc::error::TrySendError::Closed(_) => DeliveryError::Closed,
            })
    }

    /// Close the connection.
    ///
    /// Consumes the handle. If the close request cannot be queued the
    /// sender is still dropped, which ends the writer once it drains.
    pub fn close(self) {
        if self.tx.try_send(Outbound::Close).is_err() {
            debug!(handle = %self.id, "Close request not queued, dropping handle");
        }
    }
}

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// Registry entry exists, no nickname yet.
    Connecting,
    /// The client has supplied a nickname.
    Registered,
    /// Terminal; the session has left the registry.
    Closed,
}

/// A live connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    nickname: String,
    state: SessionState,
    handle: ConnectionHandle,
}

impl Session {
    /// Create a new session in the `Connecting` state.
    #[must_use]
    pub fn new(id: SessionId, handle: ConnectionHandle) -> Self {
        Self {
            id,
            nickname: String::new(),
            state: SessionState::Connecting,
            handle,
        }
    }

    /// Get the session id.
    #[must_use]
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Get the nickname (empty until registration).
    #[must_use]
    pub fn nickname(&self) -> &str {
        &self.nickname
    }

    /// Get the lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Get the id of this session's connection handle.
    #[must_use]
    pub fn handle_id(&self) -> HandleId {
        self.handle.id()
    }

    /// Set the nickname and move to `Registered`.
    pub fn register(&mut self, nickname: impl Into<String>) {
        self.nickname = nickname.into();
        self.state = SessionState::Registered;
    }

    /// Queue a message on this session's connection.
    ///
    /// # Errors
    ///
    /// Returns an error if the message could not be queued.
    pub fn send(&self, message: Message) -> Result<(), DeliveryError> {
        self.handle.send(message)
    }

    /// Close the session's connection.
    ///
    /// Consumes the session, so a connection is closed at most once.
    pub fn close(mut self) -> SessionInfo {
        self.state = SessionState::Closed;
        let info = self.info();
        self.handle.close();
        info
    }

    /// Get a read-only copy of this session.
    #[must_use]
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id.clone(),
            nickname: self.nickname.clone(),
            state: self.state,
        }
    }
}

/// Read-only view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionInfo {
    /// Session id.
    pub id: SessionId,
    /// Nickname.
    pub nickname: String,
    /// Lifecycle state.
    pub state: SessionState,
}

/// One entry of the online users listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OnlineUser {
    /// Display name.
    pub nickname: String,
    /// Session id.
    pub id: SessionId,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_session_id_generation() {
        let ids: HashSet<SessionId> = (0..1000).map(|_| SessionId::generate()).collect();
        assert_eq!(ids.len(), 1000);
    }

    #[test]
    fn test_reserved_ids() {
        assert!(SessionId::is_reserved("mainRoom"));
        assert!(SessionId::is_reserved("server"));
        assert!(!SessionId::is_reserved(SessionId::generate().as_str()));
    }

    #[test]
    fn test_handle_send_and_close() {
        let (handle, mut rx) = ConnectionHandle::channel(4);
        handle.send(Message::error("a", "boom")).unwrap();
        handle.close();

        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Deliver(Message::error("a", "boom"))
        );
        assert_eq!(rx.try_recv().unwrap(), Outbound::Close);
        // Sender was dropped with the handle
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_handle_full_queue() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        handle.send(Message::error("a", "one")).unwrap();
        assert_eq!(
            handle.send(Message::error("a", "two")),
            Err(DeliveryError::QueueFull)
        );
    }

    #[test]
    fn test_handle_closed_receiver() {
        let (handle, rx) = ConnectionHandle::channel(1);
        drop(rx);
        assert_eq!(
            handle.send(Message::error("a", "x")),
            Err(DeliveryError::Closed)
        );
    }

    #[test]
    fn test_session_lifecycle() {
        let (handle, _rx) = ConnectionHandle::channel(1);
        let mut session = Session::new(SessionId::from("s1"), handle);
        assert_eq!(session.state(), SessionState::Connecting);
        assert!(session.nickname().is_empty());

        session.register("alice");
        assert_eq!(session.state(), SessionState::Registered);
        assert_eq!(session.nickname(), "alice");

        let info = session.close();
        assert_eq!(info.state, SessionState::Closed);
        assert_eq!(info.nickname, "alice");
    }

    #[test]
    fn test_handle_ids_unique() {
        let (a, _ra) = ConnectionHandle::channel(1);
        let (b, _rb) = ConnectionHandle::channel(1);
        assert_ne!(a.id(), b.id());
    }
}
