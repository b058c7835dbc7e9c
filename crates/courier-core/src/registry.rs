//! The session registry.
//!
//! The registry is the single source of truth for who is online. The map is
//! guarded by one lock and never handed out; every read, mutation and write
//! to a connection goes through an operation here, so each one is atomic
//! with respect to the others.

use crate::session::{
    ConnectionHandle, DeliveryError, HandleId, OnlineUser, Session, SessionId, SessionInfo,
};
use courier_protocol::Message;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::debug;

/// Registry errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    /// No session with this id.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The session already has a nickname and the policy forbids changing it.
    #[error("nickname already registered")]
    AlreadyRegistered,
}

/// What to do when a registered session registers again.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RegistrationPolicy {
    /// Replace the nickname every time.
    #[default]
    Overwrite,
    /// Keep the first nickname and reject later attempts.
    Reject,
}

/// Outcome of writing one message to many sessions.
#[derive(Debug, Default)]
pub struct FanOut {
    /// Number of sessions the message was queued for.
    pub delivered: usize,
    /// Sessions the message could not be queued for.
    pub failed: Vec<(SessionId, DeliveryError)>,
}

impl FanOut {
    /// Total number of recipients attempted.
    #[must_use]
    pub fn attempted(&self) -> usize {
        self.delivered + self.failed.len()
    }
}

/// The table of live sessions.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Session>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a session for a new connection and return its id.
    pub fn register(&self, handle: ConnectionHandle) -> SessionId {
        let mut sessions = self.sessions.write();
        Self::insert(&mut sessions, handle)
    }

    /// Create a session and queue `greeting` as its first message.
    ///
    /// Both happen under one lock, so no broadcast can reach the session
    /// ahead of the greeting. The session is registered even if the
    /// greeting cannot be queued.
    pub fn register_with_greeting(
        &self,
        handle: ConnectionHandle,
        greeting: impl FnOnce(&SessionId) -> Message,
    ) -> (SessionId, Result<(), DeliveryError>) {
        let mut sessions = self.sessions.write();
        let id = Self::insert(&mut sessions, handle);
        let sent = match sessions.get(&id) {
            Some(session) => session.send(greeting(&id)),
            None => Err(DeliveryError::Closed),
        };
        (id, sent)
    }

    fn insert(sessions: &mut HashMap<SessionId, Session>, handle: ConnectionHandle) -> SessionId {
        let mut id = SessionId::generate();
        while sessions.contains_key(&id) {
            id = SessionId::generate();
        }

        debug!(session = %id, handle = %handle.id(), "Session registered");
        sessions.insert(id.clone(), Session::new(id.clone(), handle));
        id
    }

    /// Look up a session.
    #[must_use]
    pub fn lookup(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).map(Session::info)
    }

    /// Check if a session is online.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.sessions.read().contains_key(id)
    }

    /// Set a session's nickname, moving it to `Registered`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` if the id is absent, or `AlreadyRegistered`
    /// if the session has a nickname and `policy` is `Reject`.
    pub fn set_nickname(
        &self,
        id: &str,
        nickname: impl Into<String>,
        policy: RegistrationPolicy,
    ) -> Result<SessionInfo, RegistryError> {
        let mut sessions = self.sessions.write();
        let session = sessions
            .get_mut(id)
            .ok_or_else(|| RegistryError::UnknownSession(SessionId::from(id)))?;

        if policy == RegistrationPolicy::Reject && !session.nickname().is_empty() {
            return Err(RegistryError::AlreadyRegistered);
        }

        session.register(nickname);
        debug!(session = %id, nickname = %session.nickname(), "Nickname set");
        Ok(session.info())
    }

    /// Remove a session and hand it back to the caller.
    ///
    /// Returns `None` if the session is already gone.
    pub fn remove(&self, id: &str) -> Option<Session> {
        let session = self.sessions.write().remove(id);
        if session.is_some() {
            debug!(session = %id, "Session removed");
        }
        session
    }

    /// Find the session that owns a connection handle.
    #[must_use]
    pub fn find_by_handle(&self, handle: HandleId) -> Option<SessionId> {
        self.sessions
            .read()
            .values()
            .find(|s| s.handle_id() == handle)
            .map(|s| s.id().clone())
    }

    /// Get a point-in-time copy of the online users, ordered by id.
    #[must_use]
    pub fn snapshot(&self) -> Vec<OnlineUser> {
        let mut users: Vec<OnlineUser> = self
            .sessions
            .read()
            .values()
            .map(|s| OnlineUser {
                nickname: s.nickname().to_string(),
                id: s.id().clone(),
            })
            .collect();
        users.sort_by(|a, b| a.id.cmp(&b.id));
        users
    }

    /// Queue a message on one session's connection.
    ///
    /// Returns `None` if the session is not online.
    pub fn send_to(&self, id: &str, message: Message) -> Option<Result<(), DeliveryError>> {
        self.sessions.read().get(id).map(|s| s.send(message))
    }

    /// Queue a message on every online session's connection.
    ///
    /// `build` produces the message for each recipient. A failed write
    /// does not stop the remaining ones.
    pub fn fan_out(&self, mut build: impl FnMut(&SessionId) -> Message) -> FanOut {
        let sessions = self.sessions.read();
        let mut report = FanOut::default();

        for session in sessions.values() {
            match session.send(build(session.id())) {
                Ok(()) => report.delivered += 1,
                Err(e) => report.failed.push((session.id().clone(), e)),
            }
        }

        report
    }

    /// Get the number of online sessions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    /// Check if no session is online.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{Outbound, SessionState};
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_register_lookup_remove() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel(4);
        let id = registry.register(handle);

        let info = registry.lookup(id.as_str()).unwrap();
        assert_eq!(info.state, SessionState::Connecting);
        assert!(info.nickname.is_empty());
        assert!(registry.contains(id.as_str()));

        assert!(registry.remove(id.as_str()).is_some());
        // Second removal finds nothing
        assert!(registry.remove(id.as_str()).is_none());
        assert!(registry.lookup(id.as_str()).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_register_with_greeting() {
        let registry = SessionRegistry::new();
        let (handle, mut rx) = ConnectionHandle::channel(4);
        let (id, sent) =
            registry.register_with_greeting(handle, |id| Message::registration(id.as_str()));

        assert!(sent.is_ok());
        assert_eq!(
            rx.try_recv().unwrap(),
            Outbound::Deliver(Message::registration(id.as_str()))
        );

        let (handle, rx) = ConnectionHandle::channel(4);
        drop(rx);
        let (id, sent) =
            registry.register_with_greeting(handle, |id| Message::registration(id.as_str()));
        assert_eq!(sent, Err(DeliveryError::Closed));
        assert!(registry.contains(id.as_str()));
    }

    #[test]
    fn test_set_nickname() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel(4);
        let id = registry.register(handle);

        let info = registry
            .set_nickname(id.as_str(), "alice", RegistrationPolicy::Overwrite)
            .unwrap();
        assert_eq!(info.state, SessionState::Registered);
        assert_eq!(info.nickname, "alice");

        assert!(matches!(
            registry.set_nickname("ghost", "bob", RegistrationPolicy::Overwrite),
            Err(RegistryError::UnknownSession(_))
        ));
    }

    #[test]
    fn test_registration_policy() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel(4);
        let id = registry.register(handle);

        registry
            .set_nickname(id.as_str(), "alice", RegistrationPolicy::Reject)
            .unwrap();
        assert_eq!(
            registry.set_nickname(id.as_str(), "mallory", RegistrationPolicy::Reject),
            Err(RegistryError::AlreadyRegistered)
        );
        assert_eq!(registry.lookup(id.as_str()).unwrap().nickname, "alice");

        registry
            .set_nickname(id.as_str(), "alicia", RegistrationPolicy::Overwrite)
            .unwrap();
        assert_eq!(registry.lookup(id.as_str()).unwrap().nickname, "alicia");
    }

    #[test]
    fn test_find_by_handle() {
        let registry = SessionRegistry::new();
        let (handle, _rx) = ConnectionHandle::channel(4);
        let handle_id = handle.id();
        let id = registry.register(handle);

        assert_eq!(registry.find_by_handle(handle_id), Some(id));
        assert_eq!(registry.find_by_handle(HandleId::next()), None);
    }

    #[test]
    fn test_snapshot_is_a_copy() {
        let registry = SessionRegistry::new();
        let (h1, _r1) = ConnectionHandle::channel(4);
        let (h2, _r2) = ConnectionHandle::channel(4);
        let a = registry.register(h1);
        let b = registry.register(h2);
        registry
            .set_nickname(a.as_str(), "alice", RegistrationPolicy::Overwrite)
            .unwrap();

        let snapshot = registry.snapshot();
        registry.remove(b.as_str());

        assert_eq!(snapshot.len(), 2);
        assert!(snapshot.windows(2).all(|w| w[0].id < w[1].id));
        assert!(snapshot
            .iter()
            .any(|u| u.id == a && u.nickname == "alice"));
        assert_eq!(registry.snapshot().len(), 1);
    }

    #[test]
    fn test_fan_out_continues_past_failures() {
        let registry = SessionRegistry::new();
        let (h1, mut r1) = ConnectionHandle::channel(4);
        let (h2, r2) = ConnectionHandle::channel(4);
        let (h3, mut r3) = ConnectionHandle::channel(4);
        registry.register(h1);
        let dead = registry.register(h2);
        registry.register(h3);
        drop(r2);

        let report = registry.fan_out(|to| Message::error(to.as_str(), "hello"));
        assert_eq!(report.attempted(), 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.failed, vec![(dead, DeliveryError::Closed)]);

        assert!(matches!(r1.try_recv(), Ok(Outbound::Deliver(_))));
        assert!(matches!(r3.try_recv(), Ok(Outbound::Deliver(_))));
    }

    #[test]
    fn test_send_to_unknown() {
        let registry = SessionRegistry::new();
        assert!(registry.send_to("ghost", Message::error("ghost", "x")).is_none());
    }

    #[test]
    fn test_concurrent_registrations_are_unique() {
        let registry = Arc::new(SessionRegistry::new());
        let mut receivers = Vec::new();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let (conns, rxs): (Vec<_>, Vec<_>) =
                    (0..100).map(|_| ConnectionHandle::channel(1)).unzip();
                receivers.extend(rxs);
                let registry = Arc::clone(&registry);
                std::thread::spawn(move || {
                    conns
                        .into_iter()
                        .map(|h| registry.register(h))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let ids: HashSet<SessionId> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();

        assert_eq!(ids.len(), 800);
        assert_eq!(registry.len(), 800);
    }
}
