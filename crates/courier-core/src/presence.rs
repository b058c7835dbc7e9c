//! Presence notices.
//!
//! Every online session hears about each registration (`newUser`) and each
//! retirement (`goneUser`). The subject's id travels in the body.

use crate::delivery::Delivery;
use crate::registry::FanOut;
use crate::session::SessionId;
use courier_protocol::MessageType;
use tracing::debug;

/// Presence notice kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceKind {
    /// A session registered a nickname.
    Joined,
    /// A session left.
    Left,
}

impl From<PresenceKind> for MessageType {
    fn from(kind: PresenceKind) -> Self {
        match kind {
            PresenceKind::Joined => MessageType::NewUser,
            PresenceKind::Left => MessageType::GoneUser,
        }
    }
}

/// Produces presence notices.
#[derive(Debug, Clone)]
pub struct Presence {
    delivery: Delivery,
}

impl Presence {
    /// Create a notifier.
    #[must_use]
    pub fn new(delivery: Delivery) -> Self {
        Self { delivery }
    }

    /// Announce a notice about `subject` to everyone online.
    pub fn announce(&self, kind: PresenceKind, subject: &SessionId) -> FanOut {
        let report = self.delivery.broadcast_presence(kind.into(), subject);
        debug!(
            subject = %subject,
            kind = ?kind,
            recipients = report.delivered,
            "Presence announced"
        );
        report
    }

    /// Announce that `subject` registered.
    pub fn joined(&self, subject: &SessionId) -> FanOut {
        self.announce(PresenceKind::Joined, subject)
    }

    /// Announce that `subject` left.
    pub fn left(&self, subject: &SessionId) -> FanOut {
        self.announce(PresenceKind::Left, subject)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::SessionRegistry;
    use crate::session::{ConnectionHandle, Outbound};
    use courier_protocol::Message;
    use std::sync::Arc;

    #[test]
    fn test_left_skips_departed_session() {
        let registry = Arc::new(SessionRegistry::new());
        let (ha, _ra) = ConnectionHandle::channel(4);
        let (hb, mut rb) = ConnectionHandle::channel(4);
        let a = registry.register(ha);
        let b = registry.register(hb);
        let presence = Presence::new(Delivery::new(Arc::clone(&registry)));

        registry.remove(a.as_str());
        let report = presence.left(&a);

        assert_eq!(report.delivered, 1);
        assert_eq!(
            rb.try_recv().unwrap(),
            Outbound::Deliver(Message::presence(
                MessageType::GoneUser,
                b.as_str(),
                a.as_str()
            ))
        );
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(MessageType::from(PresenceKind::Joined), MessageType::NewUser);
        assert_eq!(MessageType::from(PresenceKind::Left), MessageType::GoneUser);
    }
}
