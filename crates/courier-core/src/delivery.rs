//! Broadcast and direct delivery.
//!
//! Delivery is best effort. Every write goes to a per-session queue, so a
//! slow recipient only ever loses its own messages. Failures are logged and
//! counted, never returned to the sender.

use crate::registry::{FanOut, SessionRegistry};
use crate::session::SessionId;
use courier_protocol::{Message, MessageType};
use metrics::counter;
use std::sync::Arc;
use thiserror::Error;
use tracing::{trace, warn};

/// Counter of per-recipient write failures.
pub const DELIVERY_FAILURES_TOTAL: &str = "courier_delivery_failures_total";

/// Direct delivery errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The recipient disconnected between validation and delivery.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),
}

/// Writes messages to sessions through the registry.
#[derive(Debug, Clone)]
pub struct Delivery {
    registry: Arc<SessionRegistry>,
}

impl Delivery {
    /// Create a delivery service over a registry.
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Deliver a message, unchanged, to the session named by its `toID`.
    ///
    /// A write failure is logged; cleaning up a dead recipient is left to
    /// that recipient's own read loop.
    ///
    /// # Errors
    ///
    /// Returns `UnknownRecipient` if the recipient is no longer online.
    pub fn deliver_direct(&self, message: Message) -> Result<(), DeliveryFailure> {
        let to = message.to_id.clone();
        match self.registry.send_to(&to, message) {
            None => Err(DeliveryFailure::UnknownRecipient(to)),
            Some(Ok(())) => {
                trace!(to = %to, "Delivered direct message");
                Ok(())
            }
            Some(Err(e)) => {
                record_failure(&to, "direct", &e);
                Ok(())
            }
        }
    }

    /// Deliver a message to every online session, sender included.
    ///
    /// The copy is re-addressed to the main room and typed `message`.
    pub fn broadcast_main_room(&self, message: &Message) -> FanOut {
        let outgoing = Message::main_room(message.from_id.clone(), message.body.clone());
        let report = self.registry.fan_out(|_| outgoing.clone());
        self.report("main_room", &report);
        report
    }

    /// Tell every online session about `subject` arriving or leaving.
    pub fn broadcast_presence(&self, kind: MessageType, subject: &SessionId) -> FanOut {
        let path = match kind {
            MessageType::NewUser => "new_user",
            MessageType::GoneUser => "gone_user",
            _ => "presence",
        };
        let report = self
            .registry
            .fan_out(|to| Message::presence(kind.clone(), to.as_str(), subject.as_str()));
        self.report(path, &report);
        report
    }

    /// Send an `error` reply from the server.
    ///
    /// Returns `false` if the reply could not be queued.
    pub fn reply_error(&self, to: &str, body: impl Into<String>) -> bool {
        match self.registry.send_to(to, Message::error(to, body)) {
            Some(Ok(())) => true,
            Some(Err(e)) => {
                record_failure(to, "error_reply", &e);
                false
            }
            None => {
                warn!(to = %to, "Error reply to unknown session dropped");
                counter!(DELIVERY_FAILURES_TOTAL, "path" => "error_reply").increment(1);
                false
            }
        }
    }

    fn report(&self, path: &'static str, report: &FanOut) {
        trace!(
            path = path,
            delivered = report.delivered,
            failed = report.failed.len(),
            "Fan-out complete"
        );
        for (id, e) in &report.failed {
            record_failure(id.as_str(), path, e);
        }
    }
}

fn record_failure(to: &str, path: &'static str, error: &dyn std::error::Error) {
    warn!(to = %to, path = path, error = %error, "Delivery failed");
    counter!(DELIVERY_FAILURES_TOTAL, "path" => path).increment(1);
}
