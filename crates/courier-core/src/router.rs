//! Message router for Courier.
//!
//! The router validates each inbound message, picks its destination class
//! and hands it to delivery or to server-message handling. It also owns the
//! session lifecycle: connecting, registering and retiring sessions.
//!
//! Inbound messages reach the router through one bounded intake queue that a
//! single routing task drains, so messages from one sender are routed in the
//! order they were read.

use crate::delivery::{Delivery, DeliveryFailure};
use crate::presence::Presence;
use crate::registry::{RegistrationPolicy, RegistryError, SessionRegistry};
use crate::session::{ConnectionHandle, HandleId, OnlineUser, SessionId};
use courier_protocol::{Message, MessageType, ProtocolError};
use metrics::counter;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// Counter of messages taken off the intake queue.
pub const MESSAGES_ROUTED_TOTAL: &str = "courier_messages_routed_total";
/// Counter of rejected messages, labelled by error kind.
pub const ERRORS_TOTAL: &str = "courier_errors_total";
/// Counter of retired sessions, labelled by close reason.
pub const RETIREMENTS_TOTAL: &str = "courier_retirements_total";

/// Body of the error reply sent before dropping an unparseable frame.
pub const INVALID_FORMAT_BODY: &str = "invalid_message_format";

/// Router errors.
#[derive(Debug, Error)]
pub enum RouterError {
    /// The session named by the message does not exist.
    #[error("unknown session: {0}")]
    UnknownSession(SessionId),

    /// The destination is neither a reserved alias nor an online session.
    #[error("invalid to id: {0}")]
    InvalidToId(String),

    /// The sender identity is absent.
    #[error("missing from id")]
    MissingFromId,

    /// The destination is absent.
    #[error("missing to id")]
    MissingToId,

    /// The payload is empty.
    #[error("missing body")]
    MissingBody,

    /// A direct-delivery target went away after validation.
    #[error("unknown recipient: {0}")]
    UnknownRecipient(String),

    /// The payload is not a message.
    #[error("malformed frame: {0}")]
    MalformedFrame(#[from] ProtocolError),

    /// The connection closed unexpectedly.
    #[error("transport closed")]
    TransportClosed,

    /// Re-registration refused by policy.
    #[error("nickname already registered")]
    AlreadyRegistered,
}

impl RouterError {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            RouterError::UnknownSession(_) => "unknown_session",
            RouterError::InvalidToId(_) => "invalid_to_id",
            RouterError::MissingFromId => "missing_from_id",
            RouterError::MissingToId => "missing_to_id",
            RouterError::MissingBody => "missing_body",
            RouterError::UnknownRecipient(_) => "unknown_recipient",
            RouterError::MalformedFrame(_) => "malformed_frame",
            RouterError::TransportClosed => "transport_closed",
            RouterError::AlreadyRegistered => "already_registered",
        }
    }
}

impl From<RegistryError> for RouterError {
    fn from(e: RegistryError) -> Self {
        match e {
            RegistryError::UnknownSession(id) => RouterError::UnknownSession(id),
            RegistryError::AlreadyRegistered => RouterError::AlreadyRegistered,
        }
    }
}

impl From<DeliveryFailure> for RouterError {
    fn from(e: DeliveryFailure) -> Self {
        match e {
            DeliveryFailure::UnknownRecipient(id) => RouterError::UnknownRecipient(id),
        }
    }
}

/// Why a session was retired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// The identity announcement could not be sent.
    AnnounceFailed,
    /// The client's connection closed.
    TransportClosed,
    /// The client sent something that is not a message.
    MalformedFrame,
    /// The client sent a message without a sender identity.
    ProtocolViolation,
}

impl CloseReason {
    /// Stable label for logs and metrics.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::AnnounceFailed => "announce_failed",
            CloseReason::TransportClosed => "transport_closed",
            CloseReason::MalformedFrame => "malformed_frame",
            CloseReason::ProtocolViolation => "protocol_violation",
        }
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Capacity of the intake queue shared by all connections.
    pub intake_capacity: usize,
    /// Capacity of each session's outbound queue.
    pub outbound_capacity: usize,
    /// What a second registration does.
    pub registration_policy: RegistrationPolicy,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            intake_capacity: 1024,
            outbound_capacity: 256,
            registration_policy: RegistrationPolicy::Overwrite,
        }
    }
}

/// A message read from a connection, tagged with the handle it arrived on.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// The decoded message.
    pub message: Message,
    /// The connection it was read from.
    pub origin: HandleId,
}

/// Producer side of the intake queue.
pub type IntakeSender = mpsc::Sender<Inbound>;
/// Consumer side of the intake queue.
pub type IntakeReceiver = mpsc::Receiver<Inbound>;

/// The central message router.
pub struct Router {
    registry: Arc<SessionRegistry>,
    delivery: Delivery,
    presence: Presence,
    config: RouterConfig,
}

impl Router {
    /// Create a new router with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(RouterConfig::default())
    }

    /// Create a new router with custom configuration.
    #[must_use]
    pub fn with_config(config: RouterConfig) -> Self {
        info!("Creating router with config: {:?}", config);
        let registry = Arc::new(SessionRegistry::new());
        let delivery = Delivery::new(Arc::clone(&registry));
        Self {
            presence: Presence::new(delivery.clone()),
            delivery,
            registry,
            config,
        }
    }

    /// Get the session registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Create the bounded intake queue.
    #[must_use]
    pub fn intake(&self) -> (IntakeSender, IntakeReceiver) {
        mpsc::channel(self.config.intake_capacity.max(1))
    }

    /// Create a connection handle sized by the configuration.
    #[must_use]
    pub fn handle(&self) -> (ConnectionHandle, mpsc::Receiver<crate::session::Outbound>) {
        ConnectionHandle::channel(self.config.outbound_capacity)
    }

    /// Get the online users.
    #[must_use]
    pub fn online_users(&self) -> Vec<OnlineUser> {
        self.registry.snapshot()
    }

    /// Admit a new connection.
    ///
    /// Registers a session and announces its id to the client. If the
    /// announcement cannot be queued the session is retired on the spot.
    ///
    /// # Errors
    ///
    /// Returns `TransportClosed` if the announcement failed.
    pub fn connect(&self, handle: ConnectionHandle) -> Result<SessionId, RouterError> {
        let (id, announced) = self
            .registry
            .register_with_greeting(handle, |id| Message::registration(id.as_str()));

        match announced {
            Ok(()) => {
                debug!(session = %id, "Identity announced");
                Ok(id)
            }
            Err(e) => {
                warn!(session = %id, error = %e, "Sending identity announcement failed");
                self.retire(id.as_str(), CloseReason::AnnounceFailed);
                Err(RouterError::TransportClosed)
            }
        }
    }

    /// Retire a session: remove it, close its connection and announce the
    /// departure.
    ///
    /// Returns `false`, doing nothing, if the session was already retired.
    pub fn retire(&self, id: &str, reason: CloseReason) -> bool {
        let Some(session) = self.registry.remove(id) else {
            trace!(session = %id, reason = %reason, "Session already retired");
            return false;
        };

        let info = session.close();
        counter!(RETIREMENTS_TOTAL, "reason" => reason.as_str()).increment(1);
        debug!(
            session = %info.id,
            nickname = %info.nickname,
            reason = %reason,
            "Session retired"
        );

        self.presence.left(&info.id);
        true
    }

    /// Handle a frame from `id` that could not be decoded.
    ///
    /// The client gets one error reply, then the session is retired.
    pub fn reject_malformed(&self, id: &str, error: &ProtocolError) {
        warn!(session = %id, error = %error, "Unmarshalling message failed");
        counter!(ERRORS_TOTAL, "kind" => "malformed_frame").increment(1);
        self.delivery.reply_error(id, INVALID_FORMAT_BODY);
        self.retire(id, CloseReason::MalformedFrame);
    }

    /// Validate a message. The first failing rule wins.
    ///
    /// # Errors
    ///
    /// Returns the validation failure.
    pub fn validate(&self, message: &Message) -> Result<(), RouterError> {
        if message.from_id.is_empty() {
            return Err(RouterError::MissingFromId);
        }

        if message.to_id.is_empty() {
            return Err(RouterError::MissingToId);
        }

        if !SessionId::is_reserved(&message.to_id) && !self.registry.contains(&message.to_id) {
            return Err(RouterError::InvalidToId(message.to_id.clone()));
        }

        if message.body.is_empty() {
            return Err(RouterError::MissingBody);
        }

        Ok(())
    }

    /// Route one inbound message.
    ///
    /// The dispatch rules are independent: a message that matches more than
    /// one of them triggers each.
    pub fn route(&self, inbound: Inbound) {
        let Inbound { message, origin } = inbound;
        counter!(MESSAGES_ROUTED_TOTAL).increment(1);

        if let Err(e) = self.validate(&message) {
            if matches!(e, RouterError::MissingFromId) {
                self.drop_unidentified(origin);
            } else {
                warn!(from = %message.from_id, error = %e, "Invalid message received");
                self.reject(&message.from_id, &e);
            }
            return;
        }

        if message.is_for_server() {
            if let Err(e) = self.handle_server_message(&message) {
                warn!(from = %message.from_id, error = %e, "Handling server message failed");
                self.reject(&message.from_id, &e);
                return;
            }
        }

        if message.is_for_main_room() {
            self.delivery.broadcast_main_room(&message);
        }

        if message.message_type == MessageType::Request {
            let from = message.from_id.clone();
            if let Err(e) = self.delivery.deliver_direct(message) {
                let e = RouterError::from(e);
                warn!(from = %from, error = %e, "Sending request message failed");
                counter!(ERRORS_TOTAL, "kind" => e.kind()).increment(1);
            }
        }
    }

    /// Handle a message addressed to the server.
    ///
    /// Only `registration` does anything; other types are accepted and
    /// ignored.
    ///
    /// # Errors
    ///
    /// Returns `UnknownSession` if the sender is not online, or
    /// `AlreadyRegistered` if the policy refuses a second registration.
    pub fn handle_server_message(&self, message: &Message) -> Result<(), RouterError> {
        match message.message_type {
            MessageType::Registration => {
                let info = self.registry.set_nickname(
                    &message.from_id,
                    message.body.clone(),
                    self.config.registration_policy,
                )?;
                info!(session = %info.id, nickname = %info.nickname, "Registration message");
                self.presence.joined(&info.id);
                Ok(())
            }
            ref other => {
                trace!(from = %message.from_id, message_type = %other, "Ignoring server message");
                Ok(())
            }
        }
    }

    /// Drain the intake queue until every sender is gone.
    pub async fn run(&self, mut intake: IntakeReceiver) {
        info!("Routing task started");
        while let Some(inbound) = intake.recv().await {
            self.route(inbound);
        }
        info!("Routing task stopped");
    }

    fn reject(&self, to: &str, error: &RouterError) {
        counter!(ERRORS_TOTAL, "kind" => error.kind()).increment(1);
        self.delivery.reply_error(to, error.to_string());
    }

    fn drop_unidentified(&self, origin: HandleId) {
        warn!(handle = %origin, "Missing client id in message");
        counter!(ERRORS_TOTAL, "kind" => "missing_from_id").increment(1);

        match self.registry.find_by_handle(origin) {
            Some(id) => {
                self.retire(id.as_str(), CloseReason::ProtocolViolation);
            }
            None => warn!(handle = %origin, "Could not find client id"),
        }
    }
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}
