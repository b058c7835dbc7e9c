//! # courier-core
//!
//! Session registry, message routing and broadcast for the Courier relay.
//!
//! This crate provides the stateful heart of the relay:
//!
//! - **Session** - One live connection and its outbound handle
//! - **Registry** - Who is online, guarded for concurrent access
//! - **Router** - Validation, dispatch and session lifecycle
//! - **Delivery** - Direct delivery and main room fan-out
//! - **Presence** - `newUser` / `goneUser` notices
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐  intake  ┌─────────────┐     ┌─────────────┐
//! │  Connection │─────────▶│   Router    │────▶│  Delivery   │
//! └─────────────┘          └─────────────┘     └─────────────┘
//!        ▲                        │                   │
//!        │ outbound               ▼                   │
//!        │                 ┌─────────────┐            │
//!        └─────────────────│  Registry   │◀───────────┘
//!                          └─────────────┘
//! ```
//!
//! Main room messages reach every online session, the sender included.

pub mod delivery;
pub mod presence;
pub mod registry;
pub mod router;
pub mod session;

pub use delivery::{Delivery, DeliveryFailure};
pub use presence::{Presence, PresenceKind};
pub use registry::{FanOut, RegistrationPolicy, RegistryError, SessionRegistry};
pub use router::{
    CloseReason, Inbound, IntakeReceiver, IntakeSender, Router, RouterConfig, RouterError,
};
pub use session::{
    ConnectionHandle, DeliveryError, HandleId, OnlineUser, Outbound, Session, SessionId,
    SessionInfo, SessionState,
};
