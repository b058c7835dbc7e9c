//! # courier-protocol
//!
//! Wire protocol definitions for the Courier message relay.
//!
//! Every frame exchanged over a Courier connection is a single JSON object:
//!
//! ```text
//! { "fromID": string, "toID": string, "messageType": string, "body": string }
//! ```
//!
//! ## Reserved identities
//!
//! - `mainRoom` - broadcast to every connected session
//! - `server` - control messages handled by the relay itself
//!
//! ## Example
//!
//! ```rust
//! use courier_protocol::{codec, Message, MessageType};
//!
//! let msg = Message::main_room("abc", "hi");
//! let encoded = codec::encode(&msg).unwrap();
//! let decoded = codec::decode(encoded.as_bytes()).unwrap();
//! assert_eq!(decoded.message_type, MessageType::Message);
//! ```

pub mod codec;
pub mod message;

pub use codec::{decode, decode_with_limit, encode, ProtocolError};
pub use message::{Message, MessageType, MAIN_ROOM_ID, SERVER_ID};
