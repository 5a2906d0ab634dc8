//! # lanchat-core
//!
//! Shared library for LanChat containing the wire framing codec and the
//! passcode-derived key material used to authenticate peers.
//!
//! It has zero dependencies on OS APIs, async runtimes, or network sockets;
//! the `lanchat-peer` crate wires it to real streams.
//!
//! - **`protocol`** – How messages travel over a byte stream.  Each message is
//!   an 8-byte header (`kind`, `length`, both big-endian `u32`) followed by the
//!   payload.  [`FrameDecoder`] reassembles messages from arbitrarily split
//!   stream chunks.
//!
//! - **`crypto`** – Turns a typed passcode into the pre-shared key and the
//!   verification token consumed by the transport handshake.

pub mod crypto;
pub mod protocol;

pub use crypto::{derive, SecretDeriver, SharedSecretMaterial};
pub use protocol::codec::{decode_message, encode_message, FrameDecoder, ProtocolError};
pub use protocol::messages::{Message, MessageKind};
