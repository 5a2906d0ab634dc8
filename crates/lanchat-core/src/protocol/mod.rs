//! Protocol module containing message types and the binary frame codec.

pub mod codec;
pub mod messages;

pub use codec::{
    decode_message, encode_control, encode_frame, encode_message, FrameDecoder, ProtocolError,
};
pub use messages::*;
