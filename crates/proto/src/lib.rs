//! # Meshstore Wire Protocol
//!
//! Everything that crosses a peer connection:
//! - `message`: the control-message union and its bincode encoding
//! - `decoder`: tag-dispatched frame reading off a live connection
//!
//! Per-connection framing:
//!
//! ```text
//! Frame ::= MessageFrame | StreamFrame
//! MessageFrame ::= 0x01 <up to 1028 bytes of encoded ControlMessage>
//! StreamFrame  ::= 0x02 <raw bytes, length carried out-of-band>
//! ```

pub mod decoder;
pub mod message;

pub use decoder::{BincodeDecoder, FrameDecoder, TagDecoder};
pub use message::{
    decode_message, encode_message, ControlMessage, Frame, WireError, INCOMING_MESSAGE,
    INCOMING_STREAM,
};
