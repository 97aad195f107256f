//! Control messages and their wire encoding.
//!
//! The encoding is bincode over a serde enum: the variant tag travels with
//! the payload, so the receiving side resolves the concrete variant from the
//! bytes alone. Declaring a variant here is what registers it with the codec;
//! both sides must agree on the declaration order.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Tag byte announcing an encoded [`ControlMessage`] follows.
pub const INCOMING_MESSAGE: u8 = 0x1;

/// Tag byte announcing a raw byte stream follows; the read loop parks and
/// the application reads the connection directly.
pub const INCOMING_STREAM: u8 = 0x2;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("decode failed: {0}")]
    Decode(String),
}

/// Control traffic between peers. Bulk bytes never travel inside a message;
/// they follow as a separate stream frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlMessage {
    /// Sender will immediately stream `size` bytes (IV included) to be
    /// persisted under `key_hash` in `origin`'s namespace.
    StoreFile {
        origin: String,
        key_hash: String,
        size: i64,
    },
    /// Sender wants the blob stored under `key_hash` in `origin`'s
    /// namespace streamed back, if the receiver holds it.
    GetFile { origin: String, key_hash: String },
}

/// One unit of inbound traffic, stamped with the sender's remote address by
/// the transport. Either `payload` carries an encoded [`ControlMessage`], or
/// `stream` is set and the bytes follow out-of-band on the connection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    pub from: String,
    pub payload: Vec<u8>,
    pub stream: bool,
}

/// Encode a control message for the wire.
pub fn encode_message(msg: &ControlMessage) -> Vec<u8> {
    bincode::serialize(msg).unwrap_or_else(|_| Vec::new())
}

/// Decode a control message off the wire.
pub fn decode_message(bytes: &[u8]) -> Result<ControlMessage, WireError> {
    if bytes.is_empty() {
        return Err(WireError::Decode("empty input".to_string()));
    }
    bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    fn arb_message() -> impl Strategy<Value = ControlMessage> {
        let store = ("[a-f0-9]{64}", "[a-f0-9]{32}", any::<i64>()).prop_map(
            |(origin, key_hash, size)| ControlMessage::StoreFile {
                origin,
                key_hash,
                size,
            },
        );
        let get = ("[a-f0-9]{64}", "[a-f0-9]{32}")
            .prop_map(|(origin, key_hash)| ControlMessage::GetFile { origin, key_hash });
        prop_oneof![store, get]
    }

    proptest! {
        #[test]
        fn proptest_roundtrip(msg in arb_message()) {
            let decoded = decode_message(&encode_message(&msg)).expect("decode");
            prop_assert_eq!(msg, decoded);
        }

        #[test]
        fn proptest_encode_deterministic(msg in arb_message()) {
            prop_assert_eq!(encode_message(&msg), encode_message(&msg));
        }
    }
}
