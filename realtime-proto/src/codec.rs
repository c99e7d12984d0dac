use bytes::Bytes;
use thiserror::Error;

use crate::protocol::ProtocolMessage;

/// Converts protocol messages to and from transport frames
///
/// The connection itself never touches frame bytes; the driver encodes outbound messages and
/// decodes inbound frames through an implementation of this trait.
pub trait Codec: Send + Sync {
    /// Serialize a message into a single frame
    fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes, CodecError>;
    /// Parse a single frame
    fn decode(&self, frame: &[u8]) -> Result<ProtocolMessage, CodecError>;
}

/// JSON text frames
#[derive(Debug, Copy, Clone, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, msg: &ProtocolMessage) -> Result<Bytes, CodecError> {
        serde_json::to_vec(msg)
            .map(Bytes::from)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    fn decode(&self, frame: &[u8]) -> Result<ProtocolMessage, CodecError> {
        serde_json::from_slice(frame).map_err(|e| CodecError::Decode(e.to_string()))
    }
}

/// A frame could not be converted
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CodecError {
    /// The message could not be serialized
    #[error("encoding failed: {0}")]
    Encode(String),
    /// The frame is not a valid protocol message
    #[error("malformed frame: {0}")]
    Decode(String),
}
