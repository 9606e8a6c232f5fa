// network/codec.rs - Frame payload encoding
//
//! Wire encodings for `AclMessage` frames.
//!
//! Framing is a plain 4-byte length prefix handled by `LengthDelimitedCodec`;
//! the payload inside each frame is selected by `WireFormat`.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio_util::codec::LengthDelimitedCodec;

use crate::acl_message::AclMessage;

/// Codec errors
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("JSON codec: {0}")]
    Json(#[from] serde_json::Error),

    #[error("bincode encoding failed: {0}")]
    BincodeEncode(#[from] bincode::error::EncodeError),

    #[error("bincode decoding failed: {0}")]
    BincodeDecode(#[from] bincode::error::DecodeError),
}

/// Payload encoding of a frame
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WireFormat {
    /// Self-describing, field-tagged JSON
    #[default]
    Json,
    /// Compact bincode (serde mode)
    Bincode,
}

impl WireFormat {
    pub fn encode(&self, message: &AclMessage) -> Result<Bytes, CodecError> {
        let payload = match self {
            WireFormat::Json => serde_json::to_vec(message)?,
            WireFormat::Bincode => {
                bincode::serde::encode_to_vec(message, bincode::config::standard())?
            }
        };
        Ok(Bytes::from(payload))
    }

    pub fn decode(&self, payload: &[u8]) -> Result<AclMessage, CodecError> {
        match self {
            WireFormat::Json => Ok(serde_json::from_slice(payload)?),
            WireFormat::Bincode => {
                let (message, _) =
                    bincode::serde::decode_from_slice(payload, bincode::config::standard())?;
                Ok(message)
            }
        }
    }
}

/// Length-delimited framing shared by the listener and the dialer
pub fn frame_codec(max_frame_bytes: usize) -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .length_field_length(4)
        .max_frame_length(max_frame_bytes)
        .new_codec()
}
