//! Protocol-level error types.

use thiserror::Error;

/// Errors that can occur while encoding requests or decoding responses.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// The request could not be serialized.
    #[error("failed to encode request: {0}")]
    Encode(#[source] serde_json::Error),

    /// The response did not match the expected shape.
    #[error("failed to decode {kind} response: {source}")]
    Decode {
        /// Name of the expected response type.
        kind: &'static str,
        /// Underlying JSON error.
        #[source]
        source: serde_json::Error,
    },

    /// An inbound message was not a JSON object.
    #[error("message is not a JSON object")]
    NotAnObject,

    /// An inbound message had no string `id` field.
    #[error("message has no correlation id")]
    MissingId,
}
