//! Payload codec seam.
//!
//! The publisher encodes payloads and the dispatch loops decode delivery
//! bodies through the same [`Codec`] trait, so both directions of a pipeline
//! always agree on the wire format. [`JsonCodec`] is the default.

use serde::{de::DeserializeOwned, Serialize};
use tracing_error::SpanTrace;

/// Serialize/deserialize seam for message payloads.
pub trait Codec: Clone + Send + Sync + 'static {
    /// Encode a payload into wire bytes.
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError>;

    /// Decode wire bytes into a payload.
    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError>;
}

/// JSON codec backed by `serde_json`.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode<T: Serialize>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        serde_json::to_vec(value).map_err(CodecError::encode)
    }

    fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        serde_json::from_slice(bytes).map_err(CodecError::decode)
    }
}

/// Error returned by codec operations.
///
/// Captures the underlying error and a tracing span backtrace for
/// diagnostics.
#[derive(Debug)]
pub struct CodecError {
    context: SpanTrace,
    kind: CodecErrorKind,
}

/// Codec error kind.
#[derive(Debug)]
pub enum CodecErrorKind {
    /// The payload could not be encoded.
    Encode(tower::BoxError),
    /// The delivery body could not be decoded.
    Decode(tower::BoxError),
}

impl CodecError {
    /// Create an encode-side codec error.
    pub fn encode(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Encode(err.into()),
        }
    }

    /// Create a decode-side codec error.
    pub fn decode(err: impl Into<tower::BoxError>) -> Self {
        Self {
            context: SpanTrace::capture(),
            kind: CodecErrorKind::Decode(err.into()),
        }
    }

    pub fn kind(&self) -> &CodecErrorKind {
        &self.kind
    }
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.kind {
            CodecErrorKind::Encode(err) => writeln!(f, "Encode error: {err}"),
            CodecErrorKind::Decode(err) => writeln!(f, "Decode error: {err}"),
        }?;
        self.context.fmt(f)
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match &self.kind {
            CodecErrorKind::Encode(err) => Some(err.as_ref()),
            CodecErrorKind::Decode(err) => Some(err.as_ref()),
        }
    }
}
