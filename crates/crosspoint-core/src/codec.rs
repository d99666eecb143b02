//! Envelope wire codec
//!
//! Envelopes travel as compact JSON text. On stream transports every
//! envelope is terminated by a delimiter byte (see [`crate::framing`]);
//! JSON escapes control characters so the delimiter never appears inside a
//! body.

use bytes::{BufMut, Bytes, BytesMut};

use crate::{Envelope, Error, Result};

/// Encode an envelope body (no delimiter)
pub fn encode(envelope: &Envelope) -> Result<Bytes> {
    serde_json::to_vec(envelope)
        .map(Bytes::from)
        .map_err(|e| Error::EncodeError(e.to_string()))
}

/// Encode an envelope followed by the stream delimiter
pub fn encode_frame(envelope: &Envelope, delimiter: u8) -> Result<Bytes> {
    let body = serde_json::to_vec(envelope).map_err(|e| Error::EncodeError(e.to_string()))?;
    let mut buf = BytesMut::with_capacity(body.len() + 1);
    buf.extend_from_slice(&body);
    buf.put_u8(delimiter);
    Ok(buf.freeze())
}

/// Decode an envelope body (delimiter already stripped)
pub fn decode(bytes: &[u8]) -> Result<Envelope> {
    if bytes.is_empty() {
        return Err(Error::DecodeError("empty frame".to_string()));
    }
    serde_json::from_slice(bytes).map_err(|e| Error::DecodeError(e.to_string()))
}
