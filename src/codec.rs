//! Opaque HTTP message seam.
//!
//! This crate never touches the wire grammar. A connection serializes
//! request heads and payload chunks through an [`HttpCodec`] and consumes
//! the parser's structured output (status, headers, payload chunks, the
//! connection-close indicator and the `100 Continue` interim) as
//! [`DecodeEvent`]s. Production users plug in their parser via
//! [`CodecFactory`]; the `mocks` feature ships a line-oriented codec for
//! driving the state machine in tests.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use http::{HeaderMap, Method, StatusCode, Version};
use thiserror::Error;

/// The request line and headers a connection asks the codec to serialize.
#[derive(Debug, Clone)]
pub struct RequestHead {
    /// Request method.
    pub method: Method,
    /// Request target (origin form, or authority form for CONNECT).
    pub target: String,
    /// The authority the request is addressed to.
    pub authority: String,
    /// Headers, including any the connection layer added (`Host`).
    pub headers: HeaderMap,
    /// Declared payload size; `None` with a payload means chunked framing.
    pub payload_len: Option<u64>,
    /// Whether the payload uses chunked transfer framing.
    pub chunked: bool,
    /// Whether the head carries `Expect: 100-continue`.
    pub expect_continue: bool,
}

/// The parsed response head handed up by the codec.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    /// Response status.
    pub status: StatusCode,
    /// Protocol version of the response.
    pub version: Version,
    /// Response headers.
    pub headers: HeaderMap,
    /// Whether the peer indicated the connection must close after this
    /// response (`Connection: close`, or pre-1.1 without keep-alive).
    pub close: bool,
}

impl ResponseHead {
    /// The `Location` header, when present and readable.
    pub fn location(&self) -> Option<&str> {
        self.headers
            .get(http::header::LOCATION)
            .and_then(|value| value.to_str().ok())
    }

    /// A `Retry-After` hint in seconds form, when present.
    pub fn retry_after(&self) -> Option<Duration> {
        self.headers
            .get(http::header::RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }
}

/// One structured result from feeding received bytes to the parser.
#[derive(Debug)]
pub enum DecodeEvent {
    /// An interim `100 Continue`.
    Continue,
    /// A final (or other non-100 informational) response head.
    Head(ResponseHead),
    /// A chunk of the current response payload.
    Body(Bytes),
    /// The current response payload is complete.
    End,
}

/// A wire-grammar violation reported by the codec.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct CodecError(pub Arc<str>);

impl CodecError {
    /// Create a codec error from a message.
    pub fn new(message: impl fmt::Display) -> Self {
        Self(message.to_string().into())
    }
}

/// The request writer / response parser pair for one connection.
///
/// Encoding appends to the connection's write buffer; decoding consumes
/// from its read buffer, returning `None` when more bytes are needed.
/// Implementations are stateful: body framing is the codec's business.
pub trait HttpCodec: Send + 'static {
    /// Serialize a request head.
    fn encode_head(&mut self, head: &RequestHead, dst: &mut BytesMut);

    /// Serialize one payload chunk.
    fn encode_body_chunk(&mut self, chunk: &[u8], chunked: bool, dst: &mut BytesMut);

    /// Terminate the payload (the zero chunk, for chunked framing).
    fn encode_body_end(&mut self, chunked: bool, dst: &mut BytesMut);

    /// Consume buffered response bytes, producing the next event if a full
    /// one is available.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<DecodeEvent>, CodecError>;
}

/// Produces one codec per connection.
pub trait CodecFactory: Send + Sync + 'static {
    /// Create a codec for a new connection.
    fn codec(&self) -> Box<dyn HttpCodec>;
}

impl fmt::Debug for dyn CodecFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("dyn CodecFactory")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn head_with(name: http::header::HeaderName, value: &str) -> ResponseHead {
        let mut headers = HeaderMap::new();
        headers.insert(name, value.parse().unwrap());
        ResponseHead {
            status: StatusCode::OK,
            version: Version::HTTP_11,
            headers,
            close: false,
        }
    }

    #[test]
    fn location_header() {
        let head = head_with(http::header::LOCATION, "http://example.com/next");
        assert_eq!(head.location(), Some("http://example.com/next"));
    }

    #[test]
    fn retry_after_seconds() {
        let head = head_with(http::header::RETRY_AFTER, "3");
        assert_eq!(head.retry_after(), Some(Duration::from_secs(3)));

        // HTTP-date form is not interpreted here.
        let head = head_with(http::header::RETRY_AFTER, "Fri, 31 Dec 1999 23:59:59 GMT");
        assert_eq!(head.retry_after(), None);
    }
}
