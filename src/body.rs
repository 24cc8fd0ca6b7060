//! Request and response payloads.
//!
//! A request [`Body`] is empty, fully buffered, or a lazily-produced
//! stream with an optional declared size. The connection pulls from a
//! streaming body chunk by chunk and stops pulling while the socket is not
//! writable, which is all the backpressure this layer needs.
//!
//! A [`ResponseBody`] is the receiving half of a bounded channel fed by
//! the connection driver as payload chunks are parsed; dropping it simply
//! stops the flow.

use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt as _;

use crate::error::Error;

pub(crate) type BoxByteStream =
    Pin<Box<dyn Stream<Item = Result<Bytes, io::Error>> + Send + 'static>>;

/// The payload of an outgoing request.
pub enum Body {
    /// No payload.
    Empty,
    /// A fully buffered payload.
    Full(Bytes),
    /// A lazily-produced payload stream.
    Streaming {
        /// Declared size, if known. `None` selects chunked framing.
        len: Option<u64>,
        /// The chunk source. Reading may suspend.
        stream: BoxByteStream,
    },
}

impl Body {
    /// A body from a byte buffer.
    pub fn full(bytes: impl Into<Bytes>) -> Self {
        Body::Full(bytes.into())
    }

    /// A body from a chunk stream with an optionally declared size.
    pub fn streaming<S>(len: Option<u64>, stream: S) -> Self
    where
        S: Stream<Item = Result<Bytes, io::Error>> + Send + 'static,
    {
        Body::Streaming {
            len,
            stream: Box::pin(stream),
        }
    }

    /// Declared payload size, if known.
    pub fn len(&self) -> Option<u64> {
        match self {
            Body::Empty => Some(0),
            Body::Full(bytes) => Some(bytes.len() as u64),
            Body::Streaming { len, .. } => *len,
        }
    }

    /// Whether the body is known to be empty.
    pub fn is_empty(&self) -> bool {
        matches!(self.len(), Some(0))
    }

    /// Whether sending this body uses chunked framing.
    pub(crate) fn is_chunked(&self) -> bool {
        matches!(self, Body::Streaming { len: None, .. })
    }
}

impl Default for Body {
    fn default() -> Self {
        Body::Empty
    }
}

impl From<Bytes> for Body {
    fn from(bytes: Bytes) -> Self {
        Body::full(bytes)
    }
}

impl From<&'static str> for Body {
    fn from(text: &'static str) -> Self {
        Body::full(Bytes::from_static(text.as_bytes()))
    }
}

impl From<Vec<u8>> for Body {
    fn from(bytes: Vec<u8>) -> Self {
        Body::full(bytes)
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.debug_tuple("Empty").finish(),
            Body::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
            Body::Streaming { len, .. } => f.debug_struct("Streaming").field("len", len).finish(),
        }
    }
}

impl Body {
    /// Pull the next chunk of a streaming body. `None` means the stream is
    /// exhausted. Buffered bodies are handed out whole on the first call.
    pub(crate) async fn next_chunk(&mut self) -> Option<Result<Bytes, io::Error>> {
        match self {
            Body::Empty => None,
            Body::Full(bytes) => {
                if bytes.is_empty() {
                    None
                } else {
                    Some(Ok(std::mem::take(bytes)))
                }
            }
            Body::Streaming { stream, .. } => stream.next().await,
        }
    }
}

/// The payload of a received response, streamed as it is parsed.
pub struct ResponseBody {
    rx: tokio::sync::mpsc::Receiver<Result<Bytes, Error>>,
}

impl ResponseBody {
    pub(crate) fn channel(
        capacity: usize,
    ) -> (tokio::sync::mpsc::Sender<Result<Bytes, Error>>, Self) {
        let (tx, rx) = tokio::sync::mpsc::channel(capacity);
        (tx, Self { rx })
    }

    /// Receive the next payload chunk. `None` means the payload is
    /// complete.
    pub async fn chunk(&mut self) -> Option<Result<Bytes, Error>> {
        self.rx.recv().await
    }

    /// Collect the whole payload into one buffer.
    pub async fn bytes(mut self) -> Result<Bytes, Error> {
        let mut buf = BytesMut::new();
        while let Some(chunk) = self.chunk().await {
            buf.extend_from_slice(&chunk?);
        }
        Ok(buf.freeze())
    }
}

impl Stream for ResponseBody {
    type Item = Result<Bytes, Error>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl fmt::Debug for ResponseBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseBody").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_lengths() {
        assert_eq!(Body::Empty.len(), Some(0));
        assert!(Body::Empty.is_empty());

        let body = Body::full("hello");
        assert_eq!(body.len(), Some(5));
        assert!(!body.is_chunked());

        let body = Body::streaming(None, futures_util::stream::empty());
        assert_eq!(body.len(), None);
        assert!(body.is_chunked());

        let body = Body::streaming(Some(7), futures_util::stream::empty());
        assert_eq!(body.len(), Some(7));
        assert!(!body.is_chunked());
    }

    #[tokio::test]
    async fn full_body_hands_out_one_chunk() {
        let mut body = Body::full("hello");
        let chunk = body.next_chunk().await.unwrap().unwrap();
        assert_eq!(&chunk[..], b"hello");
        assert!(body.next_chunk().await.is_none());
    }

    #[tokio::test]
    async fn response_body_collects() {
        let (tx, body) = ResponseBody::channel(4);
        tx.send(Ok(Bytes::from_static(b"he"))).await.unwrap();
        tx.send(Ok(Bytes::from_static(b"llo"))).await.unwrap();
        drop(tx);

        assert_eq!(&body.bytes().await.unwrap()[..], b"hello");
    }

    #[tokio::test]
    async fn response_body_surfaces_errors() {
        let (tx, body) = ResponseBody::channel(4);
        tx.send(Err(Error::Aborted)).await.unwrap();
        drop(tx);

        assert!(matches!(body.bytes().await, Err(Error::Aborted)));
    }
}
