//! Response bodies, including chunked streams.

use futures::Stream;
use serde_json::Value;
use std::fmt;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::mpsc;

use crate::types::{Error, Result};

/// Response payload.
#[derive(Default)]
pub enum Body {
    #[default]
    Empty,
    Json(Value),
    Stream(BodyStream),
}

impl Body {
    pub fn is_empty(&self) -> bool {
        matches!(self, Body::Empty)
    }

    pub fn is_stream(&self) -> bool {
        matches!(self, Body::Stream(_))
    }

    /// JSON payload, if any.
    pub fn as_json(&self) -> Option<&Value> {
        match self {
            Body::Json(v) => Some(v),
            _ => None,
        }
    }

    /// Consume into a JSON value; empty bodies become `null`.
    pub fn into_json(self) -> Option<Value> {
        match self {
            Body::Empty => Some(Value::Null),
            Body::Json(v) => Some(v),
            Body::Stream(_) => None,
        }
    }

    pub fn into_stream(self) -> Option<BodyStream> {
        match self {
            Body::Stream(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Debug for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Empty => f.write_str("Empty"),
            Body::Json(v) => f.debug_tuple("Json").field(v).finish(),
            Body::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

impl From<Value> for Body {
    fn from(v: Value) -> Self {
        Body::Json(v)
    }
}

impl From<&str> for Body {
    fn from(s: &str) -> Self {
        Body::Json(Value::String(s.to_string()))
    }
}

impl From<String> for Body {
    fn from(s: String) -> Self {
        Body::Json(Value::String(s))
    }
}

impl From<()> for Body {
    fn from(_: ()) -> Self {
        Body::Empty
    }
}

impl From<BodyStream> for Body {
    fn from(s: BodyStream) -> Self {
        Body::Stream(s)
    }
}

/// Receiving half of a chunked response.
///
/// Yields chunks in the order they were pushed, then ends when the sender is
/// dropped. A failed stream yields one `Err` and then ends.
#[derive(Debug)]
pub struct BodyStream {
    rx: mpsc::UnboundedReceiver<Result<Value>>,
}

impl BodyStream {
    /// Create a connected sender/stream pair.
    pub fn channel() -> (StreamSender, BodyStream) {
        let (tx, rx) = mpsc::unbounded_channel();
        (StreamSender { tx }, BodyStream { rx })
    }

    /// Next chunk, `None` once the stream has ended.
    pub async fn next_chunk(&mut self) -> Option<Result<Value>> {
        self.rx.recv().await
    }

    /// Drain every chunk, stopping at the first error.
    pub async fn collect_values(mut self) -> Result<Vec<Value>> {
        let mut values = Vec::new();
        while let Some(chunk) = self.rx.recv().await {
            values.push(chunk?);
        }
        Ok(values)
    }
}

impl Stream for BodyStream {
    type Item = Result<Value>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Producing half of a chunked response.
#[derive(Debug, Clone)]
pub struct StreamSender {
    tx: mpsc::UnboundedSender<Result<Value>>,
}

impl StreamSender {
    /// Push one chunk. Fails once the consumer is gone.
    pub fn send(&self, chunk: Value) -> Result<()> {
        self.tx
            .send(Ok(chunk))
            .map_err(|_| Error::closed("stream consumer dropped"))
    }

    /// Terminate the stream with an error.
    pub fn fail(self, error: Error) {
        let _ = self.tx.send(Err(error));
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_stream_yields_in_order_then_ends() {
        let (tx, stream) = BodyStream::channel();
        tx.send(json!(1)).unwrap();
        tx.send(json!(2)).unwrap();
        drop(tx);
        assert_eq!(stream.collect_values().await.unwrap(), vec![json!(1), json!(2)]);
    }

    #[tokio::test]
    async fn test_stream_error_surfaces() {
        let (tx, stream) = BodyStream::channel();
        tx.send(json!("a")).unwrap();
        tx.fail(Error::handler("boom"));
        let err = stream.collect_values().await.unwrap_err();
        assert!(err.to_string().contains("boom"));
    }

    #[test]
    fn test_send_after_consumer_dropped() {
        let (tx, stream) = BodyStream::channel();
        drop(stream);
        assert!(tx.is_closed());
        assert!(matches!(tx.send(json!(1)), Err(Error::Closed(_))));
    }

    #[test]
    fn test_body_conversions() {
        assert_eq!(Body::from("world").as_json(), Some(&json!("world")));
        assert!(Body::from(()).is_empty());
        assert_eq!(Body::Empty.into_json(), Some(serde_json::Value::Null));
    }
}
