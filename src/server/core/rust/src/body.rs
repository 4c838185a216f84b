/* src/server/core/rust/src/body.rs */

use std::fmt;

use bytes::{Bytes, BytesMut};
use futures_util::{StreamExt, stream};

use crate::load::BoxStream;

/// Response body: buffered, or streamed when deferred data is pending.
pub enum Body {
  Full(Bytes),
  Stream(BoxStream<Bytes>),
}

impl Body {
  pub fn empty() -> Self {
    Self::Full(Bytes::new())
  }

  pub fn is_stream(&self) -> bool {
    matches!(self, Self::Stream(_))
  }

  /// Read the whole body, waiting for a stream to finish.
  pub async fn collect(self) -> Bytes {
    match self {
      Self::Full(bytes) => bytes,
      Self::Stream(mut stream) => {
        let mut buf = BytesMut::new();
        while let Some(chunk) = stream.next().await {
          buf.extend_from_slice(&chunk);
        }
        buf.freeze()
      }
    }
  }

  pub async fn text(self) -> String {
    String::from_utf8_lossy(&self.collect().await).into_owned()
  }

  pub fn into_stream(self) -> BoxStream<Bytes> {
    match self {
      Self::Full(bytes) => futures_util::stream::once(async move { bytes }).boxed(),
      Self::Stream(stream) => stream,
    }
  }

  /// Newline-delimited lines as they arrive, without the terminator. A
  /// trailing line without a newline is yielded at the end.
  pub fn into_lines(self) -> BoxStream<Bytes> {
    let state = (self.into_stream(), BytesMut::new(), false);
    stream::unfold(state, |(mut body, mut buf, mut eof)| async move {
      loop {
        if let Some(pos) = buf.iter().position(|b| *b == b'\n') {
          let line = buf.split_to(pos + 1).freeze().slice(..pos);
          return Some((line, (body, buf, eof)));
        }
        if eof {
          if buf.is_empty() {
            return None;
          }
          let line = buf.split().freeze();
          return Some((line, (body, buf, eof)));
        }
        match body.next().await {
          Some(chunk) => buf.extend_from_slice(&chunk),
          None => eof = true,
        }
      }
    })
    .boxed()
  }
}

impl Default for Body {
  fn default() -> Self {
    Self::empty()
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Self::Full(bytes) => f.debug_tuple("Full").field(&bytes.len()).finish(),
      Self::Stream(_) => f.write_str("Stream(..)"),
    }
  }
}

impl From<Bytes> for Body {
  fn from(bytes: Bytes) -> Self {
    Self::Full(bytes)
  }
}

impl From<String> for Body {
  fn from(text: String) -> Self {
    Self::Full(Bytes::from(text))
  }
}

impl From<&'static str> for Body {
  fn from(text: &'static str) -> Self {
    Self::Full(Bytes::from_static(text.as_bytes()))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn collects_stream_in_order() {
    let parts = vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")];
    let body = Body::Stream(futures_util::stream::iter(parts).boxed());
    assert!(body.is_stream());
    assert_eq!(body.text().await, "abc");
  }

  #[tokio::test]
  async fn lines_split_across_chunks() {
    let parts = ["{\"a\"", ":1}\n{\"b\":2}\n\n", "tail"].map(Bytes::from);
    let body = Body::Stream(futures_util::stream::iter(parts).boxed());
    let lines: Vec<Bytes> = body.into_lines().collect().await;
    let expected = ["{\"a\":1}", "{\"b\":2}", "", "tail"].map(Bytes::from);
    assert_eq!(lines, expected);
  }

  #[tokio::test]
  async fn full_body_round_trips_through_stream() {
    let stream = Body::from("hello").into_stream();
    assert_eq!(Body::Stream(stream).text().await, "hello");
  }
}
