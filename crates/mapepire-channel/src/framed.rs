//! JSON object stream over WebSocket messages.

use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use futures_core::Stream;
use pin_project_lite::pin_project;
use serde_json::Value;
use tokio_tungstenite::tungstenite::{self, Message};

use crate::error::ChannelError;

pin_project! {
    /// Adapts a stream of WebSocket messages into a stream of JSON objects.
    ///
    /// Control frames are skipped. Text frames that are not a single JSON
    /// object are logged and dropped without ending the stream. A close
    /// frame ends the stream.
    pub struct JsonFrames<S> {
        #[pin]
        inner: S,
        trace: Arc<AtomicBool>,
        finished: bool,
    }
}

impl<S> JsonFrames<S> {
    /// Wrap a message stream.
    pub fn new(inner: S) -> Self {
        Self::with_trace(inner, Arc::new(AtomicBool::new(false)))
    }

    /// Wrap a message stream, logging every raw frame while `trace` is set.
    pub fn with_trace(inner: S, trace: Arc<AtomicBool>) -> Self {
        Self {
            inner,
            trace,
            finished: false,
        }
    }

    /// Get a reference to the underlying stream.
    pub fn get_ref(&self) -> &S {
        &self.inner
    }
}

/// Decode one text frame, returning `None` for frames that must be dropped.
fn decode_text(text: &str) -> Option<Value> {
    match serde_json::from_str::<Value>(text) {
        Ok(value) if value.is_object() => Some(value),
        Ok(_) => {
            tracing::warn!(frame = %text, "dropping non-object frame");
            None
        }
        Err(e) => {
            tracing::warn!(error = %e, frame = %text, "dropping malformed frame");
            None
        }
    }
}

impl<S> Stream for JsonFrames<S>
where
    S: Stream<Item = Result<Message, tungstenite::Error>>,
{
    type Item = Result<Value, ChannelError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        if *this.finished {
            return Poll::Ready(None);
        }

        loop {
            let message = match this.inner.as_mut().poll_next(cx) {
                Poll::Pending => return Poll::Pending,
                Poll::Ready(None) => {
                    *this.finished = true;
                    return Poll::Ready(None);
                }
                Poll::Ready(Some(Err(e))) => {
                    *this.finished = true;
                    return Poll::Ready(Some(Err(e.into())));
                }
                Poll::Ready(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    if this.trace.load(Ordering::Relaxed) {
                        tracing::info!(frame = %text.as_str(), "received");
                    }
                    if let Some(value) = decode_text(text.as_str()) {
                        return Poll::Ready(Some(Ok(value)));
                    }
                }
                Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                    Ok(text) => {
                        if let Some(value) = decode_text(text) {
                            return Poll::Ready(Some(Ok(value)));
                        }
                    }
                    Err(_) => tracing::warn!(len = bytes.len(), "dropping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "close frame received");
                    *this.finished = true;
                    return Poll::Ready(None);
                }
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => {}
            }
        }
    }
}
