//! The secure duplex channel.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::{Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config};

use crate::endpoint::Endpoint;
use crate::error::ChannelError;
use crate::framed::JsonFrames;
use crate::tls::build_client_config;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle and data events delivered to the channel's owner.
#[derive(Debug)]
pub enum ChannelEvent {
    /// An inbound JSON object.
    Message(Value),
    /// A transport fault. A [`ChannelEvent::Closed`] always follows.
    Error(ChannelError),
    /// The peer closed the connection or the transport failed.
    Closed,
}

/// An open, authenticated WebSocket-over-TLS connection to a daemon.
///
/// Writes go through [`SecureChannel::send`]; everything inbound arrives on
/// the event receiver returned by [`SecureChannel::open`]. Dropping the
/// channel closes it.
pub struct SecureChannel {
    writer: Arc<Mutex<SplitSink<WsStream, Message>>>,
    reader: JoinHandle<()>,
    open: Arc<AtomicBool>,
    trace: Arc<AtomicBool>,
}

impl SecureChannel {
    /// Open a channel to `endpoint`.
    ///
    /// While `trace` is set, every raw inbound and outbound frame is logged.
    pub async fn open(
        endpoint: &Endpoint,
        trace: Arc<AtomicBool>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<ChannelEvent>), ChannelError> {
        let tls = build_client_config(&endpoint.tls)?;

        let mut request = endpoint.url().into_client_request()?;
        let auth = HeaderValue::from_str(&endpoint.basic_auth())
            .map_err(|e| ChannelError::InvalidEndpoint(e.to_string()))?;
        request.headers_mut().insert(AUTHORIZATION, auth);

        tracing::debug!(host = %endpoint.host, port = endpoint.port, "opening channel");

        let connect =
            connect_async_tls_with_config(request, None, true, Some(Connector::Rustls(tls)));
        let (stream, _response) = tokio::time::timeout(endpoint.connect_timeout, connect)
            .await
            .map_err(|_| ChannelError::Timeout(endpoint.connect_timeout))??;

        tracing::info!(host = %endpoint.host, port = endpoint.port, "channel open");

        let (sink, source) = stream.split();
        let (events, receiver) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(true));
        let frames = JsonFrames::with_trace(source, trace.clone());
        let reader = tokio::spawn(read_loop(frames, events, open.clone()));

        Ok((
            Self {
                writer: Arc::new(Mutex::new(sink)),
                reader,
                open,
                trace,
            },
            receiver,
        ))
    }

    /// Whether the channel is still open.
    #[must_use]
    pub fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Send one text frame.
    pub async fn send(&self, text: String) -> Result<(), ChannelError> {
        if !self.is_open() {
            return Err(ChannelError::Closed);
        }
        if self.trace.load(Ordering::Relaxed) {
            tracing::info!(frame = %text, "sent");
        }

        let mut writer = self.writer.lock().await;
        writer.send(Message::text(text)).await?;
        Ok(())
    }

    /// Close the channel. Idempotent.
    ///
    /// The reader stops immediately and no further events are delivered.
    /// The close frame is sent in the background when a runtime is
    /// available.
    pub fn close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }
        self.reader.abort();

        let writer = self.writer.clone();
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(async move {
                let mut writer = writer.lock().await;
                if let Err(e) = writer.close().await {
                    tracing::trace!(error = %e, "close frame not delivered");
                }
            });
        }
        tracing::debug!("channel closed");
    }
}

impl std::fmt::Debug for SecureChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureChannel")
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

impl Drop for SecureChannel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn read_loop(
    mut frames: JsonFrames<SplitStream<WsStream>>,
    events: mpsc::UnboundedSender<ChannelEvent>,
    open: Arc<AtomicBool>,
) {
    while let Some(item) = frames.next().await {
        match item {
            Ok(value) => {
                if events.send(ChannelEvent::Message(value)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(error = %e, "channel error");
                let _ = events.send(ChannelEvent::Error(e));
                break;
            }
        }
    }

    open.store(false, Ordering::Release);
    let _ = events.send(ChannelEvent::Closed);
}
