//! MQTT over WebSocket.
//!
//! [`WsTransport`] presents a WebSocket connection as a plain byte stream so
//! the event loop can treat it like TCP. MQTT data travels in Binary frames:
//! every flush sends the bytes written since the previous flush as one frame,
//! and incoming frames are concatenated in arrival order.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use bytes::{Buf, Bytes, BytesMut};
use futures_util::sink::Sink;
use futures_util::stream::Stream;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::WebSocketStream;

use crate::error::{ClientError, Result};

/// MQTT WebSocket subprotocol identifier.
pub const MQTT_SUBPROTOCOL: &str = "mqtt";

/// Buffered outgoing bytes that force a frame out before more are accepted.
const MAX_PENDING_FRAME: usize = 64 * 1024;

/// Run the client side of the WebSocket upgrade over `stream`.
///
/// The request asks for the `mqtt` subprotocol; a server that answers with a
/// different one is rejected during the handshake.
pub async fn handshake<S>(url: &str, stream: S) -> Result<WsTransport<S>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = url
        .into_client_request()
        .map_err(|e| ClientError::WebSocket(format!("Invalid URL {}: {}", url, e)))?;
    request.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(MQTT_SUBPROTOCOL),
    );

    let (ws, _response) = tokio_tungstenite::client_async(request, stream)
        .await
        .map_err(|e| ClientError::WebSocket(e.to_string()))?;
    log::debug!("WebSocket upgrade to {} complete", url);
    Ok(WsTransport::new(ws))
}

/// Byte stream over an established WebSocket connection.
pub struct WsTransport<S> {
    ws: WebSocketStream<S>,
    /// Rest of the last Binary frame not yet handed to the reader.
    read_buf: Bytes,
    /// Bytes written since the last flush.
    write_buf: BytesMut,
}

impl<S> WsTransport<S> {
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self {
            ws,
            read_buf: Bytes::new(),
            write_buf: BytesMut::new(),
        }
    }
}

fn into_io(err: tungstenite::Error) -> io::Error {
    match err {
        tungstenite::Error::Io(e) => e,
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "WebSocket closed")
        }
        other => io::Error::other(other),
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncRead for WsTransport<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }
        loop {
            if !this.read_buf.is_empty() {
                let n = this.read_buf.len().min(buf.remaining());
                buf.put_slice(&this.read_buf[..n]);
                this.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut this.ws).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => this.read_buf = data,
                // Pongs are queued by tungstenite and go out with the next flush
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Text(_))) => {
                    return Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        "MQTT requires Binary WebSocket frames",
                    )));
                }
                // EOF
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Err(e)) => return Poll::Ready(Err(into_io(e))),
            }
        }
    }
}

impl<S: AsyncRead + AsyncWrite + Unpin> AsyncWrite for WsTransport<S> {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        if self.write_buf.len() >= MAX_PENDING_FRAME {
            ready!(self.as_mut().poll_flush(cx))?;
        }
        self.write_buf.extend_from_slice(buf);
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if !this.write_buf.is_empty() {
            ready!(Sink::poll_ready(Pin::new(&mut this.ws), cx)).map_err(into_io)?;
            let frame = this.write_buf.split().freeze();
            Sink::start_send(Pin::new(&mut this.ws), Message::Binary(frame)).map_err(into_io)?;
        }
        Sink::poll_flush(Pin::new(&mut this.ws), cx).map_err(into_io)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        ready!(self.as_mut().poll_flush(cx))?;
        Sink::poll_close(Pin::new(&mut self.ws), cx).map_err(into_io)
    }
}
