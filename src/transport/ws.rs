//! The WebSocket carrier.
//!
//! The carrier exists so the tunnel survives HTTP reverse proxies and
//! ingress controllers; everything above it just needs bytes. [`WsStream`]
//! adapts the message-oriented WebSocket into an ordered byte stream: every
//! write becomes one binary message, reads drain messages as they arrive,
//! and shutdown maps to the WebSocket close handshake.

use super::TransportError;
use bytes::{Buf, Bytes};
use futures_util::{ready, Sink, Stream};
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::Error as WsError;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::header::ORIGIN;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{accept_hdr_async, client_async, WebSocketStream};
use tracing::debug;
use url::Url;

/// Perform the client side of the WebSocket handshake over an established
/// connection. The gateway URL doubles as the Origin.
pub async fn connect<S>(stream: S, gateway: &Url) -> Result<WsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = gateway
        .as_str()
        .into_client_request()
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    let origin = HeaderValue::from_str(gateway.as_str())
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    request.headers_mut().insert(ORIGIN, origin);

    let (inner, response) = client_async(request, stream)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    debug!(status = %response.status(), "websocket established");

    Ok(WsStream::new(inner))
}

/// Perform the server side of the WebSocket handshake. Any request path is
/// served; a request that is not a WebSocket upgrade fails the handshake.
pub async fn accept<S>(stream: S) -> Result<WsStream<S>, TransportError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        debug!(path = %request.uri().path(), "websocket upgrade");
        Ok(response)
    };
    let inner = accept_hdr_async(stream, callback)
        .await
        .map_err(|e| TransportError::WebSocket(e.to_string()))?;
    Ok(WsStream::new(inner))
}

/// A WebSocket connection presented as an `AsyncRead + AsyncWrite` byte
/// stream.
pub struct WsStream<S> {
    inner: WebSocketStream<S>,
    /// Remainder of the last message not yet consumed by a read.
    read_buf: Bytes,
}

impl<S> WsStream<S> {
    fn new(inner: WebSocketStream<S>) -> Self {
        Self {
            inner,
            read_buf: Bytes::new(),
        }
    }
}

impl<S> AsyncRead for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        loop {
            if !me.read_buf.is_empty() {
                let n = me.read_buf.len().min(buf.remaining());
                buf.put_slice(&me.read_buf[..n]);
                me.read_buf.advance(n);
                return Poll::Ready(Ok(()));
            }

            match ready!(Pin::new(&mut me.inner).poll_next(cx)) {
                Some(Ok(Message::Binary(data))) => {
                    me.read_buf = Bytes::from(data);
                }
                Some(Ok(Message::Text(text))) => {
                    me.read_buf = Bytes::from(text.into_bytes());
                }
                // Close handshake or dropped carrier both surface as EOF.
                Some(Ok(Message::Close(_))) | None => return Poll::Ready(Ok(())),
                Some(Ok(_)) => continue,
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => {
                    return Poll::Ready(Ok(()))
                }
                Some(Err(e)) => return Poll::Ready(Err(to_io_error(e))),
            }
        }
    }
}

impl<S> AsyncWrite for WsStream<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let me = self.get_mut();
        if let Err(e) = ready!(Pin::new(&mut me.inner).poll_ready(cx)) {
            return Poll::Ready(Err(to_io_error(e)));
        }
        if let Err(e) = Pin::new(&mut me.inner).start_send(Message::Binary(buf.to_vec())) {
            return Poll::Ready(Err(to_io_error(e)));
        }
        Poll::Ready(Ok(buf.len()))
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        Pin::new(&mut me.inner).poll_flush(cx).map_err(to_io_error)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let me = self.get_mut();
        match ready!(Pin::new(&mut me.inner).poll_close(cx)) {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => {
                Poll::Ready(Ok(()))
            }
            Err(e) => Poll::Ready(Err(to_io_error(e))),
        }
    }
}

fn to_io_error(err: WsError) -> io::Error {
    match err {
        WsError::Io(err) => err,
        WsError::ConnectionClosed | WsError::AlreadyClosed => {
            io::Error::new(io::ErrorKind::BrokenPipe, "websocket closed")
        }
        other => io::Error::new(io::ErrorKind::Other, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn ws_pair() -> (WsStream<tokio::io::DuplexStream>, WsStream<tokio::io::DuplexStream>) {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let url = Url::parse("ws://carrier.test/").unwrap();
        let (client, server) = tokio::join!(connect(client_io, &url), accept(server_io));
        (client.unwrap(), server.unwrap())
    }

    #[tokio::test]
    async fn bytes_round_trip() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(b"hello over websocket").await.unwrap();
        client.flush().await.unwrap();

        let mut buf = [0u8; 20];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello over websocket");

        server.write_all(b"reply").await.unwrap();
        server.flush().await.unwrap();
        let mut buf = [0u8; 5];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"reply");
    }

    #[tokio::test]
    async fn reads_split_large_messages() {
        let (mut client, mut server) = ws_pair().await;

        client.write_all(&[7u8; 1000]).await.unwrap();
        client.flush().await.unwrap();

        // Consume in small pieces; leftover message bytes must survive.
        let mut total = Vec::new();
        let mut chunk = [0u8; 64];
        while total.len() < 1000 {
            let n = server.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            total.extend_from_slice(&chunk[..n]);
        }
        assert_eq!(total, vec![7u8; 1000]);
    }

    #[tokio::test]
    async fn shutdown_surfaces_as_eof() {
        let (mut client, mut server) = ws_pair().await;

        let reader = tokio::spawn(async move {
            let mut data = Vec::new();
            server.read_to_end(&mut data).await.unwrap();
            data
        });

        client.write_all(b"last").await.unwrap();
        client.shutdown().await.unwrap();

        assert_eq!(reader.await.unwrap(), b"last");
    }
}
