//! WebSocket transport for client connections.
//!
//! Thin wrapper around `tokio-tungstenite` (server side) that exposes an
//! accepted socket as a [`Connection`]. Binary frames carry envelopes;
//! text frames are accepted on input too. Protocol-level ping/pong frames are
//! answered by tungstenite itself and never reach the client loops.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

use crate::connection::{Connection, ConnectionError, FrameSink, FrameSource};

type WsStream = tokio_tungstenite::WebSocketStream<TcpStream>;

/// An upgraded WebSocket connection.
#[derive(Debug)]
pub struct WsConnection {
    remote: SocketAddr,
    stream: WsStream,
}

/// Perform the server-side WebSocket handshake on `stream`.
///
/// Requests for any path other than `path` are answered with HTTP 404.
///
/// # Errors
///
/// Returns [`ConnectionError::Protocol`] if the handshake fails or the path
/// does not match.
pub async fn upgrade(
    stream: TcpStream,
    remote: SocketAddr,
    path: &str,
) -> Result<WsConnection, ConnectionError> {
    let expected = path.to_string();
    let check_path = move |request: &Request, response: Response| {
        if request.uri().path() == expected {
            Ok(response)
        } else {
            let mut rejection = ErrorResponse::new(Some("not found".to_string()));
            *rejection.status_mut() = tungstenite::http::StatusCode::NOT_FOUND;
            Err(rejection)
        }
    };

    let stream = tokio_tungstenite::accept_hdr_async(stream, check_path)
        .await
        .map_err(|e| ConnectionError::Protocol(format!("WebSocket handshake failed: {e}")))?;
    Ok(WsConnection { remote, stream })
}

impl Connection for WsConnection {
    fn remote_addr(&self) -> String {
        self.remote.to_string()
    }

    fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
        let (sink, stream) = self.stream.split();
        (Box::new(WsReader { stream }), Box::new(WsWriter { sink }))
    }
}

/// Read half of a WebSocket connection.
#[derive(Debug)]
pub struct WsReader {
    stream: futures_util::stream::SplitStream<WsStream>,
}

#[async_trait]
impl FrameSource for WsReader {
    async fn recv_frame(&mut self) -> Option<Result<Bytes, ConnectionError>> {
        loop {
            match self.stream.next().await {
                Some(Ok(tungstenite::Message::Binary(data))) => {
                    return Some(Ok(Bytes::from(data)));
                }
                Some(Ok(tungstenite::Message::Text(text))) => {
                    return Some(Ok(Bytes::from(text.into_bytes())));
                }
                Some(Ok(tungstenite::Message::Close(_))) => return None,
                Some(Ok(
                    tungstenite::Message::Ping(_)
                    | tungstenite::Message::Pong(_)
                    | tungstenite::Message::Frame(_),
                )) => {
                    // Control frames are handled by tungstenite.
                    continue;
                }
                Some(Err(
                    tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed,
                ))
                | None => return None,
                Some(Err(tungstenite::Error::Protocol(e))) => {
                    return Some(Err(ConnectionError::Protocol(e.to_string())));
                }
                Some(Err(e)) => {
                    return Some(Err(ConnectionError::Io(format!("WebSocket read error: {e}"))));
                }
            }
        }
    }
}

/// Write half of a WebSocket connection.
#[derive(Debug)]
pub struct WsWriter {
    sink: futures_util::stream::SplitSink<WsStream, tungstenite::Message>,
}

fn write_error(e: tungstenite::Error) -> ConnectionError {
    match e {
        tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed => {
            ConnectionError::Closed
        }
        other => ConnectionError::Io(format!("WebSocket write error: {other}")),
    }
}

#[async_trait]
impl FrameSink for WsWriter {
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), ConnectionError> {
        self.sink
            .send(tungstenite::Message::Binary(frame.to_vec()))
            .await
            .map_err(write_error)
    }

    async fn close(&mut self) -> Result<(), ConnectionError> {
        self.sink.close().await.map_err(write_error)
    }
}
