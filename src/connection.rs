//! Duplex frame connection abstraction.
//!
//! The hub never touches a transport directly. A [`Connection`] is split
//! once, at admission, into a [`FrameSource`] owned by the client's inbound
//! loop and a [`FrameSink`] owned by its outbound loop, so each half has
//! exactly one user.
//!
//! ```text
//! Connection ──split()──► FrameSource  (inbound loop: read one frame)
//!                      └► FrameSink    (outbound loop: write one frame, close)
//! ```
//!
//! The WebSocket implementation lives in [`crate::ws`].

use async_trait::async_trait;
use bytes::Bytes;

/// Errors that end a client connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionError {
    /// The connection was already closed.
    Closed,
    /// Transport-level I/O failure (reset, broken pipe, ...).
    Io(String),
    /// The peer violated the transport protocol.
    Protocol(String),
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "Connection closed"),
            Self::Io(msg) => write!(f, "I/O error: {msg}"),
            Self::Protocol(msg) => write!(f, "Protocol error: {msg}"),
        }
    }
}

impl std::error::Error for ConnectionError {}

/// Read half of a connection.
#[async_trait]
pub trait FrameSource: Send {
    /// Wait for the next frame.
    ///
    /// Returns `None` once the peer has closed the connection cleanly.
    async fn recv_frame(&mut self) -> Option<Result<Bytes, ConnectionError>>;
}

/// Write half of a connection.
#[async_trait]
pub trait FrameSink: Send {
    /// Write one frame.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection is closed or the write fails.
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), ConnectionError>;

    /// Close the connection. Safe to call more than once.
    ///
    /// # Errors
    ///
    /// Returns an error if the close handshake could not be written.
    async fn close(&mut self) -> Result<(), ConnectionError>;
}

/// An established duplex connection, ready for admission.
pub trait Connection: Send + 'static {
    /// Remote endpoint of the connection; becomes the client id.
    fn remote_addr(&self) -> String;

    /// Split into independently owned read and write halves.
    fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>);
}

/// In-process connection pair for exercising client loops without sockets.
#[cfg(test)]
pub(crate) mod memory {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use async_trait::async_trait;
    use bytes::Bytes;
    use tokio::sync::mpsc;

    use super::{Connection, ConnectionError, FrameSink, FrameSource};

    #[derive(Debug, Default)]
    struct PeerState {
        closed: AtomicBool,
        fail_writes: AtomicBool,
    }

    /// Hub side of the pair.
    #[derive(Debug)]
    pub(crate) struct MemoryConnection {
        remote: String,
        inbound_rx: mpsc::UnboundedReceiver<Result<Bytes, ConnectionError>>,
        outbound_tx: mpsc::UnboundedSender<Bytes>,
        state: Arc<PeerState>,
    }

    /// Test side of the pair: feeds frames in, observes frames written out.
    #[derive(Debug)]
    pub(crate) struct MemoryPeer {
        inbound_tx: Option<mpsc::UnboundedSender<Result<Bytes, ConnectionError>>>,
        outbound_rx: mpsc::UnboundedReceiver<Bytes>,
        state: Arc<PeerState>,
    }

    pub(crate) fn pair(remote: &str) -> (MemoryConnection, MemoryPeer) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let state = Arc::new(PeerState::default());
        (
            MemoryConnection {
                remote: remote.to_string(),
                inbound_rx,
                outbound_tx,
                state: Arc::clone(&state),
            },
            MemoryPeer {
                inbound_tx: Some(inbound_tx),
                outbound_rx,
                state,
            },
        )
    }

    impl MemoryPeer {
        /// Deliver a frame to the hub side.
        pub(crate) fn send(&self, frame: impl Into<Bytes>) {
            if let Some(tx) = &self.inbound_tx {
                let _ = tx.send(Ok(frame.into()));
            }
        }

        /// Make the hub side observe a read error.
        pub(crate) fn send_error(&self, err: ConnectionError) {
            if let Some(tx) = &self.inbound_tx {
                let _ = tx.send(Err(err));
            }
        }

        /// Close the peer's write direction (hub observes a clean close).
        pub(crate) fn hang_up(&mut self) {
            self.inbound_tx = None;
        }

        /// Make every subsequent hub-side write and close fail.
        pub(crate) fn fail_writes(&self) {
            self.state.fail_writes.store(true, Ordering::SeqCst);
        }

        /// Next frame written by the hub, or `None` once its sink is closed.
        pub(crate) async fn recv(&mut self) -> Option<Bytes> {
            self.outbound_rx.recv().await
        }

        /// Frame already written by the hub, without waiting.
        pub(crate) fn try_recv(&mut self) -> Option<Bytes> {
            self.outbound_rx.try_recv().ok()
        }

        /// Whether the hub side closed the connection.
        pub(crate) fn is_closed(&self) -> bool {
            self.state.closed.load(Ordering::SeqCst)
        }
    }

    struct MemoryReader {
        inbound_rx: mpsc::UnboundedReceiver<Result<Bytes, ConnectionError>>,
    }

    #[async_trait]
    impl FrameSource for MemoryReader {
        async fn recv_frame(&mut self) -> Option<Result<Bytes, ConnectionError>> {
            self.inbound_rx.recv().await
        }
    }

    struct MemoryWriter {
        outbound_tx: Option<mpsc::UnboundedSender<Bytes>>,
        state: Arc<PeerState>,
    }

    #[async_trait]
    impl FrameSink for MemoryWriter {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), ConnectionError> {
            if self.state.fail_writes.load(Ordering::SeqCst) {
                return Err(ConnectionError::Io("simulated write failure".to_string()));
            }
            let tx = self.outbound_tx.as_ref().ok_or(ConnectionError::Closed)?;
            tx.send(frame).map_err(|_closed| ConnectionError::Closed)
        }

        async fn close(&mut self) -> Result<(), ConnectionError> {
            self.state.closed.store(true, Ordering::SeqCst);
            self.outbound_tx = None;
            if self.state.fail_writes.load(Ordering::SeqCst) {
                return Err(ConnectionError::Io("simulated close failure".to_string()));
            }
            Ok(())
        }
    }

    impl Connection for MemoryConnection {
        fn remote_addr(&self) -> String {
            self.remote.clone()
        }

        fn split(self) -> (Box<dyn FrameSource>, Box<dyn FrameSink>) {
            (
                Box::new(MemoryReader {
                    inbound_rx: self.inbound_rx,
                }),
                Box::new(MemoryWriter {
                    outbound_tx: Some(self.outbound_tx),
                    state: self.state,
                }),
            )
        }
    }
}
