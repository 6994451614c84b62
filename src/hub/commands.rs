//! Commands processed by the Hub event loop.
//!
//! Every registry mutation and query travels through one
//! `tokio::sync::mpsc` channel and is handled, in arrival order, by
//! [`Hub::run`](super::Hub::run). Commands that need an answer carry a
//! oneshot sender:
//!
//! ```ignore
//! let (cmd, rx) = HubCommand::admit(client);
//! command_tx.send(cmd).await?;
//! let admitted = rx.await?;
//! ```

// Rust guideline compliant 2026-02

use bytes::Bytes;
use tokio::sync::oneshot;

use super::BroadcastReport;
use crate::client::{ClientHandle, ClientId};

/// Commands sent to the Hub.
#[derive(Debug)]
pub(crate) enum HubCommand {
    /// Register a client unless its id is already taken.
    Admit {
        /// Client to register.
        client: ClientHandle,
        /// `true` if the client was registered.
        response_tx: oneshot::Sender<bool>,
    },

    /// Remove a client and retire it.
    Evict {
        /// Connection to remove; must match the registered serial.
        client: ClientHandle,
        /// `true` if an entry was removed.
        response_tx: oneshot::Sender<bool>,
    },

    /// Offer an encoded frame to every registered client.
    Broadcast {
        /// Encoded envelope, shared by every outbox.
        frame: Bytes,
        /// Per-broadcast delivery summary.
        response_tx: oneshot::Sender<BroadcastReport>,
    },

    /// Snapshot registered client ids.
    ListClients {
        /// Sorted client ids.
        response_tx: oneshot::Sender<Vec<ClientId>>,
    },
}

impl HubCommand {
    /// Create an admit command.
    pub(crate) fn admit(client: ClientHandle) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Admit {
                client,
                response_tx: tx,
            },
            rx,
        )
    }

    /// Create an evict command.
    pub(crate) fn evict(client: ClientHandle) -> (Self, oneshot::Receiver<bool>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Evict {
                client,
                response_tx: tx,
            },
            rx,
        )
    }

    /// Create a broadcast command.
    pub(crate) fn broadcast(frame: Bytes) -> (Self, oneshot::Receiver<BroadcastReport>) {
        let (tx, rx) = oneshot::channel();
        (
            Self::Broadcast {
                frame,
                response_tx: tx,
            },
            rx,
        )
    }

    /// Create a list-clients command.
    pub(crate) fn list_clients() -> (Self, oneshot::Receiver<Vec<ClientId>>) {
        let (tx, rx) = oneshot::channel();
        (Self::ListClients { response_tx: tx }, rx)
    }

    /// Short name for log lines.
    pub(crate) fn name(&self) -> &'static str {
        match self {
            Self::Admit { .. } => "Admit",
            Self::Evict { .. } => "Evict",
            Self::Broadcast { .. } => "Broadcast",
            Self::ListClients { .. } => "ListClients",
        }
    }
}
