//! Cloneable handle for talking to a running Hub.
//!
//! `HubHandle` wraps the Hub command channel and hides its request/response
//! plumbing. It is `Clone + Send + Sync`, so the accept loop, feed pump,
//! client loops and signal handler each hold their own copy.
//!
//! Requests race against the Hub's shutdown token: once the Hub is shutting
//! down, every request resolves to [`HubError::Closed`] instead of waiting on
//! a channel nobody drains.

// Rust guideline compliant 2026-02

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::commands::HubCommand;
use super::stats::{HubCounters, HubStats};
use super::{BroadcastReport, HubError, HubSettings};
use crate::client::{self, ClientHandle, ClientId};
use crate::connection::Connection;
use crate::message::Envelope;

/// Handle for Hub communication.
#[derive(Clone)]
pub struct HubHandle {
    command_tx: mpsc::Sender<HubCommand>,
    counters: Arc<HubCounters>,
    settings: Arc<HubSettings>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl HubHandle {
    pub(super) fn new(
        command_tx: mpsc::Sender<HubCommand>,
        counters: Arc<HubCounters>,
        settings: Arc<HubSettings>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            command_tx,
            counters,
            settings,
            shutdown,
            tracker,
        }
    }

    /// Send a command and wait for its response.
    async fn request<T>(
        &self,
        command: HubCommand,
        response_rx: oneshot::Receiver<T>,
    ) -> Result<T, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }
        let exchange = async {
            self.command_tx
                .send(command)
                .await
                .map_err(|_closed| HubError::Closed)?;
            response_rx.await.map_err(|_dropped| HubError::Closed)
        };
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(HubError::Closed),
            result = exchange => result,
        }
    }

    /// Register `client` unless its id is already registered.
    ///
    /// Returns `Ok(false)` for a duplicate id; the earlier client stays.
    pub async fn admit(&self, client: ClientHandle) -> Result<bool, HubError> {
        let (command, rx) = HubCommand::admit(client);
        self.request(command, rx).await
    }

    /// Remove `client` from the registry and retire it.
    ///
    /// Returns `Ok(false)` if that connection is not registered, including
    /// when a newer connection now holds the same id.
    pub async fn evict(&self, client: &ClientHandle) -> Result<bool, HubError> {
        let (command, rx) = HubCommand::evict(client.clone());
        self.request(command, rx).await
    }

    /// Offer `envelope` to every registered client.
    ///
    /// The envelope is encoded once. Clients with a full outbox miss it; the
    /// call never waits on a client.
    pub async fn broadcast(&self, envelope: &Envelope) -> Result<BroadcastReport, HubError> {
        self.broadcast_frame(envelope.encode()).await
    }

    /// Offer an already encoded frame to every registered client.
    pub async fn broadcast_frame(&self, frame: Bytes) -> Result<BroadcastReport, HubError> {
        let (command, rx) = HubCommand::broadcast(frame);
        self.request(command, rx).await
    }

    /// Registered client ids, sorted.
    pub async fn clients(&self) -> Result<Vec<ClientId>, HubError> {
        let (command, rx) = HubCommand::list_clients();
        self.request(command, rx).await
    }

    /// Current counters. Does not go through the Hub task.
    pub fn stats(&self) -> HubStats {
        self.counters.snapshot()
    }

    /// Ask the Hub to stop. Returns immediately; see [`HubHandle::wait_idle`].
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            log::info!("[Hub] Shutdown initiated");
        }
        self.shutdown.cancel();
    }

    /// Whether shutdown has been requested.
    pub fn shutdown_requested(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn closed(&self) {
        self.shutdown.cancelled().await;
    }

    /// Number of client tasks still running.
    pub fn active_tasks(&self) -> usize {
        self.tracker.len()
    }

    /// Resolves once the Hub has stopped and every client task has ended.
    pub async fn wait_idle(&self) {
        self.tracker.wait().await;
    }

    /// Settings the Hub was created with.
    pub fn settings(&self) -> &HubSettings {
        &self.settings
    }

    /// Token that is cancelled along with the Hub.
    pub(crate) fn child_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }

    /// Track a task so shutdown waits for it.
    pub(crate) fn spawn_tracked<F>(&self, task: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(task);
    }

    /// Admit a freshly established connection and start its loops.
    ///
    /// The client id is the connection's remote address. Both client tasks
    /// are running by the time this returns `Ok(Some(_))`.
    ///
    /// Returns `Ok(None)` and closes the connection if a client with the
    /// same id is already registered.
    pub async fn accept<C: Connection>(&self, conn: C) -> Result<Option<ClientHandle>, HubError> {
        let id = ClientId::from(conn.remote_addr());
        let (source, mut sink) = conn.split();
        let (client, outbox_rx) =
            ClientHandle::new(id, self.settings.outbox_capacity, self.child_token());

        match self.admit(client.clone()).await {
            Ok(true) => {}
            Ok(false) => {
                client.retire();
                if let Err(e) = sink.close().await {
                    log::debug!("[Hub] Closing duplicate {} failed: {e}", client.id());
                }
                return Ok(None);
            }
            Err(e) => {
                client.retire();
                if let Err(close_err) = sink.close().await {
                    log::debug!("[Hub] Closing {} after {e} failed: {close_err}", client.id());
                }
                return Err(e);
            }
        }

        self.spawn_tracked(client::outbound_loop(
            client.clone(),
            outbox_rx,
            sink,
            self.settings.ping_interval,
        ));
        self.spawn_tracked(client::inbound_loop(
            client.clone(),
            source,
            self.clone(),
            Arc::clone(&self.settings.handler),
            self.settings.idle_timeout,
        ));
        Ok(Some(client))
    }
}

impl std::fmt::Debug for HubHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubHandle")
            .field("closed", &self.shutdown.is_cancelled())
            .field("active_tasks", &self.tracker.len())
            .finish_non_exhaustive()
    }
}
