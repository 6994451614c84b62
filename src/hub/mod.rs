//! Hub: the registry of connected clients and its event loop.
//!
//! The Hub owns the registry outright and mutates it only from [`Hub::run`].
//! Everything else talks to it through a cloneable [`HubHandle`], which
//! sends [`commands::HubCommand`]s over a bounded `tokio::sync::mpsc` channel
//! (actor pattern, no locks around the registry).
//!
//! ```text
//! accept ─┐                              ┌─► outbox A ─► outbound loop A
//! feed   ─┼─► HubHandle ─► command_tx ─► Hub::run ─► outbox B ─► ...
//! evict  ─┘                              └─► access log
//! ```
//!
//! # Lifecycle
//!
//! 1. [`Hub::new`] returns the Hub and its first handle.
//! 2. `tokio::spawn(hub.run())` starts the event loop.
//! 3. [`HubHandle::shutdown`] cancels the Hub token. The loop stops, every
//!    client is retired, and the loop waits for all client tasks to end.
//!
//! After shutdown every handle operation returns [`HubError::Closed`]
//! without blocking.

// Rust guideline compliant 2026-02

mod commands;
mod handle;
mod registry;
mod stats;

pub use handle::HubHandle;
pub use stats::HubStats;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use crate::client::{ClientHandle, ClientId, InboundHandler, LogInboundHandler};
use crate::config::Config;
use crate::feed::{AccessLog, AccessRecord, LogAccessLog};
use commands::HubCommand;
use registry::ClientRegistry;
use stats::HubCounters;

/// Hub operations fail only once the Hub has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubError {
    /// The Hub event loop is no longer running.
    Closed,
}

impl std::fmt::Display for HubError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "hub closed"),
        }
    }
}

impl std::error::Error for HubError {}

/// What a broadcast does with a client whose outbox is full.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverflowPolicy {
    /// Skip the message for that client only.
    #[default]
    Drop,
    /// Skip the message and evict the client.
    Evict,
}

impl std::fmt::Display for OverflowPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Drop => write!(f, "drop"),
            Self::Evict => write!(f, "evict"),
        }
    }
}

impl std::str::FromStr for OverflowPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "drop" => Ok(Self::Drop),
            "evict" => Ok(Self::Evict),
            other => Err(format!("unknown overflow policy '{other}' (expected drop or evict)")),
        }
    }
}

/// Delivery summary of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BroadcastReport {
    /// Clients registered when the broadcast was processed.
    pub recipients: usize,
    /// Outboxes that accepted the message.
    pub delivered: usize,
    /// Clients that missed the message because their outbox was full.
    pub dropped: Vec<ClientId>,
    /// Clients removed while processing the broadcast.
    pub evicted: Vec<ClientId>,
}

/// Tunables shared by the Hub and the client loops it spawns.
#[derive(Clone)]
pub struct HubSettings {
    /// Frames each client outbox can hold.
    pub outbox_capacity: usize,
    /// Pending commands the Hub channel can hold.
    pub command_capacity: usize,
    /// Behaviour on a full outbox.
    pub overflow: OverflowPolicy,
    /// Server-initiated ping period; `None` disables keepalive.
    pub ping_interval: Option<Duration>,
    /// Maximum silence from a client before it is dropped; `None` waits forever.
    pub idle_timeout: Option<Duration>,
    /// Receives application messages from clients.
    pub handler: Arc<dyn InboundHandler>,
    /// Receives connect and disconnect records.
    pub access_log: Arc<dyn AccessLog>,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            outbox_capacity: 1024,
            command_capacity: 100,
            overflow: OverflowPolicy::Drop,
            ping_interval: None,
            idle_timeout: None,
            handler: Arc::new(LogInboundHandler),
            access_log: Arc::new(LogAccessLog),
        }
    }
}

impl HubSettings {
    /// Settings taken from a loaded [`Config`].
    #[must_use]
    pub fn from_config(config: &Config) -> Self {
        Self {
            outbox_capacity: config.outbox_capacity,
            command_capacity: config.command_capacity,
            overflow: config.overflow,
            ping_interval: config.ping_interval(),
            idle_timeout: config.idle_timeout(),
            ..Self::default()
        }
    }

    /// Replace the inbound message handler.
    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn InboundHandler>) -> Self {
        self.handler = handler;
        self
    }

    /// Replace the access log sink.
    #[must_use]
    pub fn with_access_log(mut self, access_log: Arc<dyn AccessLog>) -> Self {
        self.access_log = access_log;
        self
    }

    /// Set the outbox capacity.
    #[must_use]
    pub fn with_outbox_capacity(mut self, capacity: usize) -> Self {
        self.outbox_capacity = capacity;
        self
    }

    /// Set the overflow policy.
    #[must_use]
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }

    /// Set the keepalive ping period.
    #[must_use]
    pub fn with_ping_interval(mut self, interval: Option<Duration>) -> Self {
        self.ping_interval = interval;
        self
    }

    /// Set the idle timeout.
    #[must_use]
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }
}

impl std::fmt::Debug for HubSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubSettings")
            .field("outbox_capacity", &self.outbox_capacity)
            .field("command_capacity", &self.command_capacity)
            .field("overflow", &self.overflow)
            .field("ping_interval", &self.ping_interval)
            .field("idle_timeout", &self.idle_timeout)
            .finish_non_exhaustive()
    }
}

/// The Hub event loop and the state it owns.
pub struct Hub {
    registry: ClientRegistry,
    command_rx: mpsc::Receiver<HubCommand>,
    counters: Arc<HubCounters>,
    settings: Arc<HubSettings>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

impl Hub {
    /// Create a Hub and the handle used to reach it.
    ///
    /// The Hub does nothing until [`Hub::run`] is polled.
    ///
    /// # Panics
    ///
    /// Panics if `settings.command_capacity` is zero.
    #[must_use]
    pub fn new(settings: HubSettings) -> (Self, HubHandle) {
        let (command_tx, command_rx) = mpsc::channel(settings.command_capacity);
        let counters = Arc::new(HubCounters::default());
        let settings = Arc::new(settings);
        let shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let handle = HubHandle::new(
            command_tx,
            Arc::clone(&counters),
            Arc::clone(&settings),
            shutdown.clone(),
            tracker.clone(),
        );
        let hub = Self {
            registry: ClientRegistry::new(),
            command_rx,
            counters,
            settings,
            shutdown,
            tracker,
        };
        (hub, handle)
    }

    /// Run the event loop until shutdown.
    ///
    /// Returns once every client has been retired and all client tasks have
    /// finished.
    pub async fn run(mut self) {
        log::info!(
            "[Hub] Event loop started (outbox capacity {}, overflow {})",
            self.settings.outbox_capacity,
            self.settings.overflow
        );

        loop {
            let command = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => {
                    log::info!("[Hub] Shutdown requested");
                    break;
                }
                command = self.command_rx.recv() => match command {
                    Some(command) => command,
                    None => {
                        log::info!("[Hub] All handles dropped");
                        break;
                    }
                },
            };
            log::trace!("[Hub] Processing {}", command.name());
            self.handle_command(command);
        }

        self.stop().await;
    }

    fn handle_command(&mut self, command: HubCommand) {
        match command {
            HubCommand::Admit {
                client,
                response_tx,
            } => {
                let admitted = self.admit(client);
                let _ = response_tx.send(admitted);
            }
            HubCommand::Evict {
                client,
                response_tx,
            } => {
                let evicted = self.evict(&client);
                let _ = response_tx.send(evicted);
            }
            HubCommand::Broadcast { frame, response_tx } => {
                let report = self.broadcast(&frame);
                let _ = response_tx.send(report);
            }
            HubCommand::ListClients { response_tx } => {
                let _ = response_tx.send(self.registry.ids());
            }
        }
    }

    fn admit(&mut self, client: ClientHandle) -> bool {
        let id = client.id().clone();
        let record = AccessRecord::connected(&client);
        if !self.registry.register(client) {
            log::warn!("[Hub] Client {} already connected, ignoring duplicate", id);
            return false;
        }
        self.counters.record_admitted();
        self.settings.access_log.record(&record);
        log::info!(
            "[Hub] Client {} connected ({} connected)",
            id,
            self.registry.len()
        );
        true
    }

    fn evict(&mut self, client: &ClientHandle) -> bool {
        match self.registry.unregister(client) {
            Some(removed) => {
                self.retire(&removed);
                log::info!(
                    "[Hub] Client {} disconnected ({} connected)",
                    removed.id(),
                    self.registry.len()
                );
                true
            }
            None => {
                log::debug!("[Hub] Client {} not registered, nothing to evict", client.id());
                false
            }
        }
    }

    fn retire(&self, client: &ClientHandle) {
        client.retire();
        self.counters.record_evicted();
        self.settings
            .access_log
            .record(&AccessRecord::disconnected(client));
    }

    fn broadcast(&mut self, frame: &Bytes) -> BroadcastReport {
        let recipients = self.registry.len();
        let fanout = self.registry.fanout(frame);
        let mut report = BroadcastReport {
            recipients,
            delivered: fanout.delivered.len(),
            ..BroadcastReport::default()
        };

        for client in fanout.full {
            client.record_drop();
            log::warn!(
                "[Hub] Outbox full for {}, message dropped ({} dropped so far)",
                client.id(),
                client.dropped_frames()
            );
            report.dropped.push(client.id().clone());
            if self.settings.overflow == OverflowPolicy::Evict && self.evict(&client) {
                report.evicted.push(client.id().clone());
            }
        }

        // Retired clients are on their way out; their inbound loop may not
        // have reached the Hub yet.
        for client in fanout.closed {
            if self.evict(&client) {
                report.evicted.push(client.id().clone());
            }
        }

        self.counters
            .record_broadcast(report.delivered, report.dropped.len());
        log::debug!(
            "[Hub] Broadcast {} bytes to {}/{} clients",
            frame.len(),
            report.delivered,
            recipients
        );
        report
    }

    /// Retire every client, refuse further commands and join client tasks.
    async fn stop(mut self) {
        self.shutdown.cancel();

        let remaining = self.registry.drain();
        if !remaining.is_empty() {
            log::info!("[Hub] Disconnecting {} clients", remaining.len());
        }
        for client in &remaining {
            self.retire(client);
        }

        // Pending requests see their response channel dropped.
        self.command_rx.close();
        while self.command_rx.try_recv().is_ok() {}

        self.tracker.close();
        self.tracker.wait().await;
        log::info!("[Hub] Event loop stopped");
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("registry", &self.registry)
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}
