//! Socket Hub - WebSocket fan-out server.
//!
//! Clients connect over WebSocket, are admitted into a Hub, answer liveness
//! pings and receive every broadcast best-effort. A slow client only ever
//! loses its own messages; it never blocks the Hub or other clients.
//!
//! # Architecture
//!
//! - **Hub** - owns the client registry, serializes admit/evict/broadcast
//! - **Client** - per-connection inbound and outbound loops, bounded outbox
//! - **Server** - TCP accept loop and WebSocket upgrade
//! - **Feed** - event source pumped into broadcasts, access log sink
//!
//! # Modules
//!
//! - [`message`] - wire envelope
//! - [`connection`] - duplex frame stream traits
//! - [`hub`] - registry, event loop, [`HubHandle`]
//! - [`config`] - configuration loading

pub mod client;
pub mod config;
pub mod connection;
pub mod feed;
pub mod hub;
pub mod message;
pub mod server;
pub mod ws;

// Re-export commonly used types
pub use client::{ClientHandle, ClientId, EnqueueError, InboundHandler};
pub use config::Config;
pub use connection::{Connection, ConnectionError};
pub use feed::{AccessEvent, AccessLog, AccessRecord, EventSource, LineSource};
pub use hub::{BroadcastReport, Hub, HubError, HubHandle, HubSettings, HubStats, OverflowPolicy};
pub use message::{Envelope, MsgType};
pub use server::Server;
