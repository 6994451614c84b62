//! TCP accept loop.
//!
//! Accepts connections, performs the WebSocket upgrade on the configured path
//! and hands each upgraded connection to [`HubHandle::accept`]. Handshakes
//! run as tracked tasks so a slow peer never stalls the loop.

// Rust guideline compliant 2026-02

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::Config;
use crate::hub::HubHandle;
use crate::ws;

/// Upper bound on the WebSocket handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// A running accept loop.
#[derive(Debug)]
pub struct Server {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl Server {
    /// Bind `config.listen_addr()` and start accepting.
    pub async fn bind(config: &Config, hub: HubHandle) -> Result<Self> {
        let listener = TcpListener::bind(config.listen_addr())
            .await
            .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
        let local_addr = listener
            .local_addr()
            .context("Failed to read listener address")?;
        log::info!("[Server] Listening on ws://{}{}", local_addr, config.ws_path);

        let stop = CancellationToken::new();
        let path: Arc<str> = Arc::from(config.ws_path.as_str());
        let task = tokio::spawn(accept_loop(listener, path, hub, stop.clone()));
        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    /// Address actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for the accept loop to exit.
    ///
    /// Clients already admitted are left to the Hub.
    pub async fn shutdown(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            log::error!("[Server] Accept loop panicked: {e}");
        }
    }
}

async fn accept_loop(listener: TcpListener, path: Arc<str>, hub: HubHandle, stop: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            biased;
            () = stop.cancelled() => break,
            () = hub.closed() => break,
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, remote)) => {
                log::debug!("[Server] Connection from {}", remote);
                hub.spawn_tracked(handshake(stream, remote, Arc::clone(&path), hub.clone()));
            }
            Err(e) => {
                // Usually transient (e.g. EMFILE); back off briefly.
                log::warn!("[Server] Accept failed: {e}");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
    log::info!("[Server] Stopped accepting connections");
}

async fn handshake(stream: TcpStream, remote: SocketAddr, path: Arc<str>, hub: HubHandle) {
    let upgraded = tokio::select! {
        biased;
        () = hub.closed() => return,
        upgraded = tokio::time::timeout(HANDSHAKE_TIMEOUT, ws::upgrade(stream, remote, &path)) => upgraded,
    };

    let conn = match upgraded {
        Ok(Ok(conn)) => conn,
        Ok(Err(e)) => {
            log::warn!("[Server] Rejected {}: {e}", remote);
            return;
        }
        Err(_elapsed) => {
            log::warn!("[Server] Handshake with {} timed out", remote);
            return;
        }
    };

    match hub.accept(conn).await {
        Ok(Some(_client)) => {}
        Ok(None) => log::warn!("[Server] {} already connected, closed new connection", remote),
        Err(e) => log::debug!("[Server] Dropping {}: {e}", remote),
    }
}
