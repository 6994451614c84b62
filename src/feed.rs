//! Collaborators at the edge of the Hub: the event feed and the access log.
//!
//! An [`EventSource`] yields envelopes that [`pump`] broadcasts until the
//! source is exhausted or the Hub shuts down. The bundled [`LineSource`]
//! turns each line of any `AsyncBufRead` (stdin in the binary) into a test
//! message.
//!
//! An [`AccessLog`] receives one [`AccessRecord`] when a client is admitted
//! and one when it is removed.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, Lines};

use crate::client::{ClientHandle, ClientId};
use crate::hub::HubHandle;
use crate::message::Envelope;

/// Produces messages to broadcast.
#[async_trait]
pub trait EventSource: Send {
    /// Next message, or `None` when the source is exhausted.
    async fn next_event(&mut self) -> Option<Envelope>;
}

/// Newline-delimited payloads; each non-blank line becomes a test envelope.
#[derive(Debug)]
pub struct LineSource<R> {
    lines: Lines<R>,
}

impl<R: AsyncBufRead + Unpin + Send> LineSource<R> {
    /// Read lines from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            lines: reader.lines(),
        }
    }
}

#[async_trait]
impl<R: AsyncBufRead + Unpin + Send> EventSource for LineSource<R> {
    async fn next_event(&mut self) -> Option<Envelope> {
        loop {
            match self.lines.next_line().await {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => return Some(Envelope::test(line)),
                Ok(None) => return None,
                Err(e) => {
                    log::warn!("[Feed] Read failed: {e}");
                    return None;
                }
            }
        }
    }
}

/// Broadcast everything `source` yields.
///
/// Stops when the source is exhausted or the Hub closes. Returns the number
/// of messages broadcast.
pub async fn pump<S: EventSource + ?Sized>(source: &mut S, hub: &HubHandle) -> usize {
    let mut sent = 0usize;
    loop {
        let event = tokio::select! {
            biased;
            () = hub.closed() => break,
            event = source.next_event() => match event {
                Some(event) => event,
                None => {
                    log::info!("[Feed] Source exhausted after {} messages", sent);
                    break;
                }
            },
        };

        match hub.broadcast(&event).await {
            Ok(report) => {
                sent += 1;
                if !report.dropped.is_empty() {
                    log::debug!(
                        "[Feed] Message {} missed {} clients",
                        sent,
                        report.dropped.len()
                    );
                }
            }
            Err(e) => {
                log::info!("[Feed] Stopping: {e}");
                break;
            }
        }
    }
    sent
}

/// Kind of access event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessEvent {
    /// Client admitted.
    Connected,
    /// Client removed.
    Disconnected,
}

/// One access log entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRecord {
    /// Client the entry is about.
    pub client_id: ClientId,
    /// What happened.
    pub event: AccessEvent,
    /// When it was recorded.
    pub at: DateTime<Utc>,
    /// Session length; set on disconnect.
    pub connected_for: Option<Duration>,
}

impl AccessRecord {
    pub(crate) fn connected(client: &ClientHandle) -> Self {
        Self {
            client_id: client.id().clone(),
            event: AccessEvent::Connected,
            at: Utc::now(),
            connected_for: None,
        }
    }

    pub(crate) fn disconnected(client: &ClientHandle) -> Self {
        Self {
            client_id: client.id().clone(),
            event: AccessEvent::Disconnected,
            at: Utc::now(),
            connected_for: Some(client.connected_for()),
        }
    }
}

/// Sink for access records. Called from the Hub task; must not block.
pub trait AccessLog: Send + Sync + 'static {
    /// Record one entry.
    fn record(&self, record: &AccessRecord);
}

/// Writes access records as JSON lines to the `access` log target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogAccessLog;

impl AccessLog for LogAccessLog {
    fn record(&self, record: &AccessRecord) {
        let line = serde_json::json!({
            "client": record.client_id,
            "event": record.event,
            "at": record.at.to_rfc3339(),
            "connected_ms": record.connected_for.map(|d| d.as_millis() as u64),
        });
        log::info!(target: "access", "{line}");
    }
}
