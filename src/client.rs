//! Per-connection client state and its read/write loops.
//!
//! Each admitted connection becomes a client with:
//! - a [`ClientHandle`]: the registry entry (id, bounded outbox, cancellation)
//! - an inbound loop: reads frames, answers pings, forwards everything else
//! - an outbound loop: the only writer to the connection, drains the outbox
//!
//! ```text
//!              Hub broadcast ──try_send──┐
//!                                        ▼
//! FrameSource ─► inbound loop ─pong─► outbox ─► outbound loop ─► FrameSink
//!                     │                                 │
//!                     └──────── CancellationToken ──────┘
//! ```
//!
//! Both loops share one [`CancellationToken`]. Whichever loop exits first
//! cancels it, so the other never stays blocked. The inbound loop is the one
//! that asks the Hub to evict the client.

// Rust guideline compliant 2026-02

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionError, FrameSink, FrameSource};
use crate::hub::HubHandle;
use crate::message::{Envelope, MsgType};

/// Upper bound on the close handshake once a client is retiring.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Stable client identifier, derived from the connection's remote endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    /// Borrow the identifier as a string.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Why a frame could not be queued for a client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueError {
    /// The outbox is at capacity; the frame was dropped.
    Full,
    /// The client is retired; nothing will be written any more.
    Closed,
}

impl std::fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Full => write!(f, "Outbox full"),
            Self::Closed => write!(f, "Outbox closed"),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Registry entry for one connected client.
///
/// Cheap to clone: the outbox sender, cancellation token and counters are
/// shared. Every handle gets a process-unique serial so a retired client can
/// never be confused with a newer one that reuses its id.
#[derive(Debug, Clone)]
pub struct ClientHandle {
    id: ClientId,
    serial: u64,
    outbox: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    dropped: Arc<AtomicU64>,
    connected_at: Instant,
}

impl ClientHandle {
    /// Create a handle with a bounded outbox of `capacity` frames.
    ///
    /// Returns the handle and the outbox receiver, which belongs to the
    /// client's outbound loop.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is zero.
    pub fn new(
        id: impl Into<ClientId>,
        capacity: usize,
        cancel: CancellationToken,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

        let (outbox, outbox_rx) = mpsc::channel(capacity);
        let handle = Self {
            id: id.into(),
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            outbox,
            cancel,
            dropped: Arc::new(AtomicU64::new(0)),
            connected_at: Instant::now(),
        };
        (handle, outbox_rx)
    }

    /// Client identifier.
    pub fn id(&self) -> &ClientId {
        &self.id
    }

    /// Process-unique serial of this connection.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// Whether `other` refers to the same connection (not merely the same id).
    pub fn same_connection(&self, other: &ClientHandle) -> bool {
        self.id == other.id && self.serial == other.serial
    }

    /// Queue an encoded frame without waiting.
    ///
    /// # Errors
    ///
    /// [`EnqueueError::Full`] if the outbox is at capacity,
    /// [`EnqueueError::Closed`] if the client is retired.
    pub fn try_enqueue(&self, frame: Bytes) -> Result<(), EnqueueError> {
        if self.cancel.is_cancelled() {
            return Err(EnqueueError::Closed);
        }
        self.outbox.try_send(frame).map_err(|e| match e {
            TrySendError::Full(_) => EnqueueError::Full,
            TrySendError::Closed(_) => EnqueueError::Closed,
        })
    }

    /// Count one frame dropped for this client because of backpressure.
    pub(crate) fn record_drop(&self) {
        self.dropped.fetch_add(1, Ordering::Relaxed);
    }

    /// Frames dropped for this client because its outbox was full.
    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Free slots left in the outbox.
    pub fn outbox_free(&self) -> usize {
        self.outbox.capacity()
    }

    /// Retire the client: both loops exit and the connection is closed.
    pub fn retire(&self) {
        self.cancel.cancel();
    }

    /// Whether the client has been retired.
    pub fn is_retired(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Time since the handle was created.
    pub fn connected_for(&self) -> Duration {
        self.connected_at.elapsed()
    }

    /// Resolves once the client is retired.
    pub async fn retired(&self) {
        self.cancel.cancelled().await;
    }
}

/// Receives client messages the hub does not handle itself.
///
/// Everything except the liveness types ends up here, including types this
/// build does not know about.
pub trait InboundHandler: Send + Sync + 'static {
    /// Called from the client's inbound loop for each forwarded envelope.
    fn on_message(&self, client: &ClientId, envelope: Envelope);
}

/// Default handler: logs and discards.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogInboundHandler;

impl InboundHandler for LogInboundHandler {
    fn on_message(&self, client: &ClientId, envelope: Envelope) {
        log::debug!(
            "[Client] {} sent {:?} ({} bytes), no handler installed",
            client,
            envelope.msg_type,
            envelope.data.len()
        );
    }
}

/// Read frames until the connection ends, then evict the client.
///
/// Decode failures are logged and skipped. Pings are answered by queuing a
/// pong on the client's own outbox; the outbound loop stays the only writer.
pub(crate) async fn inbound_loop(
    client: ClientHandle,
    mut source: Box<dyn FrameSource>,
    hub: HubHandle,
    handler: Arc<dyn InboundHandler>,
    idle_timeout: Option<Duration>,
) {
    loop {
        let next = tokio::select! {
            biased;
            () = client.retired() => {
                log::debug!("[Client] {} retired, stopping reader", client.id());
                break;
            }
            next = recv_with_timeout(source.as_mut(), idle_timeout) => next,
        };

        match next {
            Ok(Some(frame)) => handle_frame(&client, handler.as_ref(), &frame),
            Ok(None) => {
                log::info!("[Client] {} closed the connection", client.id());
                break;
            }
            Err(e) => {
                log::warn!("[Client] Read error for {}: {e}", client.id());
                break;
            }
        }
    }

    client.retire();
    match hub.evict(&client).await {
        Ok(_) => {}
        Err(e) => log::debug!("[Client] {} not evicted: {e}", client.id()),
    }
}

/// Read one frame, treating a silent peer past `idle_timeout` as an error.
async fn recv_with_timeout(
    source: &mut dyn FrameSource,
    idle_timeout: Option<Duration>,
) -> Result<Option<Bytes>, ConnectionError> {
    let next = match idle_timeout {
        Some(limit) => match tokio::time::timeout(limit, source.recv_frame()).await {
            Ok(next) => next,
            Err(_elapsed) => {
                return Err(ConnectionError::Io(format!(
                    "no frame received for {limit:?}"
                )))
            }
        },
        None => source.recv_frame().await,
    };
    next.transpose()
}

/// React to one inbound frame.
fn handle_frame(client: &ClientHandle, handler: &dyn InboundHandler, frame: &[u8]) {
    let envelope = match Envelope::decode(frame) {
        Ok(envelope) => envelope,
        Err(e) => {
            log::warn!("[Client] {} sent an undecodable frame: {e}", client.id());
            return;
        }
    };

    match envelope.msg_type {
        MsgType::Ping => match client.try_enqueue(Envelope::pong().encode()) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                client.record_drop();
                log::warn!("[Client] Outbox full for {}, pong dropped", client.id());
            }
            Err(EnqueueError::Closed) => {
                log::debug!("[Client] {} retired before pong could be queued", client.id());
            }
        },
        MsgType::Pong => {
            log::trace!("[Client] Pong from {}", client.id());
        }
        MsgType::Test | MsgType::Other(_) => handler.on_message(client.id(), envelope),
    }
}

/// Sole writer to the connection.
///
/// Drains the outbox in FIFO order. Exits when the client is retired, the
/// outbox is closed, or a write fails; on exit it retires the client (so the
/// inbound loop stops too) and closes the connection.
pub(crate) async fn outbound_loop(
    client: ClientHandle,
    mut outbox: mpsc::Receiver<Bytes>,
    mut sink: Box<dyn FrameSink>,
    ping_interval: Option<Duration>,
) {
    let mut keepalive = ping_interval.map(|period| {
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    });
    let ping = Envelope::ping().encode();

    loop {
        let frame = tokio::select! {
            biased;
            () = client.retired() => break,
            frame = outbox.recv() => match frame {
                Some(frame) => frame,
                None => {
                    log::debug!("[Client] Outbox closed for {}", client.id());
                    break;
                }
            },
            () = next_tick(keepalive.as_mut()) => ping.clone(),
        };

        let written = tokio::select! {
            biased;
            () = client.retired() => break,
            written = sink.send_frame(frame) => written,
        };
        if let Err(e) = written {
            log::error!("[Client] Write error for {}: {e}", client.id());
            break;
        }
    }

    client.retire();
    outbox.close();
    let mut abandoned = 0usize;
    while outbox.try_recv().is_ok() {
        abandoned += 1;
    }
    if abandoned > 0 {
        log::debug!(
            "[Client] Discarded {} queued frames for {}",
            abandoned,
            client.id()
        );
    }

    match tokio::time::timeout(CLOSE_TIMEOUT, sink.close()).await {
        Ok(Ok(())) => log::debug!("[Client] Connection closed for {}", client.id()),
        Ok(Err(e)) => log::debug!("[Client] Close failed for {}: {e}", client.id()),
        Err(_elapsed) => log::warn!("[Client] Close timed out for {}", client.id()),
    }
}

async fn next_tick(interval: Option<&mut tokio::time::Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::memory::{self, MemoryPeer};
    use crate::connection::Connection;
    use crate::hub::{Hub, HubSettings};
    use std::sync::Mutex;

    const WAIT: Duration = Duration::from_secs(2);

    /// Records forwarded envelopes.
    #[derive(Default)]
    struct Recorder {
        seen: Mutex<Vec<(ClientId, Envelope)>>,
    }

    impl InboundHandler for Recorder {
        fn on_message(&self, client: &ClientId, envelope: Envelope) {
            self.seen.lock().unwrap().push((client.clone(), envelope));
        }
    }

    fn start_hub(settings: HubSettings) -> HubHandle {
        let (hub, handle) = Hub::new(settings);
        tokio::spawn(hub.run());
        handle
    }

    async fn connect(hub: &HubHandle, remote: &str) -> (ClientHandle, MemoryPeer) {
        let (conn, peer) = memory::pair(remote);
        let client = hub
            .accept(conn)
            .await
            .expect("hub running")
            .expect("fresh id admitted");
        (client, peer)
    }

    async fn recv_envelope(peer: &mut MemoryPeer) -> Envelope {
        let frame = tokio::time::timeout(WAIT, peer.recv())
            .await
            .expect("Timed out waiting for frame")
            .expect("Connection closed");
        Envelope::decode(&frame).unwrap()
    }

    async fn wait_until_evicted(hub: &HubHandle, client: &ClientHandle) {
        for _ in 0..200 {
            if !hub.clients().await.unwrap().contains(client.id()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} was never evicted", client.id());
    }

    async fn wait_until_no_tasks(hub: &HubHandle) {
        for _ in 0..200 {
            if hub.active_tasks() == 0 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("{} client tasks still running", hub.active_tasks());
    }

    #[tokio::test]
    async fn test_ping_gets_exactly_one_pong() {
        let hub = start_hub(HubSettings::default());
        let (_client, mut peer) = connect(&hub, "10.0.0.1:5000").await;

        peer.send(Envelope::ping().encode());

        assert_eq!(recv_envelope(&mut peer).await, Envelope::pong());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(peer.try_recv().is_none(), "only one pong expected");
        assert!(!peer.is_closed());
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_end_connection() {
        let hub = start_hub(HubSettings::default());
        let (client, mut peer) = connect(&hub, "10.0.0.1:5001").await;

        peer.send(&b"{ definitely not json"[..]);
        peer.send(Envelope::ping().encode());

        assert_eq!(recv_envelope(&mut peer).await, Envelope::pong());
        assert!(!client.is_retired());
        assert!(hub.clients().await.unwrap().contains(client.id()));
    }

    #[tokio::test]
    async fn test_application_messages_reach_handler() {
        let recorder = Arc::new(Recorder::default());
        let settings = HubSettings::default().with_handler(Arc::clone(&recorder) as Arc<dyn InboundHandler>);
        let hub = start_hub(settings);
        let (client, mut peer) = connect(&hub, "10.0.0.1:5002").await;

        peer.send(Envelope::test("hi").encode());
        peer.send(Envelope::new(MsgType::Other(9), "later").encode());
        // Round-trip a ping so both frames above are known to be processed.
        peer.send(Envelope::ping().encode());
        recv_envelope(&mut peer).await;

        let seen = recorder.seen.lock().unwrap().clone();
        assert_eq!(
            seen,
            vec![
                (client.id().clone(), Envelope::test("hi")),
                (client.id().clone(), Envelope::new(MsgType::Other(9), "later")),
            ]
        );
    }

    #[tokio::test]
    async fn test_outbox_delivers_in_fifo_order() {
        let hub = start_hub(HubSettings::default());
        let (client, mut peer) = connect(&hub, "10.0.0.1:5003").await;

        for i in 0..20 {
            client.try_enqueue(Envelope::test(i.to_string()).encode()).unwrap();
        }

        for i in 0..20 {
            assert_eq!(recv_envelope(&mut peer).await, Envelope::test(i.to_string()));
        }
    }

    #[tokio::test]
    async fn test_peer_hang_up_evicts_and_stops_tasks() {
        let hub = start_hub(HubSettings::default());
        let (client, mut peer) = connect(&hub, "10.0.0.1:5004").await;
        assert_eq!(hub.active_tasks(), 2);

        peer.hang_up();

        wait_until_evicted(&hub, &client).await;
        tokio::time::timeout(WAIT, client.retired()).await.expect("client retired");
        wait_until_no_tasks(&hub).await;
        assert!(peer.is_closed(), "outbound loop closes the connection");
    }

    #[tokio::test]
    async fn test_read_error_evicts() {
        let hub = start_hub(HubSettings::default());
        let (client, peer) = connect(&hub, "10.0.0.1:5005").await;

        assert_eq!(hub.active_tasks(), 2);

        peer.send_error(ConnectionError::Io("connection reset".to_string()));

        wait_until_evicted(&hub, &client).await;
        assert!(client.is_retired());
        wait_until_no_tasks(&hub).await;
        assert_eq!(hub.active_tasks(), 0);
        assert!(peer.is_closed(), "outbound loop closes the connection");
    }

    #[tokio::test]
    async fn test_idle_timeout_error_keeps_sub_second_precision() {
        let (conn, _peer) = memory::pair("10.0.0.1:5013");
        let (mut source, _sink) = conn.split();

        let err = recv_with_timeout(source.as_mut(), Some(Duration::from_millis(50)))
            .await
            .unwrap_err();

        match err {
            ConnectionError::Io(message) => assert!(message.contains("50ms"), "{message}"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_write_error_retires_both_loops() {
        let hub = start_hub(HubSettings::default());
        let (client, peer) = connect(&hub, "10.0.0.1:5006").await;

        peer.fail_writes();
        client.try_enqueue(Envelope::test("doomed").encode()).unwrap();

        tokio::time::timeout(WAIT, client.retired()).await.expect("client retired");
        wait_until_evicted(&hub, &client).await;
        assert!(peer.is_closed());
    }

    #[tokio::test]
    async fn test_retire_closes_connection_and_rejects_frames() {
        let hub = start_hub(HubSettings::default());
        let (client, mut peer) = connect(&hub, "10.0.0.1:5007").await;

        client.retire();

        assert!(tokio::time::timeout(WAIT, peer.recv()).await.unwrap().is_none());
        assert_eq!(
            client.try_enqueue(Envelope::test("late").encode()),
            Err(EnqueueError::Closed)
        );
        wait_until_evicted(&hub, &client).await;
    }

    #[tokio::test]
    async fn test_idle_timeout_evicts_silent_peer() {
        let settings = HubSettings::default().with_idle_timeout(Some(Duration::from_millis(50)));
        let hub = start_hub(settings);
        let (client, _peer) = connect(&hub, "10.0.0.1:5008").await;

        wait_until_evicted(&hub, &client).await;
        assert!(client.is_retired());
    }

    #[tokio::test]
    async fn test_keepalive_sends_pings() {
        let settings = HubSettings::default().with_ping_interval(Some(Duration::from_millis(20)));
        let hub = start_hub(settings);
        let (_client, mut peer) = connect(&hub, "10.0.0.1:5009").await;

        assert_eq!(recv_envelope(&mut peer).await, Envelope::ping());
        assert_eq!(recv_envelope(&mut peer).await, Envelope::ping());
    }

    #[test]
    fn test_try_enqueue_reports_full() {
        let (client, _rx) = ClientHandle::new("10.0.0.2:1", 1, CancellationToken::new());
        assert_eq!(client.try_enqueue(Bytes::from_static(b"a")), Ok(()));
        assert_eq!(
            client.try_enqueue(Bytes::from_static(b"b")),
            Err(EnqueueError::Full)
        );
        assert_eq!(client.outbox_free(), 0);
    }

    #[test]
    fn test_serials_distinguish_reused_ids() {
        let (a, _rx_a) = ClientHandle::new("10.0.0.2:2", 1, CancellationToken::new());
        let (b, _rx_b) = ClientHandle::new("10.0.0.2:2", 1, CancellationToken::new());
        assert_eq!(a.id(), b.id());
        assert!(!a.same_connection(&b));
        assert!(a.same_connection(&a.clone()));
    }
}
