//! In-process transport for tests and single-process embedding.
//!
//! One session, one pump task. The pump drains the session's bounded
//! outbound queue to the peer and fires delivery acknowledgements,
//! forwards peer bytes as data events, reports read idle after a quiet
//! period, and fires the close event when either side disconnects.
//! Requires a running tokio runtime.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{Notify, mpsc};
use tokio_util::sync::CancellationToken;

use crate::coordinator::BridgeCoordinator;
use crate::error::{BridgeError, TransportError};
use crate::session::{IdleKind, SessionId, TransportSession};

/// Loopback tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct LoopbackConfig {
    /// Outbound queue capacity in bytes; the backlog threshold beyond
    /// which `send` refuses data.
    pub capacity: usize,
    /// Fire a read-idle event after this long without inbound data.
    pub read_idle: Option<Duration>,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            capacity: 64 * 1024,
            read_idle: None,
        }
    }
}

struct Outbound {
    queue: VecDeque<Bytes>,
    queued: usize,
}

/// In-process [`TransportSession`] backed by a bounded byte queue.
pub struct LoopbackSession {
    id: SessionId,
    capacity: usize,
    outbound: Mutex<Outbound>,
    wakeup: Notify,
    send_shutdown: AtomicBool,
    close_requested: AtomicBool,
}

impl LoopbackSession {
    fn new(capacity: usize) -> Self {
        Self {
            id: SessionId::new(),
            capacity,
            outbound: Mutex::new(Outbound {
                queue: VecDeque::new(),
                queued: 0,
            }),
            wakeup: Notify::new(),
            send_shutdown: AtomicBool::new(false),
            close_requested: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Outbound> {
        self.outbound.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take everything currently queued. Called by the pump with the queue
    /// lock released before any coordinator callback.
    fn drain(&self) -> Vec<Bytes> {
        let mut out = self.lock();
        out.queued = 0;
        out.queue.drain(..).collect()
    }
}

impl TransportSession for LoopbackSession {
    fn id(&self) -> SessionId {
        self.id
    }

    fn send(&self, data: &[u8]) -> Result<usize, TransportError> {
        if self.close_requested.load(Ordering::Acquire) || self.send_shutdown.load(Ordering::Acquire)
        {
            return Err(TransportError::BrokenPipe);
        }
        let mut out = self.lock();
        let room = self.capacity.saturating_sub(out.queued);
        let n = room.min(data.len());
        if n > 0 {
            out.queue.push_back(Bytes::copy_from_slice(&data[..n]));
            out.queued += n;
            self.wakeup.notify_one();
        }
        Ok(n)
    }

    fn shutdown_send(&self) {
        self.send_shutdown.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }

    fn close(&self) {
        self.close_requested.store(true, Ordering::Release);
        self.wakeup.notify_one();
    }
}

/// Peer endpoint of a loopback session.
pub struct PeerHandle {
    to_session: mpsc::Sender<Bytes>,
    from_session: mpsc::Receiver<Bytes>,
    cancel: CancellationToken,
}

impl PeerHandle {
    /// Feed bytes to the session's inbound side.
    pub async fn send(&self, data: Bytes) -> Result<(), TransportError> {
        self.to_session
            .send(data)
            .await
            .map_err(|_| TransportError::BrokenPipe)
    }

    /// Next chunk the session wrote; `None` once the session is gone.
    pub async fn recv(&mut self) -> Option<Bytes> {
        self.from_session.recv().await
    }

    /// Disconnect the peer; the session observes a close event.
    pub fn close(&self) {
        self.cancel.cancel();
    }
}

/// Opens loopback sessions against a coordinator.
pub struct LoopbackConnector;

impl LoopbackConnector {
    /// Register a new session with `coordinator` and start its pump.
    pub fn open(
        coordinator: Arc<BridgeCoordinator>,
        config: LoopbackConfig,
    ) -> Result<(SessionId, PeerHandle), BridgeError> {
        let session = Arc::new(LoopbackSession::new(config.capacity));
        let id = session.id();
        coordinator.on_open(Arc::clone(&session) as Arc<dyn TransportSession>)?;

        let (to_session_tx, to_session_rx) = mpsc::channel(16);
        let (from_session_tx, from_session_rx) = mpsc::channel(16);
        let cancel = CancellationToken::new();

        tokio::spawn(pump(
            session,
            coordinator,
            to_session_rx,
            from_session_tx,
            cancel.clone(),
            config.read_idle,
        ));

        Ok((
            id,
            PeerHandle {
                to_session: to_session_tx,
                from_session: from_session_rx,
                cancel,
            },
        ))
    }
}

async fn pump(
    session: Arc<LoopbackSession>,
    coordinator: Arc<BridgeCoordinator>,
    mut inbound: mpsc::Receiver<Bytes>,
    outbound: mpsc::Sender<Bytes>,
    cancel: CancellationToken,
    read_idle: Option<Duration>,
) {
    let id = session.id();
    let mut last_inbound = tokio::time::Instant::now();

    loop {
        let idle_deadline = read_idle.map(|period| last_inbound + period);
        let idle = async move {
            match idle_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,

            _ = session.wakeup.notified() => {
                if !forward_outbound(&session, &coordinator, &outbound).await {
                    break;
                }
                if session.close_requested.load(Ordering::Acquire) {
                    break;
                }
            }

            chunk = inbound.recv() => {
                match chunk {
                    Some(chunk) => {
                        last_inbound = tokio::time::Instant::now();
                        if let Err(e) = coordinator.on_data(id, chunk) {
                            tracing::debug!(session = %id, error = %e, "Data event after teardown");
                            break;
                        }
                    }
                    // Peer disconnected.
                    None => break,
                }
            }

            _ = idle => {
                last_inbound = tokio::time::Instant::now();
                if let Err(e) = coordinator.on_idle(id, IdleKind::ReadIdle) {
                    tracing::debug!(session = %id, error = %e, "Idle event after teardown");
                    break;
                }
            }
        }
    }

    // Deliver whatever either side handed over before the close: queued
    // outbound chunks to the peer, queued inbound chunks to the bridge
    // (they stay readable ahead of the EOF), then report the close.
    let _ = forward_outbound(&session, &coordinator, &outbound).await;
    while let Ok(chunk) = inbound.try_recv() {
        if coordinator.on_data(id, chunk).is_err() {
            break;
        }
    }
    if let Err(e) = coordinator.on_close(id) {
        tracing::debug!(session = %id, error = %e, "Close event after teardown");
    }
    tracing::debug!(session = %id, "Loopback pump finished");
}

/// Move queued chunks to the peer, acknowledging each as accepted.
/// Returns `false` once the peer side is gone.
async fn forward_outbound(
    session: &LoopbackSession,
    coordinator: &BridgeCoordinator,
    outbound: &mpsc::Sender<Bytes>,
) -> bool {
    for chunk in session.drain() {
        let len = chunk.len();
        if outbound.send(chunk).await.is_err() {
            return false;
        }
        if let Err(e) = coordinator.on_send_ack(session.id(), len) {
            tracing::debug!(session = %session.id(), error = %e, "Ack after teardown");
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::input::SessionReader;
    use crate::bridge::output::SessionWriter;
    use crate::config::BridgeConfig;
    use crate::coordinator::SessionHandler;
    use std::io::{Read, Write};
    use std::time::Instant;

    fn echo_handler() -> impl SessionHandler {
        |_id: SessionId, mut reader: SessionReader, mut writer: SessionWriter| {
            let mut buf = [0u8; 64];
            loop {
                match reader.read(&mut buf) {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if writer.write_all(&buf[..n]).is_err() {
                            break;
                        }
                        if writer.flush().is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    async fn wait_for_teardown(coordinator: &BridgeCoordinator) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while coordinator.session_count() > 0 {
            assert!(Instant::now() < deadline, "session never tore down");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn echo_round_trip() {
        let coordinator = Arc::new(BridgeCoordinator::new(
            BridgeConfig::new(),
            Arc::new(echo_handler()),
        ));
        let (_id, mut peer) =
            LoopbackConnector::open(Arc::clone(&coordinator), LoopbackConfig::default()).unwrap();

        peer.send(Bytes::from_static(b"hello")).await.unwrap();
        let echoed = peer.recv().await.unwrap();
        assert_eq!(&echoed[..], b"hello");

        peer.send(Bytes::from_static(b" again")).await.unwrap();
        let echoed = peer.recv().await.unwrap();
        assert_eq!(&echoed[..], b" again");

        peer.close();
        wait_for_teardown(&coordinator).await;
        coordinator.join_workers();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn peer_disconnect_delivers_eof_to_the_worker() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handler = move |_id: SessionId, mut reader: SessionReader, _writer: SessionWriter| {
            let mut collected = Vec::new();
            let result = reader.read_to_end(&mut collected).map(|_| collected);
            tx.send(result).unwrap();
        };
        let coordinator = Arc::new(BridgeCoordinator::new(BridgeConfig::new(), Arc::new(handler)));
        let (_id, peer) =
            LoopbackConnector::open(Arc::clone(&coordinator), LoopbackConfig::default()).unwrap();

        peer.send(Bytes::from_static(b"last words")).await.unwrap();
        peer.close();

        let collected = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
        assert_eq!(collected, b"last words");

        wait_for_teardown(&coordinator).await;
        coordinator.join_workers();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn read_idle_tears_the_session_down() {
        let (tx, rx) = std::sync::mpsc::channel();
        let handler = move |_id: SessionId, mut reader: SessionReader, _writer: SessionWriter| {
            let mut buf = [0u8; 8];
            let result = reader.read(&mut buf).map_err(|e| e.kind());
            tx.send(result).unwrap();
        };
        let coordinator = Arc::new(BridgeCoordinator::new(
            BridgeConfig::new().with_read_timeout_millis(10_000),
            Arc::new(handler),
        ));
        let config = LoopbackConfig {
            read_idle: Some(Duration::from_millis(50)),
            ..LoopbackConfig::default()
        };
        let (_id, _peer) = LoopbackConnector::open(Arc::clone(&coordinator), config).unwrap();

        let result = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(result, Err(std::io::ErrorKind::TimedOut));

        wait_for_teardown(&coordinator).await;
        coordinator.join_workers();
    }

    #[tokio::test]
    async fn worker_writes_survive_worker_initiated_close() {
        let handler = |_id: SessionId, _reader: SessionReader, mut writer: SessionWriter| {
            writer.write_all(b"parting gift").unwrap();
            // Returning closes the session; the submitted bytes must
            // still reach the peer.
        };
        let coordinator = Arc::new(BridgeCoordinator::new(BridgeConfig::new(), Arc::new(handler)));
        let (_id, mut peer) =
            LoopbackConnector::open(Arc::clone(&coordinator), LoopbackConfig::default()).unwrap();

        let mut collected = Vec::new();
        while let Some(chunk) = peer.recv().await {
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, b"parting gift");

        wait_for_teardown(&coordinator).await;
        coordinator.join_workers();
    }

    #[tokio::test]
    async fn bounded_queue_applies_backpressure() {
        let handler = |_id: SessionId, _reader: SessionReader, mut writer: SessionWriter| {
            // Much larger than the queue capacity below.
            let payload = vec![0x42u8; 1024];
            writer.write_all(&payload).unwrap();
        };
        let coordinator = Arc::new(BridgeCoordinator::new(BridgeConfig::new(), Arc::new(handler)));
        let config = LoopbackConfig {
            capacity: 64,
            ..LoopbackConfig::default()
        };
        let (_id, mut peer) = LoopbackConnector::open(Arc::clone(&coordinator), config).unwrap();

        let mut received = 0;
        while received < 1024 {
            let chunk = peer.recv().await.expect("peer closed early");
            received += chunk.len();
        }
        assert_eq!(received, 1024);

        wait_for_teardown(&coordinator).await;
        coordinator.join_workers();
    }
}
