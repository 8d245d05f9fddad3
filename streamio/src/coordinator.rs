//! Routes transport lifecycle events into per-session bridge pairs and
//! runs the user's processing logic on a dedicated worker thread.
//!
//! Flow:
//! 1. Open event: build the bridge pair, register it, spawn the worker
//! 2. Data / idle / error events: forward into the input bridge
//! 3. Send acknowledgements and failures: forward into the output bridge
//! 4. Close event: close both bridges, drop the entry, reap the worker

use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::JoinHandle;

use bytes::Bytes;

use crate::bridge::input::{SessionInputBridge, SessionReader};
use crate::bridge::output::{SessionOutputBridge, SessionWriter};
use crate::config::BridgeConfig;
use crate::error::{BridgeError, TransportError};
use crate::session::{IdleKind, SessionId, TransportSession};

/// Per-session processing logic, run on a dedicated worker thread.
///
/// Implementations block freely on the reader and writer; they never run
/// on the transport's dispatch thread.
pub trait SessionHandler: Send + Sync + 'static {
    fn process(&self, session: SessionId, reader: SessionReader, writer: SessionWriter);
}

impl<F> SessionHandler for F
where
    F: Fn(SessionId, SessionReader, SessionWriter) + Send + Sync + 'static,
{
    fn process(&self, session: SessionId, reader: SessionReader, writer: SessionWriter) {
        self(session, reader, writer)
    }
}

/// Lifecycle phase of a registered session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionPhase {
    Open,
    Closing,
}

/// Everything the coordinator owns for one live session.
struct BridgeEntry {
    phase: SessionPhase,
    session: Arc<dyn TransportSession>,
    input: Arc<SessionInputBridge>,
    output: Arc<SessionOutputBridge>,
    worker: Option<JoinHandle<()>>,
}

/// Owns the bridge pair for every live session and routes transport
/// events into it.
///
/// Event methods are invoked from the transport's dispatch thread and
/// only ever perform producer operations; they never wait on consumer
/// progress. Exactly one entry exists per live session.
pub struct BridgeCoordinator {
    config: BridgeConfig,
    handler: Arc<dyn SessionHandler>,
    entries: Mutex<HashMap<SessionId, BridgeEntry>>,
    retired: Mutex<Vec<JoinHandle<()>>>,
}

impl BridgeCoordinator {
    pub fn new(config: BridgeConfig, handler: Arc<dyn SessionHandler>) -> Self {
        Self {
            config,
            handler,
            entries: Mutex::new(HashMap::new()),
            retired: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<SessionId, BridgeEntry>> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn retired(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.retired.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register a freshly opened session and start its worker.
    ///
    /// A duplicate session id is a programming defect in the transport
    /// wiring and is rejected as [`BridgeError::IllegalState`].
    pub fn on_open(&self, session: Arc<dyn TransportSession>) -> Result<(), BridgeError> {
        let id = session.id();
        let mut entries = self.entries();
        if entries.contains_key(&id) {
            return Err(BridgeError::IllegalState(format!(
                "session {id} is already registered"
            )));
        }

        let input = Arc::new(SessionInputBridge::new(id, self.config.read_timeout()));
        let output = Arc::new(SessionOutputBridge::new(
            Arc::clone(&session),
            self.config.write_timeout(),
        ));

        // The handler must never run inline here: this is the transport's
        // dispatch thread, and blocking it on the bridge pair it just
        // created would deadlock the session.
        let worker = {
            let handler = Arc::clone(&self.handler);
            let session = Arc::clone(&session);
            let input = Arc::clone(&input);
            let output = Arc::clone(&output);
            std::thread::Builder::new()
                .name(format!("streamio-session-{id}"))
                .spawn(move || run_worker(handler, session, input, output))
                .map_err(|e| BridgeError::WorkerSpawn(e.to_string()))?
        };

        entries.insert(
            id,
            BridgeEntry {
                phase: SessionPhase::Open,
                session,
                input,
                output,
                worker: Some(worker),
            },
        );
        tracing::debug!(session = %id, "Session opened");
        Ok(())
    }

    /// Forward an inbound chunk to the session's input bridge.
    pub fn on_data(&self, id: SessionId, chunk: Bytes) -> Result<(), BridgeError> {
        let entries = self.entries();
        let entry = lookup(&entries, id)?;
        entry.input.deliver(chunk);
        Ok(())
    }

    /// Handle a transport idle notification.
    ///
    /// Read idle with a configured read timeout counts as a transport
    /// failure: the input bridge records the cause and the session is
    /// closed. Write idle is observed only.
    pub fn on_idle(&self, id: SessionId, kind: IdleKind) -> Result<(), BridgeError> {
        let mut entries = self.entries();
        let entry = lookup_mut(&mut entries, id)?;
        match kind {
            IdleKind::ReadIdle if self.config.read_timeout().is_some() => {
                tracing::warn!(session = %id, "Read idle timeout exceeded; closing session");
                entry.input.fail(TransportError::ReadIdle);
                initiate_close(entry, id);
            }
            IdleKind::ReadIdle => {
                tracing::trace!(session = %id, "Read idle without configured timeout");
            }
            IdleKind::WriteIdle => {
                tracing::trace!(session = %id, "Write idle");
            }
        }
        Ok(())
    }

    /// Record a transport-level failure and initiate session close.
    pub fn on_error(&self, id: SessionId, cause: TransportError) -> Result<(), BridgeError> {
        let mut entries = self.entries();
        let entry = lookup_mut(&mut entries, id)?;
        tracing::warn!(session = %id, %cause, "Transport error");
        entry.input.fail(cause);
        initiate_close(entry, id);
        Ok(())
    }

    /// Forward a delivery acknowledgement to the output bridge.
    pub fn on_send_ack(&self, id: SessionId, bytes: usize) -> Result<(), BridgeError> {
        let entries = self.entries();
        let entry = lookup(&entries, id)?;
        entry.output.acknowledge(bytes);
        Ok(())
    }

    /// Forward an outbound send failure to the output bridge.
    ///
    /// Send failures surface to the blocked `write`/`flush` caller; they
    /// do not route through the input bridge.
    pub fn on_send_error(&self, id: SessionId, cause: TransportError) -> Result<(), BridgeError> {
        let entries = self.entries();
        let entry = lookup(&entries, id)?;
        entry.output.fail(cause);
        Ok(())
    }

    /// Tear down a closed session: close both bridges, drop the entry.
    ///
    /// The worker is joined inline only when it has already finished;
    /// otherwise it is parked for [`Self::join_workers`], because this
    /// thread must keep pumping transport events.
    pub fn on_close(&self, id: SessionId) -> Result<(), BridgeError> {
        let mut entry = {
            let mut entries = self.entries();
            let Some(mut entry) = entries.remove(&id) else {
                return Err(BridgeError::IllegalState(format!(
                    "no registered session {id}"
                )));
            };
            entry.phase = SessionPhase::Closing;
            entry
        };

        entry.input.close();
        entry.output.shutdown();

        if let Some(worker) = entry.worker.take() {
            if worker.is_finished() {
                let _ = worker.join();
            } else {
                self.retired().push(worker);
            }
        }
        tracing::debug!(session = %id, "Session closed");
        Ok(())
    }

    /// Join every worker whose session has already closed.
    ///
    /// Blocking; for consumer-side shutdown paths and tests, never for the
    /// dispatch thread.
    pub fn join_workers(&self) {
        let retired = std::mem::take(&mut *self.retired());
        for worker in retired {
            let _ = worker.join();
        }
    }

    /// Number of currently registered sessions.
    pub fn session_count(&self) -> usize {
        self.entries().len()
    }
}

fn lookup<'a>(
    entries: &'a HashMap<SessionId, BridgeEntry>,
    id: SessionId,
) -> Result<&'a BridgeEntry, BridgeError> {
    entries
        .get(&id)
        .ok_or_else(|| BridgeError::IllegalState(format!("no registered session {id}")))
}

fn lookup_mut<'a>(
    entries: &'a mut HashMap<SessionId, BridgeEntry>,
    id: SessionId,
) -> Result<&'a mut BridgeEntry, BridgeError> {
    entries
        .get_mut(&id)
        .ok_or_else(|| BridgeError::IllegalState(format!("no registered session {id}")))
}

fn initiate_close(entry: &mut BridgeEntry, id: SessionId) {
    if entry.phase == SessionPhase::Open {
        entry.phase = SessionPhase::Closing;
        entry.session.close();
    } else {
        tracing::trace!(session = %id, "Session already closing");
    }
}

fn run_worker(
    handler: Arc<dyn SessionHandler>,
    session: Arc<dyn TransportSession>,
    input: Arc<SessionInputBridge>,
    output: Arc<SessionOutputBridge>,
) {
    let id = session.id();
    let reader = SessionReader::new(Arc::clone(&input));
    let writer = SessionWriter::new(Arc::clone(&output));

    let outcome = panic::catch_unwind(AssertUnwindSafe(|| handler.process(id, reader, writer)));
    if outcome.is_err() {
        tracing::error!(session = %id, "Session handler panicked");
    }

    // Worker completion drives the teardown: flush whatever the handler
    // left behind, then ask the transport to close so the close event
    // releases the entry.
    output.close();
    input.close();
    session.close();
    tracing::debug!(session = %id, "Session worker finished");
}
