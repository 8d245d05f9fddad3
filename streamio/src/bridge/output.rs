//! Outbound half of the bridge pair: blocking writes in, non-blocking
//! transport submissions out.

use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use crate::bridge::state::TerminalState;
use crate::error::{BridgeError, TransportError};
use crate::session::TransportSession;

struct OutputState {
    /// Bytes submitted to the transport whose acceptance has not been
    /// acknowledged yet.
    in_flight: usize,
    terminal: TerminalState,
    /// Cause still owed to the writer that was blocked when the failure
    /// was recorded, in case a teardown lands before it wakes.
    owed: Option<TransportError>,
    waiting: usize,
}

/// Adapts blocking writes to the transport's asynchronous send primitive.
///
/// `write` and `flush` are the consumer side and may block; `acknowledge`,
/// `fail` and `shutdown` are the transport side and never wait. The bridge
/// holds a non-owning reference to the session whose send queue it feeds.
pub struct SessionOutputBridge {
    session: Arc<dyn TransportSession>,
    write_timeout: Option<Duration>,
    inner: Mutex<OutputState>,
    progress: Condvar,
}

impl SessionOutputBridge {
    pub fn new(session: Arc<dyn TransportSession>, write_timeout: Option<Duration>) -> Self {
        Self {
            session,
            write_timeout,
            inner: Mutex::new(OutputState {
                in_flight: 0,
                terminal: TerminalState::Open,
                owed: None,
                waiting: 0,
            }),
            progress: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, OutputState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Blocking write. Consumer side only.
    ///
    /// The whole buffer is submitted before returning; partial acceptance
    /// by the transport is retried. While the transport refuses bytes
    /// (backlog above its threshold) the call waits for acknowledgements,
    /// bounded by the write timeout. Nothing is silently truncated.
    pub fn write(&self, data: &[u8]) -> Result<(), BridgeError> {
        if data.is_empty() {
            return Ok(());
        }
        let mut remaining = data;
        let mut deadline = self.write_timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        let mut woke_from_wait = false;
        loop {
            match &state.terminal {
                TerminalState::Open => {}
                TerminalState::Failed(cause) => {
                    return Err(BridgeError::Transport(cause.clone()));
                }
                TerminalState::EofPending | TerminalState::Closed => {
                    if woke_from_wait && let Some(cause) = state.owed.take() {
                        return Err(BridgeError::Transport(cause));
                    }
                    return Err(BridgeError::SessionClosed);
                }
            }

            // The send contract is O(1) enqueue-or-refuse, so holding the
            // lock here keeps acknowledgements from slipping between the
            // refusal and the wait below.
            match self.session.send(remaining) {
                Err(cause) => {
                    state.terminal = TerminalState::Failed(cause.clone());
                    self.progress.notify_all();
                    return Err(BridgeError::Transport(cause));
                }
                Ok(0) => {
                    state = self.wait_for_progress(state, deadline)?;
                    woke_from_wait = true;
                }
                Ok(accepted) => {
                    state.in_flight += accepted;
                    remaining = &remaining[accepted..];
                    if remaining.is_empty() {
                        return Ok(());
                    }
                    // Forward progress restarts the timeout window.
                    deadline = self.write_timeout.map(|t| Instant::now() + t);
                }
            }
        }
    }

    /// Blocking barrier. Consumer side only.
    ///
    /// Returns once every previously submitted byte has been accepted by
    /// the transport — not necessarily acknowledged by the peer.
    pub fn flush(&self) -> Result<(), BridgeError> {
        let deadline = self.write_timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        let mut woke_from_wait = false;
        loop {
            if let TerminalState::Failed(cause) = &state.terminal {
                return Err(BridgeError::Transport(cause.clone()));
            }
            if state.in_flight == 0 {
                return Ok(());
            }
            if state.terminal == TerminalState::Closed {
                if woke_from_wait && let Some(cause) = state.owed.take() {
                    return Err(BridgeError::Transport(cause));
                }
                // The remaining bytes will never be accepted.
                return Err(BridgeError::SessionClosed);
            }
            state = self.wait_for_progress(state, deadline)?;
            woke_from_wait = true;
        }
    }

    /// Graceful close: stop accepting writes, drain in-flight bytes
    /// (bounded by the write timeout), then half-close the transport.
    /// Idempotent and never raises.
    pub fn close(&self) {
        {
            let mut state = self.lock();
            if state.terminal != TerminalState::Open {
                return;
            }
            state.terminal = TerminalState::EofPending;
            self.progress.notify_all();

            let deadline = self.write_timeout.map(|t| Instant::now() + t);
            while state.in_flight > 0 && state.terminal == TerminalState::EofPending {
                match self.wait_for_progress(state, deadline) {
                    Ok(guard) => state = guard,
                    Err(_) => {
                        // Drain timed out; half-close regardless.
                        state = self.lock();
                        break;
                    }
                }
            }
            if state.terminal == TerminalState::EofPending {
                state.terminal = TerminalState::Closed;
            }
            self.progress.notify_all();
        }
        self.session.shutdown_send();
        tracing::debug!(session = %self.session.id(), "Output bridge closed");
    }

    /// Acknowledge transport acceptance of `n` previously submitted bytes.
    ///
    /// Transport side: this is the delivery-acknowledgement path of the
    /// asynchronous send. Wakes any blocked writer or flusher.
    pub fn acknowledge(&self, n: usize) {
        let mut state = self.lock();
        if n > state.in_flight {
            tracing::warn!(
                session = %self.session.id(),
                acknowledged = n,
                in_flight = state.in_flight,
                "Acknowledged more bytes than in flight"
            );
            state.in_flight = 0;
        } else {
            state.in_flight -= n;
        }
        self.progress.notify_all();
    }

    /// Record a transport send failure and wake every blocked caller.
    ///
    /// Transport side. Send failures surface to the blocked (or next)
    /// `write`/`flush` call; they never route through the input bridge.
    pub fn fail(&self, cause: TransportError) {
        let mut state = self.lock();
        match state.terminal {
            TerminalState::Open | TerminalState::EofPending => {
                state.terminal = TerminalState::Failed(cause);
                self.progress.notify_all();
            }
            _ => {
                tracing::debug!(
                    session = %self.session.id(),
                    %cause,
                    "Ignoring send failure after terminal state"
                );
            }
        }
    }

    /// Abrupt transport-driven close (session teardown). Never blocks.
    ///
    /// A writer blocked at the moment of a prior failure is still owed
    /// that error exactly once; any later write observes `SessionClosed`.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        match state.terminal.clone() {
            TerminalState::Closed => return,
            TerminalState::Failed(cause) => {
                if state.waiting > 0 && state.owed.is_none() {
                    state.owed = Some(cause);
                }
                state.terminal = TerminalState::Closed;
            }
            _ => state.terminal = TerminalState::Closed,
        }
        self.progress.notify_all();
    }

    /// Bytes submitted but not yet accepted by the transport.
    pub fn in_flight(&self) -> usize {
        self.lock().in_flight
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_terminal()
    }

    fn wait_for_progress<'a>(
        &'a self,
        mut state: MutexGuard<'a, OutputState>,
        deadline: Option<Instant>,
    ) -> Result<MutexGuard<'a, OutputState>, BridgeError> {
        if let Some(deadline) = deadline {
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::WriteTimeout(
                    self.write_timeout.unwrap_or_default(),
                ));
            }
            state.waiting += 1;
            let (guard, _) = self
                .progress
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        } else {
            state.waiting += 1;
            state = self.progress.wait(state).unwrap_or_else(|e| e.into_inner());
        }
        state.waiting -= 1;
        Ok(state)
    }
}

/// Consumer-side [`io::Write`] handle over a shared output bridge.
pub struct SessionWriter {
    bridge: Arc<SessionOutputBridge>,
}

impl SessionWriter {
    pub fn new(bridge: Arc<SessionOutputBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &SessionOutputBridge {
        &self.bridge
    }
}

impl io::Write for SessionWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.bridge.write(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.bridge.flush().map_err(io::Error::from)
    }
}
