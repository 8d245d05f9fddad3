//! Inbound half of the bridge pair: chunk-delivery events in, blocking
//! reads out.

use std::collections::VecDeque;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use bytes::{Buf, Bytes};

use crate::bridge::state::TerminalState;
use crate::error::{BridgeError, TransportError};
use crate::session::SessionId;

struct InputState {
    chunks: VecDeque<Bytes>,
    buffered: usize,
    terminal: TerminalState,
    /// Cause still owed to the reader that was blocked when the failure
    /// was recorded, in case a close lands before it wakes.
    owed: Option<TransportError>,
    waiting: usize,
}

/// Adapts transport chunk-delivery events to a blocking byte stream.
///
/// `deliver`, `fail` and `close` are the transport side and never wait;
/// `read` is the consumer side and the only operation permitted to block.
/// Chunks are read back in exact delivery order, and any chunk delivered
/// before a terminal transition stays readable until drained.
pub struct SessionInputBridge {
    session: SessionId,
    read_timeout: Option<Duration>,
    inner: Mutex<InputState>,
    available: Condvar,
}

impl SessionInputBridge {
    pub fn new(session: SessionId, read_timeout: Option<Duration>) -> Self {
        Self {
            session,
            read_timeout,
            inner: Mutex::new(InputState {
                chunks: VecDeque::new(),
                buffered: 0,
                terminal: TerminalState::Open,
                owed: None,
                waiting: 0,
            }),
            available: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, InputState> {
        // A reader that panicked mid-copy leaves the queue consistent;
        // keep serving instead of propagating the poison.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append an inbound chunk and wake a blocked reader.
    ///
    /// Transport side. Chunks arriving after the bridge turned terminal
    /// belong to a session that is tearing down and are dropped; that is
    /// not an error.
    pub fn deliver(&self, chunk: Bytes) {
        if chunk.is_empty() {
            return;
        }
        let mut state = self.lock();
        if state.terminal.is_terminal() {
            tracing::trace!(
                session = %self.session,
                bytes = chunk.len(),
                "Dropping chunk delivered after terminal state"
            );
            return;
        }
        state.buffered += chunk.len();
        state.chunks.push_back(chunk);
        self.available.notify_all();
    }

    /// Record a transport failure and wake every blocked reader.
    ///
    /// Transport side. The first terminal transition wins; reads observe
    /// the stored cause until an explicit close.
    pub fn fail(&self, cause: TransportError) {
        let mut state = self.lock();
        if state.terminal.is_terminal() {
            tracing::debug!(
                session = %self.session,
                %cause,
                "Ignoring failure reported after terminal state"
            );
            return;
        }
        state.terminal = TerminalState::Failed(cause);
        self.available.notify_all();
    }

    /// Close the read side. Idempotent, callable from either thread, never
    /// raises.
    ///
    /// A reader blocked at the moment of a prior failure is still owed
    /// that error exactly once; any read arriving after the close observes
    /// EOF.
    pub fn close(&self) {
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
        self.available.notify_all();
    }

    /// Bytes readable right now without blocking.
    pub fn buffered(&self) -> usize {
        self.lock().buffered
    }

    pub fn is_terminated(&self) -> bool {
        self.lock().terminal.is_terminal()
    }

    /// Blocking read. Consumer side only.
    ///
    /// Drains buffered chunks first, crossing chunk boundaries up to
    /// `buf.len()`. With an empty queue the call blocks until data
    /// arrives, the bridge closes (EOF, `Ok(0)`), the configured read
    /// timeout elapses, or a recorded failure is observed.
    pub fn read(&self, buf: &mut [u8]) -> Result<usize, BridgeError> {
        if buf.is_empty() {
            return Ok(0);
        }
        let deadline = self.read_timeout.map(|t| Instant::now() + t);
        let mut state = self.lock();
        let mut woke_from_wait = false;
        loop {
            if state.buffered > 0 {
                return Ok(drain_into(&mut state, buf));
            }
            match &state.terminal {
                TerminalState::Failed(cause) => {
                    return Err(BridgeError::Transport(cause.clone()));
                }
                TerminalState::Closed => {
                    if woke_from_wait && let Some(cause) = state.owed.take() {
                        return Err(BridgeError::Transport(cause));
                    }
                    return Ok(0);
                }
                _ => {}
            }

            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Err(BridgeError::ReadTimeout(
                        self.read_timeout.unwrap_or_default(),
                    ));
                }
                state.waiting += 1;
                let (guard, _) = self
                    .available
                    .wait_timeout(state, deadline - now)
                    .unwrap_or_else(|e| e.into_inner());
                state = guard;
            } else {
                state.waiting += 1;
                state = self
                    .available
                    .wait(state)
                    .unwrap_or_else(|e| e.into_inner());
            }
            state.waiting -= 1;
            woke_from_wait = true;
        }
    }
}

/// Copy buffered bytes into `buf`, crossing chunk boundaries, preserving
/// delivery order.
fn drain_into(state: &mut InputState, buf: &mut [u8]) -> usize {
    let mut copied = 0;
    while copied < buf.len() {
        let Some(front) = state.chunks.front_mut() else {
            break;
        };
        let n = front.len().min(buf.len() - copied);
        buf[copied..copied + n].copy_from_slice(&front[..n]);
        front.advance(n);
        copied += n;
        if front.is_empty() {
            state.chunks.pop_front();
        }
    }
    state.buffered -= copied;
    copied
}

/// Consumer-side [`io::Read`] handle over a shared input bridge.
pub struct SessionReader {
    bridge: Arc<SessionInputBridge>,
}

impl SessionReader {
    pub fn new(bridge: Arc<SessionInputBridge>) -> Self {
        Self { bridge }
    }

    pub fn bridge(&self) -> &SessionInputBridge {
        &self.bridge
    }
}

impl io::Read for SessionReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.bridge.read(buf).map_err(io::Error::from)
    }
}
