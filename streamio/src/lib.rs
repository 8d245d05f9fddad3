//! streamio: blocking stream bridges over asynchronous session transports.
//!
//! An event-driven transport delivers inbound chunks on a shared dispatch
//! thread and accepts outbound data through a non-blocking send that is
//! acknowledged asynchronously. This crate turns each such session into a
//! pair of ordinary blocking byte streams — [`SessionReader`] and
//! [`SessionWriter`], implementing `std::io::Read`/`Write` — served to a
//! dedicated per-session worker thread, without ever blocking the
//! transport's dispatch thread.
//!
//! The [`BridgeCoordinator`] owns one bridge pair per live session, routes
//! transport lifecycle events into it, and runs the user's
//! [`SessionHandler`] on the worker. The [`loopback`] module provides an
//! in-process transport for tests and single-process embedding.

pub mod bridge;
mod config;
mod coordinator;
mod error;
pub mod loopback;
mod session;

pub use bridge::input::{SessionInputBridge, SessionReader};
pub use bridge::output::{SessionOutputBridge, SessionWriter};
pub use bridge::state::TerminalState;
pub use config::BridgeConfig;
pub use coordinator::{BridgeCoordinator, SessionHandler};
pub use error::{BridgeError, TransportError};
pub use session::{IdleKind, SessionId, TransportSession};
