//! # Core Engine Module
//!
//! The ingestion engine proper. Components, leaves first:
//!
//! - **`connection`**: one accepted client socket with non-blocking line reads
//!   and buffered replies.
//! - **`registry`**: the live connection set. The acceptor feeds it through a
//!   channel; the poller sweeps it and prunes faulted entries.
//! - **`acceptor`**: the background task that owns the listening socket and
//!   admits clients until it is cancelled.
//! - **`poller`**: one sweep over the registry producing [`Record`]s, with a
//!   per-connection line cap and the inline `version` command.
//! - **`engine`**: the composition root exposing `start` / `poll` / `stop`.

/// A single accepted client stream.
pub mod connection;
/// The concurrently fed, poll-swept set of live connections.
pub mod registry;
/// The background accept loop.
pub mod acceptor;
/// The per-cycle sweep turning buffered lines into records.
pub mod poller;
/// The start/poll/stop composition root.
pub mod engine;

// --- Public API Re-exports ---
pub use connection::{Connection, ConnectionFault};
pub use registry::{ConnectionRegistry, Visit};
pub use acceptor::{AcceptErrorAction, Acceptor, AcceptorHandle, AcceptorState};
pub use poller::{BatchPoller, Record};
pub use engine::{EngineError, EngineState, IngestionEngine};
