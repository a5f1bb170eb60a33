//! # lib_ingest
//!
//! Line ingestion over many concurrent TCP connections. A background acceptor
//! admits clients into a shared registry while an externally scheduled poll
//! cycle drains a bounded number of lines from every live connection and
//! hands them out as [`Record`]s.

#![forbid(unsafe_code)]

pub mod configs;
pub mod core;
#[cfg(feature = "forward")]
pub mod forward;

// Re-export everything a host process needs to run the engine.
pub use crate::configs::config_engine::{ConfigError, EngineConfig};
pub use crate::core::acceptor::{AcceptErrorAction, Acceptor, AcceptorHandle, AcceptorState};
pub use crate::core::connection::{Connection, ConnectionFault};
pub use crate::core::engine::{EngineError, EngineState, IngestionEngine};
pub use crate::core::poller::{BatchPoller, Record, CONTROL_TOKEN, VERSION_REPLY};
pub use crate::core::registry::{ConnectionRegistry, Visit};
#[cfg(feature = "forward")]
pub use crate::forward::http_forward::{ForwardError, ForwarderConfig, HttpForwarder};
