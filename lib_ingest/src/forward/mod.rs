//! # Outbound Forwarding
//!
//! The write-side collaborator of the engine: it takes the payload of a
//! [`Record`](crate::core::poller::Record) and delivers it to a remote write
//! endpoint over plain HTTP. Nothing in the core depends on this module; a host
//! process wires the two together.
//!
//! ## Contained Modules:
//!
//! - **`http_forward`**: a `reqwest` client posting `text/plain` bodies to
//!   `http://{endpoint}/api/write`, one request per payload, success on 200 only,
//!   no retries.

/// Plain-text HTTP writer for ingested payloads.
pub mod http_forward;
