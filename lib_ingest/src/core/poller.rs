//! # Batch Poller
//!
//! One poll cycle is one sweep over the [`ConnectionRegistry`]:
//!
//! 1. Pending replies from earlier cycles are flushed.
//! 2. Up to `batch_cap` lines are read from the connection. A connection with
//!    no complete line ready yields nothing and costs nothing.
//! 3. An empty line is dropped. The line `version` is answered with
//!    [`VERSION_REPLY`] and is not emitted. Every other line becomes a [`Record`].
//! 4. A [`ConnectionFault`] on any read or write ends that connection's turn;
//!    it is closed and removed from the registry. Other connections are unaffected
//!    and the cycle itself never fails.
//!
//! The cap is what keeps one chatty client from monopolising a cycle: lines left
//! over stay buffered and are picked up on the next cycle, after every other
//! connection has had its turn.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::core::connection::{Connection, ConnectionFault};
use crate::core::registry::{ConnectionRegistry, Visit};

/// The inline command answered by the engine instead of being ingested.
pub const CONTROL_TOKEN: &str = "version";

/// Fixed identification returned for [`CONTROL_TOKEN`], sent followed by `\n`.
pub const VERSION_REPLY: &str =
    r#"{"repo":"github.com/ytyou/ticktock.git","version":"1.0.0","branch":"main"}"#;

/// One ingested line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Record {
    pub topic: String,
    pub payload: String,
    pub timestamp: DateTime<Utc>,
}

impl Record {
    pub fn new(topic: impl Into<String>, payload: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn timestamp_millis(&self) -> i64 {
        self.timestamp.timestamp_millis()
    }
}

pub struct BatchPoller {
    topic: String,
    batch_cap: usize,
    reply: Bytes,
}

impl BatchPoller {
    pub fn new(topic: impl Into<String>, batch_cap: usize) -> Self {
        let mut reply = Vec::with_capacity(VERSION_REPLY.len() + 1);
        reply.extend_from_slice(VERSION_REPLY.as_bytes());
        reply.push(b'\n');

        Self {
            topic: topic.into(),
            batch_cap: batch_cap.max(1),
            reply: Bytes::from(reply),
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn batch_cap(&self) -> usize {
        self.batch_cap
    }

    /// Sweeps every registered connection once.
    ///
    /// Returns `None` when the cycle produced no records; that is the common
    /// idle case, not an error. Records are ordered by registry position, then
    /// by arrival within a connection.
    pub fn poll(&self, registry: &ConnectionRegistry) -> Option<Vec<Record>> {
        let mut records = Vec::new();

        let removed = registry.for_each_removable(|conn| match self.drain(conn, &mut records) {
            Ok(()) => Visit::Keep,
            Err(fault) => {
                match fault {
                    ConnectionFault::Closed => {
                        log::info!("Connection {} ({}) closed by peer", conn.id(), conn.peer())
                    }
                    ref other => {
                        log::warn!("Connection {} ({}) dropped: {}", conn.id(), conn.peer(), other)
                    }
                }
                conn.close();
                Visit::Remove
            }
        });

        if removed > 0 {
            log::debug!("Poll cycle retired {} connection(s), {} remain", removed, registry.len());
        }

        if records.is_empty() {
            None
        } else {
            log::trace!("Poll cycle produced {} record(s)", records.len());
            Some(records)
        }
    }

    /// Takes one connection's turn, appending its records to `records`.
    fn drain(&self, conn: &mut Connection, records: &mut Vec<Record>) -> Result<(), ConnectionFault> {
        conn.flush()?;

        for _ in 0..self.batch_cap {
            let Some(line) = conn.read_line()? else {
                break;
            };

            if line.is_empty() {
                continue;
            }

            if line == CONTROL_TOKEN {
                conn.write_reply(&self.reply)?;
                log::debug!("Served version to connection {} ({})", conn.id(), conn.peer());
                continue;
            }

            records.push(Record::new(self.topic.as_str(), line));
        }

        Ok(())
    }
}
