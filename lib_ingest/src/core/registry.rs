//! # Connection Registry
//!
//! The only state shared between the acceptor and the poll cycle.
//!
//! Admission goes through an unbounded channel, so `add` never waits on a sweep
//! in progress. A sweep first drains the channel into the live list, then takes
//! the list out from under the lock, visits every entry without holding any lock,
//! and puts the survivors back. Each entry is one [`Connection`] owning both the
//! read and the write side of its socket, so a visitor can never be handed the
//! two halves of different clients.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};

use tokio::sync::mpsc;

use crate::core::connection::Connection;

/// What a sweep visitor wants done with the entry it just saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

struct Inner {
    arrivals: mpsc::UnboundedReceiver<Connection>,
    live: Vec<Connection>,
}

impl Inner {
    fn admit_arrivals(&mut self) {
        while let Ok(conn) = self.arrivals.try_recv() {
            self.live.push(conn);
        }
    }
}

pub struct ConnectionRegistry {
    intake: mpsc::UnboundedSender<Connection>,
    inner: Mutex<Inner>,
    registered: AtomicUsize,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        let (intake, arrivals) = mpsc::unbounded_channel();
        Self {
            intake,
            inner: Mutex::new(Inner {
                arrivals,
                live: Vec::new(),
            }),
            registered: AtomicUsize::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A panicking visitor must not take the whole registry down with it.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends a connection. It becomes visible to the next sweep that starts
    /// after this call; a sweep already running may not see it.
    pub fn add(&self, conn: Connection) {
        self.registered.fetch_add(1, Ordering::AcqRel);
        if let Err(mpsc::error::SendError(mut conn)) = self.intake.send(conn) {
            // Unreachable while `self` owns the receiver.
            self.registered.fetch_sub(1, Ordering::AcqRel);
            conn.close();
        }
    }

    /// Number of registered connections, including ones admitted since the last sweep.
    pub fn len(&self) -> usize {
        self.registered.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Runs one pass over the current entries in registration order.
    ///
    /// Entries the visitor marks [`Visit::Remove`] are closed and dropped before
    /// this returns. Returns how many entries were removed.
    pub fn for_each_removable<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(&mut Connection) -> Visit,
    {
        let mut snapshot = {
            let mut inner = self.lock();
            inner.admit_arrivals();
            std::mem::take(&mut inner.live)
        };

        let mut removed = 0;
        snapshot.retain_mut(|conn| match visitor(conn) {
            Visit::Keep => true,
            Visit::Remove => {
                conn.close();
                removed += 1;
                false
            }
        });
        self.registered.fetch_sub(removed, Ordering::AcqRel);

        let mut inner = self.lock();
        // Only a concurrent sweep could have put entries back meanwhile; keep them after ours.
        let concurrent = std::mem::replace(&mut inner.live, snapshot);
        inner.live.extend(concurrent);

        removed
    }

    /// Closes and forgets every connection, admitted or still in the intake channel.
    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        inner.admit_arrivals();
        let mut count = 0;
        for mut conn in inner.live.drain(..) {
            conn.close();
            count += 1;
        }
        self.registered.fetch_sub(count, Ordering::AcqRel);
        count
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::connection::tests::pair;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_sweep_visits_in_registration_order() {
        let registry = ConnectionRegistry::new();
        let mut ids = Vec::new();
        let mut clients = Vec::new();
        for _ in 0..4 {
            let (conn, client) = pair().await;
            ids.push(conn.id());
            clients.push(client);
            registry.add(conn);
        }
        assert_eq!(registry.len(), 4);

        let mut seen = Vec::new();
        let removed = registry.for_each_removable(|conn| {
            seen.push(conn.id());
            Visit::Keep
        });
        assert_eq!(removed, 0);
        assert_eq!(seen, ids);
        assert_eq!(registry.len(), 4);
    }

    #[tokio::test]
    async fn test_removed_entries_are_closed_and_gone() {
        let registry = ConnectionRegistry::new();
        let mut clients = Vec::new();
        for _ in 0..5 {
            let (conn, client) = pair().await;
            clients.push(client);
            registry.add(conn);
        }

        let mut index = 0;
        let removed = registry.for_each_removable(|_| {
            index += 1;
            if index % 2 == 0 { Visit::Remove } else { Visit::Keep }
        });
        assert_eq!(removed, 2);
        assert_eq!(registry.len(), 3);

        let mut survivors = 0;
        registry.for_each_removable(|conn| {
            assert!(conn.is_live());
            survivors += 1;
            Visit::Keep
        });
        assert_eq!(survivors, 3);
    }

    #[tokio::test]
    async fn test_add_during_sweep_is_seen_next_pass() {
        let registry = ConnectionRegistry::new();
        let (first, _c1) = pair().await;
        let (late, _c2) = pair().await;
        let late_id = late.id();
        registry.add(first);

        let mut late = Some(late);
        let mut first_pass = Vec::new();
        registry.for_each_removable(|conn| {
            first_pass.push(conn.id());
            if let Some(conn) = late.take() {
                registry.add(conn);
            }
            Visit::Keep
        });
        assert!(!first_pass.contains(&late_id));
        assert_eq!(registry.len(), 2);

        let mut second_pass = Vec::new();
        registry.for_each_removable(|conn| {
            second_pass.push(conn.id());
            Visit::Keep
        });
        assert_eq!(second_pass.len(), 2);
        assert_eq!(second_pass[1], late_id);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_admission_and_sweeps_keep_count_consistent() {
        let registry = Arc::new(ConnectionRegistry::new());
        let mut pairs = Vec::new();
        for _ in 0..20 {
            pairs.push(pair().await);
        }
        let (conns, _clients): (Vec<_>, Vec<_>) = pairs.into_iter().unzip();

        let feeder = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                for conn in conns {
                    registry.add(conn);
                    tokio::task::yield_now().await;
                }
            })
        };

        let mut removed = 0;
        let mut toggle = false;
        while !feeder.is_finished() {
            removed += registry.for_each_removable(|_| {
                toggle = !toggle;
                if toggle { Visit::Remove } else { Visit::Keep }
            });
            tokio::task::yield_now().await;
        }
        feeder.await.unwrap();

        let mut remaining = 0;
        registry.for_each_removable(|_| {
            remaining += 1;
            Visit::Keep
        });
        assert_eq!(remaining + removed, 20);
        assert_eq!(registry.len(), remaining);
    }

    #[tokio::test]
    async fn test_clear_closes_everything() {
        let registry = ConnectionRegistry::new();
        let (a, _ca) = pair().await;
        let (b, _cb) = pair().await;
        registry.add(a);
        registry.add(b);
        assert_eq!(registry.clear(), 2);
        assert!(registry.is_empty());
    }
}
