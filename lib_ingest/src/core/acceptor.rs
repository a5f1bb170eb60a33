//! # Acceptor
//!
//! A long-running task that owns the listening socket and admits every inbound
//! client into the [`ConnectionRegistry`], independent of how often the engine
//! is polled.
//!
//! ## Lifecycle
//! `Idle -> Listening -> Terminating -> Closed`
//!
//! - Each accept attempt is bounded by the configured accept timeout. A timeout
//!   is the normal idle case and simply starts the next attempt.
//! - [`AcceptorHandle::terminate`] cancels a `CancellationToken`. The loop races
//!   every accept attempt against that token, so termination does not wait for
//!   the timeout to elapse.
//! - Accept errors are sorted by [`AcceptErrorAction`]. Errors that concern a
//!   single pending client (aborted or reset before it was accepted) are skipped.
//!   Descriptor or memory exhaustion backs off for one accept timeout and
//!   retries. Anything else is terminal: the loop logs it and moves to
//!   `Terminating`.
//! - On `Closed` the listening socket has been dropped.

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::core::connection::Connection;
use crate::core::registry::ConnectionRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptorState {
    /// Constructed, loop not yet running.
    Idle,
    /// Accepting connections.
    Listening,
    /// Leaving the loop, either on request or after a terminal accept error.
    Terminating,
    /// Listening socket released.
    Closed,
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorAction {
    /// The failure belongs to one pending client; accept the next one.
    Skip,
    /// The process is out of a resource; wait one accept timeout, then retry.
    Backoff,
    /// The listener itself is unusable.
    Terminate,
}

// ENFILE and EMFILE on unix, WSAEMFILE on windows.
#[cfg(unix)]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[23, 24];
#[cfg(not(unix))]
const DESCRIPTOR_EXHAUSTION: &[i32] = &[10024];

impl AcceptErrorAction {
    pub fn classify(err: &io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock => AcceptErrorAction::Skip,
            io::ErrorKind::OutOfMemory => AcceptErrorAction::Backoff,
            _ => match err.raw_os_error() {
                Some(code) if DESCRIPTOR_EXHAUSTION.contains(&code) => AcceptErrorAction::Backoff,
                _ => AcceptErrorAction::Terminate,
            },
        }
    }
}

#[derive(Clone)]
struct SharedState(Arc<Mutex<AcceptorState>>);

impl SharedState {
    fn get(&self) -> AcceptorState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set(&self, next: AcceptorState) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            log::debug!("Acceptor state: {:?} -> {:?}", *state, next);
            *state = next;
        }
    }
}

pub struct Acceptor {
    listener: TcpListener,
    registry: Arc<ConnectionRegistry>,
    accept_timeout: Duration,
    cancel: CancellationToken,
    state: SharedState,
}

impl Acceptor {
    /// Takes ownership of an already bound listener.
    pub fn new(listener: TcpListener, registry: Arc<ConnectionRegistry>, accept_timeout: Duration) -> Self {
        Self {
            listener,
            registry,
            accept_timeout,
            cancel: CancellationToken::new(),
            state: SharedState(Arc::new(Mutex::new(AcceptorState::Idle))),
        }
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Spawns the accept loop on the current tokio runtime.
    pub fn spawn(self) -> AcceptorHandle {
        let cancel = self.cancel.clone();
        let state = self.state.clone();
        let local_addr = self.local_addr();
        let task = tokio::spawn(self.run());

        AcceptorHandle {
            cancel,
            state,
            local_addr,
            task: Some(task),
        }
    }

    async fn run(self) {
        let Acceptor {
            listener,
            registry,
            accept_timeout,
            cancel,
            state,
        } = self;

        state.set(AcceptorState::Listening);
        match listener.local_addr() {
            Ok(addr) => log::info!("Acceptor listening on {}", addr),
            Err(_) => log::info!("Acceptor listening"),
        }

        loop {
            if cancel.is_cancelled() {
                break;
            }

            let accepted = tokio::select! {
                _ = cancel.cancelled() => break,
                res = tokio::time::timeout(accept_timeout, listener.accept()) => res,
            };

            match accepted {
                Ok(Ok((stream, peer))) => {
                    let conn = Connection::new(stream, peer);
                    log::info!("Connection {} admitted from {}", conn.id(), peer);
                    registry.add(conn);
                }
                Err(_elapsed) => {
                    // Nothing pending within the timeout; check for termination and retry.
                    log::trace!("Accept timed out after {:?}", accept_timeout);
                }
                Ok(Err(e)) => match AcceptErrorAction::classify(&e) {
                    AcceptErrorAction::Skip => {
                        log::debug!("Pending connection lost before accept: {}", e);
                    }
                    AcceptErrorAction::Backoff => {
                        log::warn!("Accept failed: {}. Retrying in {:?}", e, accept_timeout);
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(accept_timeout) => {}
                        }
                    }
                    AcceptErrorAction::Terminate => {
                        log::error!("Accept failed, acceptor stopping: {}", e);
                        break;
                    }
                },
            }
        }

        state.set(AcceptorState::Terminating);
        drop(listener);
        state.set(AcceptorState::Closed);
        log::info!("Acceptor closed");
    }
}

/// Control surface for a spawned [`Acceptor`].
pub struct AcceptorHandle {
    cancel: CancellationToken,
    state: SharedState,
    local_addr: Option<SocketAddr>,
    task: Option<JoinHandle<()>>,
}

impl AcceptorHandle {
    pub fn state(&self) -> AcceptorState {
        self.state.get()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Requests the loop to stop. Returns immediately; use [`join`](Self::join)
    /// to wait until the listening socket is released.
    pub fn terminate(&self) {
        if !self.cancel.is_cancelled() {
            log::info!("Acceptor termination requested");
            self.cancel.cancel();
        }
    }

    /// Waits for the accept loop to exit. Later calls return at once.
    pub async fn join(&mut self) {
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                log::error!("Acceptor task ended abnormally: {}", e);
                self.state.set(AcceptorState::Closed);
            }
        }
    }
}

impl Drop for AcceptorHandle {
    fn drop(&mut self) {
        // An abandoned handle must not leave the listener running.
        self.cancel.cancel();
    }
}
