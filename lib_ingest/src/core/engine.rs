//! # Ingestion Engine
//!
//! The composition root handed to a scheduler. The contract is:
//!
//! - `start()` once: resolves the listen address, binds, empties the
//!   registry and spawns the [`Acceptor`]. A malformed address is an error. A
//!   failed bind is not: the engine logs it and keeps running without a listener.
//! - `poll()` repeatedly, never concurrently with itself: one [`BatchPoller`]
//!   sweep.
//! - `stop()` once: cancels the acceptor and waits for it to release the socket.
//!   Connections that were already admitted stay registered; later polls drain
//!   them or prune them when they fail.

use std::net::SocketAddr;
use std::sync::Arc;

use thiserror::Error;
use tokio::net::TcpListener;

use crate::configs::config_engine::{ConfigError, EngineConfig};
use crate::core::acceptor::{Acceptor, AcceptorHandle, AcceptorState};
use crate::core::poller::{BatchPoller, Record};
use crate::core::registry::ConnectionRegistry;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Invalid engine configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("Malformed listen address: {0}")]
    InvalidAddress(String),

    #[error("Engine is already running")]
    AlreadyRunning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Stopped,
    Running,
}

pub struct IngestionEngine {
    config: EngineConfig,
    registry: Arc<ConnectionRegistry>,
    poller: BatchPoller,
    acceptor: Option<AcceptorHandle>,
    state: EngineState,
}

impl IngestionEngine {
    /// Validates `config` and builds a stopped engine.
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        config.validate()?;
        let poller = BatchPoller::new(config.topic.clone(), config.batch_cap);

        Ok(Self {
            config,
            registry: Arc::new(ConnectionRegistry::new()),
            poller,
            acceptor: None,
            state: EngineState::Stopped,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Binds the listening socket and starts admitting clients.
    ///
    /// # Errors
    /// [`EngineError::InvalidAddress`] when the configured address does not parse,
    /// [`EngineError::AlreadyRunning`] when called twice without a `stop()`.
    pub async fn start(&mut self) -> Result<(), EngineError> {
        if self.state == EngineState::Running {
            return Err(EngineError::AlreadyRunning);
        }

        let addr = self
            .config
            .socket_addr()
            .map_err(|e| EngineError::InvalidAddress(e.to_string()))?;

        // Stragglers of a previous run are not carried over.
        let leftovers = self.registry.clear();
        if leftovers > 0 {
            log::info!("Closed {} connection(s) left over from the previous run", leftovers);
        }

        match TcpListener::bind(addr).await {
            Ok(listener) => {
                let acceptor = Acceptor::new(listener, Arc::clone(&self.registry), self.config.accept_timeout());
                self.acceptor = Some(acceptor.spawn());
            }
            Err(e) => {
                log::error!(
                    "Cannot listen on {}: {}. Continuing without accepting new connections.",
                    addr,
                    e
                );
                self.acceptor = None;
            }
        }

        self.state = EngineState::Running;
        log::info!("Ingestion engine started for topic '{}'", self.config.topic);
        Ok(())
    }

    /// Runs one poll cycle. Returns `None` when no records were produced.
    pub fn poll(&self) -> Option<Vec<Record>> {
        self.poller.poll(&self.registry)
    }

    /// Stops admitting clients. A second call does nothing.
    pub async fn stop(&mut self) {
        if self.state == EngineState::Stopped {
            return;
        }
        log::trace!("Stopping ingestion engine");

        if let Some(mut acceptor) = self.acceptor.take() {
            acceptor.terminate();
            acceptor.join().await;
        }

        self.state = EngineState::Stopped;
        log::info!(
            "Ingestion engine stopped, {} connection(s) still registered",
            self.registry.len()
        );
    }

    /// Whether a listener is admitting clients. `false` after a failed bind.
    pub fn is_accepting(&self) -> bool {
        self.acceptor
            .as_ref()
            .map(|a| a.state() == AcceptorState::Listening)
            .unwrap_or(false)
    }

    pub fn acceptor_state(&self) -> Option<AcceptorState> {
        self.acceptor.as_ref().map(AcceptorHandle::state)
    }

    /// The address actually bound, useful when the configured port is 0.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.acceptor.as_ref().and_then(AcceptorHandle::local_addr)
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }
}

impl Drop for IngestionEngine {
    fn drop(&mut self) {
        // The acceptor handle cancels its task when dropped.
        self.acceptor.take();
        self.registry.clear();
    }
}
