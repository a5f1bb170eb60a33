//! # Configuration Modules
//!
//! Typed configuration for the ingestion engine, loadable from serde sources
//! or from connector-style flat string properties.

/// Engine settings: topic, listen address, accept timeout and batch cap.
pub mod config_engine;
