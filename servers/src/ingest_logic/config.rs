use clap::Parser;
use lib_ingest::{ConfigError, EngineConfig, ForwarderConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser, Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
#[clap(about = "TCP line ingestion server", version)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[clap(long, env = "INGEST_TOPIC", help = "Topic stamped on every ingested record.")]
    pub topic: Option<String>,

    #[clap(long, env = "INGEST_LISTEN_ADDRESS", help = "IP address to accept client connections on.")]
    pub listen_address: Option<String>,

    #[clap(long, env = "INGEST_PORT", help = "Port to listen on for client connections.")]
    pub port: Option<u16>,

    #[clap(long, env = "INGEST_ACCEPT_TIMEOUT_MS", help = "Upper bound in milliseconds for one accept attempt.")]
    pub accept_timeout_ms: Option<u64>,

    #[clap(long, env = "INGEST_BATCH_CAP", help = "Lines read from one connection per poll cycle.")]
    pub batch_cap: Option<usize>,

    #[clap(long, env = "INGEST_POLL_INTERVAL_MS", help = "Milliseconds between poll cycles.")]
    pub poll_interval_ms: Option<u64>,

    #[clap(long, env = "INGEST_CONFIG_PATH", help = "Path to the JSON configuration file.")]
    pub config_path: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_DIR", help = "Directory for log files.")]
    pub log_dir: Option<PathBuf>,

    #[clap(long, env = "INGEST_LOG_LEVEL", help = "Logging level (trace, debug, info, warn, error).")]
    pub log_level: Option<String>,

    #[clap(long, env = "INGEST_FORWARD_TO", help = "host:port of a write endpoint; records are printed to stdout when absent.")]
    pub forward_to: Option<String>,

    #[clap(long, env = "INGEST_FORWARD_TIMEOUT_SECS", help = "Timeout in seconds for one forwarded write.")]
    pub forward_timeout_secs: Option<u64>,
}

impl Config {
    // Merge two Config structs, where 'other' overrides 'self' for Some values
    fn merge(self, other: Config) -> Config {
        Config {
            topic: other.topic.or(self.topic),
            listen_address: other.listen_address.or(self.listen_address),
            port: other.port.or(self.port),
            accept_timeout_ms: other.accept_timeout_ms.or(self.accept_timeout_ms),
            batch_cap: other.batch_cap.or(self.batch_cap),
            poll_interval_ms: other.poll_interval_ms.or(self.poll_interval_ms),
            config_path: other.config_path.or(self.config_path),
            log_dir: other.log_dir.or(self.log_dir),
            log_level: other.log_level.or(self.log_level),
            forward_to: other.forward_to.or(self.forward_to),
            forward_timeout_secs: other.forward_timeout_secs.or(self.forward_timeout_secs),
        }
    }

    pub fn defaults() -> Config {
        Config {
            listen_address: Some(lib_ingest::configs::config_engine::DEFAULT_LISTEN_ADDRESS.to_string()),
            port: Some(lib_ingest::configs::config_engine::DEFAULT_PORT),
            accept_timeout_ms: Some(lib_ingest::configs::config_engine::DEFAULT_ACCEPT_TIMEOUT_MS),
            batch_cap: Some(lib_ingest::configs::config_engine::DEFAULT_BATCH_CAP),
            poll_interval_ms: Some(100),
            log_dir: Some(PathBuf::from("./logs")),
            log_level: Some("info".to_string()),
            forward_timeout_secs: Some(10),
            ..Default::default()
        }
    }

    /// The engine settings. Fails if no topic was configured anywhere.
    pub fn engine_config(&self) -> Result<EngineConfig, ConfigError> {
        let topic = self.topic.clone().ok_or(ConfigError::Missing("topic"))?;
        let mut engine = EngineConfig::new(topic);
        if let Some(address) = &self.listen_address {
            engine = engine.with_listen_address(address.clone());
        }
        if let Some(port) = self.port {
            engine = engine.with_port(port);
        }
        if let Some(timeout) = self.accept_timeout_ms {
            engine = engine.with_accept_timeout_ms(timeout);
        }
        if let Some(cap) = self.batch_cap {
            engine = engine.with_batch_cap(cap);
        }
        engine.validate()?;
        Ok(engine)
    }

    pub fn forwarder_config(&self) -> Option<ForwarderConfig> {
        self.forward_to.as_ref().map(|endpoint| {
            let mut forwarder = ForwarderConfig::new(endpoint.clone());
            if let Some(secs) = self.forward_timeout_secs {
                forwarder.timeout = Duration::from_secs(secs);
            }
            forwarder
        })
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.unwrap_or(100).max(1))
    }

    pub fn log_dir(&self) -> PathBuf {
        self.log_dir.clone().unwrap_or_else(|| PathBuf::from("./logs"))
    }

    pub fn log_level(&self) -> String {
        self.log_level.clone().unwrap_or_else(|| "info".to_string())
    }
}

/// Reads a JSON config file. Missing or unreadable files yield `None`.
fn read_config_file(path: &Path) -> Option<Config> {
    if !path.exists() {
        log::info!("Config file not found at {}. Using defaults and environment/CLI variables.", path.display());
        return None;
    }
    match fs::read_to_string(path) {
        Ok(config_str) => match serde_json::from_str::<Config>(&config_str) {
            Ok(file_config) => Some(file_config),
            Err(e) => {
                log::warn!("Failed to parse config file {}: {}. Falling back to other sources.", path.display(), e);
                None
            }
        },
        Err(e) => {
            log::warn!("Failed to read config file {}: {}. Falling back to other sources.", path.display(), e);
            None
        }
    }
}

/// Layers defaults, the config file and CLI/env values, later sources winning.
pub fn resolve_config(cli_args: Config) -> Config {
    let config_file_path = cli_args
        .config_path
        .clone()
        .unwrap_or_else(|| PathBuf::from("server_ingest.conf"));

    let mut current_config = Config::defaults();
    if let Some(file_config) = read_config_file(&config_file_path) {
        current_config = current_config.merge(file_config);
    }

    // clap has already folded environment variables into the CLI values.
    current_config.merge(cli_args)
}

pub fn load_config() -> Config {
    resolve_config(Config::parse())
}
