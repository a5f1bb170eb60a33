use anyhow::{Context, Result};
use lib_ingest::{HttpForwarder, IngestionEngine};
use tokio::signal;

mod ingest_logic;
use ingest_logic::{config, logger, pump};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config();
    let engine_config = config.engine_config().context("Invalid engine configuration")?;
    logger::setup_logging(&config.log_dir(), &config.log_level(), &engine_config.topic)?;
    let sink = match config.forwarder_config() {
        Some(forward) => {
            let forwarder = HttpForwarder::new(forward).context("Cannot build forwarder")?;
            log::info!("Forwarding records to {}", forwarder.write_url());
            pump::RecordSink::Forward(forwarder)
        }
        None => pump::RecordSink::Stdout,
    };

    let mut engine = IngestionEngine::new(engine_config)?;
    engine.start().await?;
    match engine.local_addr() {
        Some(addr) => log::info!("Accepting clients on {}", addr),
        None => log::warn!("Not accepting clients; only already admitted connections are drained"),
    }

    let (shutdown_tx, _) = tokio::sync::broadcast::channel(1);
    let pump_handle = tokio::spawn(pump::run(
        engine,
        sink,
        config.poll_interval(),
        shutdown_tx.subscribe(),
    ));

    // Wait for shutdown signal
    tokio::select! {
        _ = signal::ctrl_c() => {
            log::info!("Ctrl-C received, initiating shutdown.");
        }
        _ = async {
            #[cfg(unix)]
            {
                match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                    Ok(mut term_signal) => {
                        term_signal.recv().await;
                        log::info!("SIGTERM received, initiating shutdown.");
                    }
                    Err(e) => {
                        log::warn!("Cannot install SIGTERM handler: {}", e);
                        std::future::pending::<()>().await;
                    }
                }
            }
            #[cfg(not(unix))]
            {
                std::future::pending::<()>().await;
            }
        } => {}
    }

    let _ = shutdown_tx.send(());
    let stats = pump_handle.await?;

    log::info!("Shutdown complete after {} record(s).", stats.records);
    Ok(())
}
