use lib_ingest::{HttpForwarder, IngestionEngine, Record};
use std::io::Write;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{interval, MissedTickBehavior};

/// Where polled records go.
pub enum RecordSink {
    /// One JSON object per line on stdout.
    Stdout,
    Forward(HttpForwarder),
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PumpStats {
    pub cycles: u64,
    pub records: u64,
    pub delivered: u64,
    pub failed_batches: u64,
}

impl RecordSink {
    async fn deliver(&self, records: &[Record], stats: &mut PumpStats) {
        match self {
            RecordSink::Stdout => {
                let stdout = std::io::stdout();
                let mut out = stdout.lock();
                for record in records {
                    let line = match serde_json::to_string(record) {
                        Ok(line) => line,
                        Err(e) => {
                            log::error!("Failed to serialize record: {}", e);
                            continue;
                        }
                    };
                    if let Err(e) = writeln!(out, "{}", line) {
                        log::error!("Failed to write record to stdout: {}", e);
                        stats.failed_batches += 1;
                        return;
                    }
                    stats.delivered += 1;
                }
            }
            RecordSink::Forward(forwarder) => match forwarder.put(records).await {
                Ok(sent) => stats.delivered += sent as u64,
                Err(e) => {
                    log::error!("Forwarding batch of {} record(s) failed: {}", records.len(), e);
                    stats.failed_batches += 1;
                }
            },
        }
    }
}

/// Polls `engine` every `every` until a shutdown is broadcast, then stops the
/// engine and drains one last cycle.
pub async fn run(
    mut engine: IngestionEngine,
    sink: RecordSink,
    every: Duration,
    mut shutdown: broadcast::Receiver<()>,
) -> PumpStats {
    let mut stats = PumpStats::default();
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                log::info!("Pump received shutdown signal.");
                break;
            }
            _ = ticker.tick() => {
                cycle(&engine, &sink, &mut stats).await;
            }
        }
    }

    engine.stop().await;
    cycle(&engine, &sink, &mut stats).await;

    log::info!(
        "Pump finished: {} cycle(s), {} record(s), {} delivered, {} failed batch(es)",
        stats.cycles,
        stats.records,
        stats.delivered,
        stats.failed_batches
    );
    stats
}

async fn cycle(engine: &IngestionEngine, sink: &RecordSink, stats: &mut PumpStats) {
    stats.cycles += 1;
    if let Some(records) = engine.poll() {
        stats.records += records.len() as u64;
        sink.deliver(&records, stats).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lib_ingest::EngineConfig;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_pump_drains_until_shutdown() {
        let config = EngineConfig::new("metrics")
            .with_listen_address("127.0.0.1")
            .with_port(0)
            .with_accept_timeout_ms(20);
        let mut engine = IngestionEngine::new(config).unwrap();
        engine.start().await.unwrap();
        let addr = engine.local_addr().unwrap();

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let pump = tokio::spawn(run(engine, RecordSink::Stdout, Duration::from_millis(10), shutdown_rx));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"put cpu 1 1\nput cpu 2 2\n").await.unwrap();
        sleep(Duration::from_millis(150)).await;

        shutdown_tx.send(()).unwrap();
        let stats = pump.await.unwrap();
        assert!(stats.cycles >= 2);
        assert_eq!(stats.records, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.failed_batches, 0);
    }

    #[tokio::test]
    async fn test_failed_forward_is_counted_not_fatal() {
        let port = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let mut forward = lib_ingest::ForwarderConfig::new(format!("127.0.0.1:{}", port));
        forward.timeout = Duration::from_secs(1);
        let sink = RecordSink::Forward(HttpForwarder::new(forward).unwrap());

        let mut stats = PumpStats::default();
        sink.deliver(&[Record::new("metrics", "put cpu 1 1")], &mut stats).await;
        assert_eq!(stats.delivered, 0);
        assert_eq!(stats.failed_batches, 1);
    }
}
