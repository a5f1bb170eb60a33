use anyhow::{bail, Result};
use chrono::Utc;
use clap::Parser;
use lib_ingest::{EngineConfig, IngestionEngine};
use std::time::{Duration, Instant};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio::time::sleep;

#[derive(Parser, Debug)]
#[clap(author, version, about = "Drives an in-process ingestion engine with concurrent TCP clients", long_about = None)]
struct Args {
    /// Number of concurrent client connections
    #[clap(short, long, default_value_t = 50)]
    connections: usize,

    /// Lines written by each client
    #[clap(short, long, default_value_t = 1000)]
    lines: usize,

    /// Lines read per connection per poll cycle
    #[clap(short, long, default_value_t = 10)]
    batch_cap: usize,

    /// Milliseconds between poll cycles
    #[clap(short, long, default_value_t = 5)]
    poll_interval_ms: u64,

    /// Seconds between progress reports
    #[clap(short, long, default_value_t = 1)]
    report_interval_secs: u64,

    /// Give up if not every line has been ingested after this many seconds
    #[clap(short, long, default_value_t = 120)]
    timeout_secs: u64,
}

type ClientTask = JoinHandle<std::io::Result<()>>;

/// Healthy clients hold their socket open until aborted, so any client task that
/// has finished stopped early. Removes the first such task and describes why it ended.
async fn finished_client(clients: &mut Vec<ClientTask>) -> Option<anyhow::Error> {
    let pos = clients.iter().position(|c| c.is_finished())?;
    let failure = match clients.swap_remove(pos).await {
        Ok(Err(e)) => anyhow::anyhow!("Client failed: {}", e),
        Err(e) => anyhow::anyhow!("Client task ended abnormally: {}", e),
        Ok(Ok(())) => anyhow::anyhow!("Client ended early"),
    };
    Some(failure)
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let config = EngineConfig::new("throughput")
        .with_listen_address("127.0.0.1")
        .with_port(0)
        .with_batch_cap(args.batch_cap);
    let mut engine = IngestionEngine::new(config)?;
    engine.start().await?;
    let addr = engine
        .local_addr()
        .ok_or_else(|| anyhow::anyhow!("Engine is not listening"))?;

    println!(
        "Engine on {}: {} client(s) x {} line(s), batch cap {}",
        addr, args.connections, args.lines, args.batch_cap
    );

    let expected = args.connections * args.lines;
    let started = Instant::now();

    let mut clients = Vec::with_capacity(args.connections);
    for client_id in 0..args.connections {
        let lines = args.lines;
        clients.push(tokio::spawn(async move {
            let mut stream = TcpStream::connect(addr).await?;
            for seq in 0..lines {
                let line = format!("put load.c{} {} {}\n", client_id, Utc::now().timestamp_millis(), seq);
                stream.write_all(line.as_bytes()).await?;
            }
            stream.flush().await?;
            // Hold the socket open until the engine has drained it.
            sleep(Duration::from_secs(3600)).await;
            Ok::<_, std::io::Error>(())
        }));
    }

    let mut received = 0usize;
    let mut cycles = 0u64;
    let mut last_report = Instant::now();
    let mut since_report = 0usize;
    let report_every = Duration::from_secs(args.report_interval_secs.max(1));
    let deadline = started + Duration::from_secs(args.timeout_secs);

    while received < expected {
        if let Some(failure) = finished_client(&mut clients).await {
            for client in &clients {
                client.abort();
            }
            bail!("{} after {} record(s)", failure, received);
        }
        if Instant::now() >= deadline {
            for client in &clients {
                client.abort();
            }
            bail!(
                "Timed out after {}s with {} of {} record(s) ingested",
                args.timeout_secs,
                received,
                expected
            );
        }

        if let Some(records) = engine.poll() {
            received += records.len();
            since_report += records.len();
        }
        cycles += 1;

        if last_report.elapsed() >= report_every {
            let rate = since_report as f64 / last_report.elapsed().as_secs_f64();
            println!(
                "----- {} / {} records, {:.0} rec/s, {} connection(s) -----",
                received,
                expected,
                rate,
                engine.connection_count()
            );
            last_report = Instant::now();
            since_report = 0;
        }

        sleep(Duration::from_millis(args.poll_interval_ms)).await;
    }

    let elapsed = started.elapsed();
    println!("\n----- Summary -----");
    println!("Records:   {}", received);
    println!("Cycles:    {}", cycles);
    println!("Elapsed:   {:.3}s", elapsed.as_secs_f64());
    println!("Rate:      {:.0} rec/s", received as f64 / elapsed.as_secs_f64());
    println!("-------------------");

    for client in clients {
        client.abort();
    }
    engine.stop().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_failed_client_is_reported() {
        // Bind then drop to get a port nothing listens on.
        let addr = {
            let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap()
        };
        let mut clients: Vec<ClientTask> = vec![
            tokio::spawn(async {
                sleep(Duration::from_secs(3600)).await;
                Ok(())
            }),
            tokio::spawn(async move { TcpStream::connect(addr).await.map(|_| ()) }),
        ];
        while !clients[1].is_finished() {
            sleep(Duration::from_millis(5)).await;
        }

        let failure = finished_client(&mut clients).await.unwrap();
        assert!(failure.to_string().starts_with("Client failed"));
        assert_eq!(clients.len(), 1);
        assert!(finished_client(&mut clients).await.is_none());
        clients[0].abort();
    }
}
