use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

/// Log files are named `server_ingest_<topic>_<timestamp>.log`, so several
/// servers ingesting different topics can share one log directory.
pub fn setup_logging(log_dir: &Path, log_level: &str, topic: &str) -> Result<()> {
    if !log_dir.exists() {
        fs::create_dir_all(log_dir)?;
    }

    let prefix = log_file_prefix(topic);
    cleanup_old_logs(log_dir, &prefix)?;

    let log_path = log_dir.join(format!(
        "{}{}.log",
        prefix,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    ));

    let topic_tag = topic.to_string();
    fern::Dispatch::new()
        .format(move |out, message, record| {
            out.finish(format_args!(
                "{}[{}][{}][{}] {}",
                chrono::Local::now().format("[%Y-%m-%d %H:%M:%S%.3f]"),
                topic_tag,
                record.target(),
                record.level(),
                message
            ))
        })
        .level(parse_level(log_level))
        .chain(std::io::stdout())
        .chain(fern::log_file(&log_path)?)
        .apply()?;

    log::info!("Logging topic '{}' to {}", topic, log_path.display());
    Ok(())
}

/// `server_ingest_<topic>_`, with anything outside `[A-Za-z0-9_.-]` in the
/// topic replaced by `_`.
fn log_file_prefix(topic: &str) -> String {
    let safe: String = topic
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.') { c } else { '_' })
        .collect();
    format!("server_ingest_{}_", safe)
}

fn parse_level(log_level: &str) -> log::LevelFilter {
    match log_level.to_lowercase().as_str() {
        "trace" => log::LevelFilter::Trace,
        "debug" => log::LevelFilter::Debug,
        "warn" => log::LevelFilter::Warn,
        "error" => log::LevelFilter::Error,
        "off" => log::LevelFilter::Off,
        _ => log::LevelFilter::Info,
    }
}

/// Keeps only the newest `.log` file starting with `prefix`; other topics'
/// files are left alone.
fn cleanup_old_logs(log_dir: &Path, prefix: &str) -> Result<()> {
    let mut entries: Vec<(SystemTime, PathBuf)> = fs::read_dir(log_dir)?
        .filter_map(|res| res.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "log"))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with(prefix))
        })
        .map(|p| {
            let modified = fs::metadata(&p)
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, p)
        })
        .collect();

    // Newest first
    entries.sort_by(|a, b| b.0.cmp(&a.0));

    for (_, path) in entries.iter().skip(1) {
        if let Err(e) = fs::remove_file(path) {
            eprintln!("Failed to delete old log file {:?}: {}", path, e);
        }
    }

    Ok(())
}
