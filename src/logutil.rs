//! Logging setup and helpers for rendering mesh identifiers in log lines.

use crate::config::Config;

/// Meshtastic's node id notation, e.g. `!1a2b3c4d`.
pub fn node_label(node: u32) -> String {
    format!("!{:08x}", node)
}

/// Hex preview of at most `max` bytes, with a trailing `…` when truncated.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    let shown = &data[..data.len().min(max)];
    let mut out = hex::encode(shown);
    if data.len() > max {
        out.push('…');
    }
    out
}

/// Initialise `env_logger`.
///
/// `-v` raises the level to debug and `-vv` to trace; otherwise the configured level
/// applies. With a log file configured, lines are appended there and echoed to the
/// console only when stdout is a terminal.
pub fn init_logging(config: Option<&Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    let configured = config
        .and_then(|c| c.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(level);
    // sled is chatty at debug
    builder.filter_module("sled", log::LevelFilter::Warn);

    let file = config
        .and_then(|c| c.logging.file.as_deref())
        .and_then(|path| {
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .ok()
        });

    match file {
        Some(f) => {
            let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
            let is_tty = atty::is(atty::Stream::Stdout);
            builder.format(move |fmt, record| {
                let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
                let line = format!("{} [{}] {}", ts, record.level(), record.args());
                if let Ok(mut guard) = write_mutex.lock() {
                    let _ = writeln!(guard, "{}", line);
                }
                if is_tty {
                    writeln!(fmt, "{}", line)
                } else {
                    Ok(())
                }
            });
        }
        None => {
            builder.format(|fmt, record| {
                writeln!(
                    fmt,
                    "{} [{}] {}",
                    chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                    record.level(),
                    record.args()
                )
            });
        }
    }
    let _ = builder.try_init();
}
