//! Tracing setup driven by `AMUX_LOG_LEVEL`, `AMUX_LOG_FILE`, and
//! `AMUX_NO_COLOR`.

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

/// Initialize the global subscriber. Safe to call more than once; later
/// calls are no-ops.
pub fn init() {
    let level = std::env::var("AMUX_LOG_LEVEL").unwrap_or_else(|_| "warn".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("warn"));
    let no_color = std::env::var("AMUX_NO_COLOR").as_deref() == Ok("1");

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_ansi(!no_color)
        .with_target(false);

    if let Ok(path) = std::env::var("AMUX_LOG_FILE")
        && !path.is_empty()
    {
        match std::fs::OpenOptions::new().create(true).append(true).open(&path) {
            Ok(file) => {
                let _ = builder.with_ansi(false).with_writer(Arc::new(file)).try_init();
                return;
            }
            Err(err) => eprintln!("amux: cannot open log file {path}: {err}"),
        }
    }
    let _ = builder.with_writer(std::io::stderr).try_init();
}
