use std::fs::OpenOptions;

use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

/// Env var naming a file that receives debug-level logs
pub const LOG_FILE_ENV: &str = "LIVECHAT_LOG_FILE";

pub fn init_tracing() {
    init_tracing_with_service("livechat");
}

/// Install the global subscriber: stderr filtered by `RUST_LOG` (default
/// `info`), plus a debug-level file layer when `LIVECHAT_LOG_FILE` is set.
pub fn init_tracing_with_service(service_name: &str) {
    let file_logging = std::env::var(LOG_FILE_ENV).ok();

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    if let Some(log_path) = file_logging {
        let file = match OpenOptions::new().create(true).append(true).open(&log_path) {
            Ok(file) => file,
            Err(e) => {
                eprintln!("Failed to open log file {log_path}: {e}");
                init_stderr_only(env_filter);
                return;
            }
        };

        let file_layer = fmt::layer()
            .with_writer(file)
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_filter(tracing_subscriber::filter::LevelFilter::DEBUG);

        // The terminal belongs to the interactive client, so only the file gets output
        let _ = tracing_subscriber::registry().with(file_layer).try_init();
        tracing::info!(service = service_name, "file logging enabled: {}", log_path);
    } else {
        init_stderr_only(env_filter);
        tracing::debug!(service = service_name, "tracing initialized");
    }
}

fn init_stderr_only(env_filter: EnvFilter) {
    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_filter(env_filter);
    let _ = tracing_subscriber::registry().with(stderr_layer).try_init();
}
