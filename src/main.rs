use archsync_lib::config::resolve_data_dir;
use archsync_lib::logging::{get_log_dir, LogConfig, SizeRotatingWriter};
use archsync_lib::AppState;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Set up file (and in debug builds console) logging.
/// The returned guard flushes the file writer when dropped.
fn init_logging() -> Option<WorkerGuard> {
    let data_dir = resolve_data_dir();
    let config = LogConfig::load(&data_dir);

    if !config.enabled {
        let _ = tracing::subscriber::set_global_default(tracing_subscriber::registry());
        return None;
    }

    let env_filter = EnvFilter::builder()
        .with_default_directive(config.tracing_level().into())
        .from_env_lossy()
        .add_directive("sqlx=warn".parse().unwrap_or_else(|_| config.tracing_level().into()));

    let log_dir = get_log_dir(&data_dir);
    match SizeRotatingWriter::new(&log_dir, config.max_size_mb) {
        Ok(file_writer) => {
            let (writer, guard) = tracing_appender::non_blocking(file_writer);
            let file_layer = tracing_subscriber::fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);

            #[cfg(debug_assertions)]
            {
                let console_layer = tracing_subscriber::fmt::layer().with_target(false);
                let subscriber = tracing_subscriber::registry()
                    .with(env_filter)
                    .with(file_layer)
                    .with(console_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            #[cfg(not(debug_assertions))]
            {
                let subscriber = tracing_subscriber::registry().with(env_filter).with(file_layer);
                let _ = tracing::subscriber::set_global_default(subscriber);
            }

            Some(guard)
        }
        Err(e) => {
            // no log file, fall back to stderr
            let _ = tracing_subscriber::fmt().with_env_filter(env_filter).try_init();
            tracing::warn!("could not open log file in {}: {}", log_dir.display(), e);
            None
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_logging();

    let state = AppState::new().await?;
    let dispatcher = state.dispatcher.clone();
    let shutdown = state.shutdown.clone();
    let ticker = tokio::spawn(async move { dispatcher.run_loop(shutdown).await });

    tokio::signal::ctrl_c().await?;
    tracing::info!("interrupt received");

    state.cleanup().await;
    let _ = ticker.await;
    Ok(())
}
