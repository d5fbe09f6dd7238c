use std::collections::HashMap;
use std::sync::Arc;

use stream_watch::config::{AppPaths, WatcherConfig};
use stream_watch::logging;
use stream_watch::reader::{HttpPageReader, load_profiles};
use stream_watch::scheduler::Watcher;
use stream_watch::store::FileStore;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let paths = AppPaths::from_env();
    let (logging_config, _log_guard) = logging::init_logging(&paths.log_dir)?;
    if let Some(directive) = &paths.log_filter {
        if let Err(e) = logging_config.set_filter(directive) {
            warn!(error = %e, "Ignoring STREAMWATCH_LOG_FILTER");
        }
    }
    info!(
        filter = %logging_config.get_filter(),
        log_dir = %logging_config.log_dir().display(),
        "Logging initialized"
    );

    let config = WatcherConfig::from_env()?;

    let profiles = match &paths.profiles {
        Some(path) => load_profiles(path).await?,
        None => {
            warn!("STREAMWATCH_PROFILES is not set, no website can be read");
            HashMap::new()
        }
    };
    let reader = HttpPageReader::new(profiles)?;
    info!(profiles = reader.profile_count(), "Page reader ready");

    let store = FileStore::new(&paths.data_dir);
    info!(data_dir = %store.root().display(), "Using data directory");

    let watcher = Arc::new(Watcher::new(config, Arc::new(reader), Arc::new(store)));
    let cancel_token = watcher.cancellation_token();

    logging_config.start_retention_cleanup(cancel_token.clone());

    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl-C, shutting down");
                cancel_token.cancel();
            }
            Err(e) => error!(error = %e, "Failed to listen for Ctrl-C"),
        }
    });

    let report = watcher.run().await?;
    info!(
        persisted = report.persisted_targets,
        stopped = report.stopped_targets,
        drained = report.drained,
        "stream-watch exited"
    );

    Ok(())
}
