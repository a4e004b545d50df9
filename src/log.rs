use std::fs::File;

use tracing::level_filters::LevelFilter;
use tracing::warn;
use tracing_subscriber::{fmt::format::FmtSpan, EnvFilter};

use crate::utils::error::StorageError;

/// Sets up the tracing subscriber.
///
/// Debug builds log to stdout filtered by `RUST_LOG` on top of `tournament_engine=info`. Release
/// builds only log errors, to `debug.log`.
pub fn setup_tracing() -> Result<(), anyhow::Error> {
    if cfg!(debug_assertions) {
        let filter = EnvFilter::from_default_env()
            .add_directive("tournament_engine=info".parse()?)
            .add_directive("tournament_admin=info".parse()?);

        tracing_subscriber::fmt::fmt()
            .with_env_filter(filter)
            .with_span_events(FmtSpan::NONE)
            .pretty()
            .init();

        return Ok(());
    }

    let log_file = File::create("debug.log")?;

    // Set up tracing with a filter that only logs errors in production
    tracing_subscriber::fmt::fmt()
        .with_span_events(FmtSpan::NONE)
        .with_max_level(LevelFilter::ERROR)
        .with_writer(log_file)
        .pretty()
        .init();

    Ok(())
}

/// Logs a failed best-effort cleanup. These never fail the surrounding call; whatever is left
/// behind is picked up by the retention sweep of the object store.
pub fn cleanup_failed(purpose: &str, key: &str, error: &StorageError) {
    warn!(key, error = %error, "Unable to delete {} object", purpose);
}
