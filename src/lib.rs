pub mod activity;
pub mod codec;
pub mod config_sync;
pub mod core;
pub mod discovery;
pub mod network;
pub mod peer;
pub mod propagator;
pub mod protocol;
pub mod router;
pub mod settings;
pub mod state;
pub mod storage;
pub mod transport;

use std::path::Path;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

pub use network::{NetworkError, NetworkHandle};
pub use peer::PeerId;
pub use settings::Settings;
pub use state::{AppState, Collaborators};

const LOG_FILE_PREFIX: &str = "breaksync.log";

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    #[error("failed to configure logger: {0}")]
    Configure(String),
}

/// Installs the global subscriber. `RUST_LOG` overrides the default `info`
/// filter. With `log_dir` set, output goes to a daily-rolling file there
/// and the returned guard must be kept alive until exit.
pub fn init_logging(log_dir: Option<&Path>) -> Result<Option<WorkerGuard>, LogError> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(writer)
                .try_init()
                .map_err(|e| LogError::Configure(e.to_string()))?;
            Ok(Some(guard))
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .try_init()
                .map_err(|e| LogError::Configure(e.to_string()))?;
            Ok(None)
        }
    }
}
